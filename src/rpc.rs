// src/rpc.rs
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ethers::types::{Address, Bytes, H256, U256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::{
    ErrorObject, ErrorObjectOwned, INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::chain::EntryPointApi;
use crate::error::{RelayError, TransportError};
use crate::relayer::Relayer;
use crate::sequence::SequenceSnapshot;
use crate::types::{RelayReport, SimulationOutcome, UserOperation};

/// Relay failures that are neither bad input nor a halted relayer.
pub const RELAY_ERROR_CODE: i32 = -32000;

/// A user operation as sent by clients: numbers are decimal strings and byte
/// fields are base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOperationRequest {
    pub sender: Option<String>,
    pub nonce: Option<String>,
    pub init_code: Option<String>,
    pub call_data: Option<String>,
    pub call_gas: Option<String>,
    pub verification_gas: Option<String>,
    pub pre_verification_gas: Option<String>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub paymaster: Option<String>,
    pub paymaster_data: Option<String>,
    pub signature: Option<String>,
}

impl UserOperationRequest {
    pub fn to_user_operation(&self) -> Result<UserOperation, RelayError> {
        Ok(UserOperation {
            sender: parse_address("sender", required("sender", &self.sender)?)?,
            nonce: parse_uint("nonce", required("nonce", &self.nonce)?)?,
            init_code: parse_bytes("init_code", self.init_code.as_deref().unwrap_or_default())?,
            call_data: parse_bytes("call_data", required("call_data", &self.call_data)?)?,
            call_gas_limit: parse_uint("call_gas", required("call_gas", &self.call_gas)?)?,
            verification_gas_limit: parse_uint(
                "verification_gas",
                required("verification_gas", &self.verification_gas)?,
            )?,
            pre_verification_gas: parse_uint(
                "pre_verification_gas",
                required("pre_verification_gas", &self.pre_verification_gas)?,
            )?,
            max_fee_per_gas: parse_uint(
                "max_fee_per_gas",
                required("max_fee_per_gas", &self.max_fee_per_gas)?,
            )?,
            max_priority_fee_per_gas: parse_uint(
                "max_priority_fee_per_gas",
                required("max_priority_fee_per_gas", &self.max_priority_fee_per_gas)?,
            )?,
            paymaster: self
                .paymaster
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| parse_address("paymaster", s))
                .transpose()?,
            paymaster_data: parse_bytes(
                "paymaster_data",
                self.paymaster_data.as_deref().unwrap_or_default(),
            )?,
            signature: parse_bytes("signature", required("signature", &self.signature)?)?,
        })
    }
}

impl From<&UserOperation> for UserOperationRequest {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: Some(format!("{:?}", op.sender)),
            nonce: Some(op.nonce.to_string()),
            init_code: Some(STANDARD.encode(&op.init_code)),
            call_data: Some(STANDARD.encode(&op.call_data)),
            call_gas: Some(op.call_gas_limit.to_string()),
            verification_gas: Some(op.verification_gas_limit.to_string()),
            pre_verification_gas: Some(op.pre_verification_gas.to_string()),
            max_fee_per_gas: Some(op.max_fee_per_gas.to_string()),
            max_priority_fee_per_gas: Some(op.max_priority_fee_per_gas.to_string()),
            paymaster: op.paymaster.map(|p| format!("{p:?}")),
            paymaster_data: Some(STANDARD.encode(&op.paymaster_data)),
            signature: Some(STANDARD.encode(&op.signature)),
        }
    }
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, RelayError> {
    value
        .as_deref()
        .ok_or_else(|| RelayError::InvalidInput(format!("missing {field}")))
}

fn parse_uint(field: &str, value: &str) -> Result<U256, RelayError> {
    U256::from_dec_str(value)
        .map_err(|e| RelayError::InvalidInput(format!("{field} is not a decimal integer: {e}")))
}

fn parse_address(field: &str, value: &str) -> Result<Address, RelayError> {
    value
        .parse::<Address>()
        .map_err(|e| RelayError::InvalidInput(format!("{field} is not an address: {e}")))
}

fn parse_bytes(field: &str, value: &str) -> Result<Bytes, RelayError> {
    STANDARD
        .decode(value)
        .map(Bytes::from)
        .map_err(|e| RelayError::InvalidInput(format!("{field} is not base64: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub hello: String,
    pub bundler_eoa: Address,
    pub beneficiary: Address,
    pub chain_id: u64,
    pub entrypoint: Address,
    pub sequence: SequenceSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResponse {
    pub request_id: H256,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_op_gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefund: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[rpc(server, namespace = "relay")]
pub trait RelayRpc {
    /// Relayer identity, chain and sequence state
    #[method(name = "health")]
    async fn health(&self) -> RpcResult<HealthResponse>;

    /// Simulates the operations and submits the accepted ones as one batch
    #[method(name = "handleOps")]
    async fn handle_ops(&self, user_operations: Vec<UserOperationRequest>) -> RpcResult<RelayReport>;

    /// Simulates a single operation without submitting it
    #[method(name = "simulate")]
    async fn simulate(&self, user_operation: UserOperationRequest) -> RpcResult<SimulationResponse>;

    #[method(name = "getRequestId")]
    async fn get_request_id(&self, user_operation: UserOperationRequest) -> RpcResult<H256>;

    /// Entry point deposit of an account
    #[method(name = "getDeposit")]
    async fn get_deposit(&self, account: Address) -> RpcResult<U256>;
}

pub struct RelayRpcImpl<E> {
    relayer: Arc<Relayer<E>>,
}

impl<E> RelayRpcImpl<E> {
    pub fn new(relayer: Arc<Relayer<E>>) -> Self {
        Self { relayer }
    }
}

pub fn relay_error(err: RelayError) -> ErrorObjectOwned {
    let code = match &err {
        RelayError::InvalidInput(_) => INVALID_PARAMS_CODE,
        RelayError::Fatal(_) => INTERNAL_ERROR_CODE,
        RelayError::Transport(_) => RELAY_ERROR_CODE,
    };
    ErrorObject::owned(code, err.to_string(), None::<()>)
}

fn transport_error(err: TransportError) -> ErrorObjectOwned {
    relay_error(RelayError::Transport(err))
}

fn parse_request(request: &UserOperationRequest) -> Result<UserOperation, ErrorObjectOwned> {
    request.to_user_operation().map_err(relay_error)
}

#[async_trait]
impl<E: EntryPointApi + 'static> RelayRpcServer for RelayRpcImpl<E> {
    async fn health(&self) -> RpcResult<HealthResponse> {
        let status = self.relayer.status().await;
        Ok(HealthResponse {
            hello: "bundler".to_string(),
            bundler_eoa: status.relayer,
            beneficiary: status.beneficiary,
            chain_id: status.chain_id,
            entrypoint: status.entry_point,
            sequence: status.sequence,
        })
    }

    async fn handle_ops(&self, user_operations: Vec<UserOperationRequest>) -> RpcResult<RelayReport> {
        let ops = user_operations
            .iter()
            .map(parse_request)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Received {} user operations", ops.len());

        match self.relayer.relay(ops).await {
            Ok(report) => {
                info!(
                    ops = report.results.len(),
                    tx_hash = ?report.transaction.as_ref().map(|tx| tx.tx_hash()),
                    "Relay cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!("Relay failed: {}", e);
                Err(relay_error(e).into())
            }
        }
    }

    async fn simulate(&self, user_operation: UserOperationRequest) -> RpcResult<SimulationResponse> {
        let op = parse_request(&user_operation)?;
        let response = match self.relayer.simulate(op).await.map_err(transport_error)? {
            SimulationOutcome::Accepted(validated) => SimulationResponse {
                request_id: validated.request_id(),
                accepted: true,
                pre_op_gas: Some(validated.pre_op_gas()),
                prefund: Some(validated.prefund()),
                reason: None,
            },
            SimulationOutcome::Rejected(rejection) => SimulationResponse {
                request_id: rejection.request_id,
                accepted: false,
                pre_op_gas: None,
                prefund: None,
                reason: Some(rejection.reason()),
            },
        };
        Ok(response)
    }

    async fn get_request_id(&self, user_operation: UserOperationRequest) -> RpcResult<H256> {
        let op = parse_request(&user_operation)?;
        Ok(self.relayer.request_id(&op))
    }

    async fn get_deposit(&self, account: Address) -> RpcResult<U256> {
        Ok(self
            .relayer
            .deposit_of(account)
            .await
            .map_err(transport_error)?)
    }
}
