// src/chain.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::entry_point::{self, ValidationReturn};
use crate::error::{BroadcastError, CallError, TransportError};
use crate::fees::BatchFees;
use crate::types::UserOperation;

/// The deployed entry point and the chain it lives on, as seen by the relayer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntryPointApi: Send + Sync {
    /// Address of the entry point contract.
    fn address(&self) -> Address;

    /// `eth_call` of `simulateValidation(op)` from `caller`. Nothing is broadcast.
    async fn simulate_validation(
        &self,
        caller: Address,
        op: &UserOperation,
    ) -> Result<ValidationReturn, CallError>;

    /// The entry point's own `getRequestId(op)`.
    async fn request_id(&self, op: &UserOperation) -> Result<H256, CallError>;

    /// Deposit held by the entry point for `account`.
    async fn deposit_of(&self, account: Address) -> Result<U256, TransportError>;

    /// Next sequence number of `account`, counting pending transactions.
    async fn sequence_number(&self, account: Address) -> Result<U256, TransportError>;

    /// Fee parameters currently suggested by the node.
    async fn suggested_fees(&self) -> Result<BatchFees, TransportError>;

    /// `eth_sendRawTransaction`.
    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError>;
}

pub struct EthEntryPoint {
    client: Arc<Provider<Http>>,
    address: Address,
}

impl EthEntryPoint {
    pub fn new(eth_rpc_url: &str, address: Address) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(eth_rpc_url)?;
        Ok(Self {
            client: Arc::new(provider),
            address,
        })
    }

    async fn call(&self, from: Option<Address>, data: Bytes) -> Result<Bytes, CallError> {
        let mut request = TransactionRequest::new().to(self.address).data(data);
        if let Some(from) = from {
            request = request.from(from);
        }
        let tx: TypedTransaction = request.into();
        self.client.call(&tx, None).await.map_err(classify_call_error)
    }
}

fn classify_call_error(err: ProviderError) -> CallError {
    if let Some(response) = RpcError::as_error_response(&err) {
        if let Some(data) = response.as_revert_data() {
            return CallError::Reverted(data);
        }
        if response.message.contains("revert") {
            return CallError::Reverted(Bytes::default());
        }
    }
    CallError::Transport(TransportError::Rpc(err.to_string()))
}

/// JSON-RPC internal error; proxies use it for upstream timeouts after forwarding.
const INTERNAL_ERROR: i64 = -32603;

/// Maps a node's error response to `eth_sendRawTransaction`. Only a definite
/// refusal is `Rejected`; the transaction may still be in flight otherwise.
fn classify_broadcast_error(
    code: i64,
    message: &str,
    local_hash: H256,
) -> Result<H256, BroadcastError> {
    let lowered = message.to_lowercase();
    if lowered.contains("already known") {
        return Ok(local_hash);
    }
    if code == INTERNAL_ERROR || lowered.contains("timeout") || lowered.contains("timed out") {
        return Err(BroadcastError::Indeterminate(message.to_string()));
    }
    Err(BroadcastError::Rejected(message.to_string()))
}

fn decode_error(err: ethers::abi::Error) -> CallError {
    CallError::Transport(TransportError::Decode(err.to_string()))
}

#[async_trait]
impl EntryPointApi for EthEntryPoint {
    fn address(&self) -> Address {
        self.address
    }

    async fn simulate_validation(
        &self,
        caller: Address,
        op: &UserOperation,
    ) -> Result<ValidationReturn, CallError> {
        let output = self
            .call(Some(caller), entry_point::encode_simulate_validation(op))
            .await?;
        entry_point::decode_simulate_validation(&output).map_err(decode_error)
    }

    async fn request_id(&self, op: &UserOperation) -> Result<H256, CallError> {
        let output = self
            .call(None, entry_point::encode_get_request_id(op))
            .await?;
        entry_point::decode_bytes32(&output).map_err(decode_error)
    }

    async fn deposit_of(&self, account: Address) -> Result<U256, TransportError> {
        let output = self
            .call(None, entry_point::encode_balance_of(account))
            .await
            .map_err(|e| match e {
                CallError::Transport(e) => e,
                reverted => TransportError::Rpc(reverted.to_string()),
            })?;
        entry_point::decode_uint256(&output).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn sequence_number(&self, account: Address) -> Result<U256, TransportError> {
        self.client
            .get_transaction_count(account, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))
    }

    async fn suggested_fees(&self) -> Result<BatchFees, TransportError> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        Ok(BatchFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError> {
        let local_hash = H256::from(keccak256(&raw));
        match self.client.send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(err) => match RpcError::as_error_response(&err) {
                Some(response) => {
                    let classified =
                        classify_broadcast_error(response.code, &response.message, local_hash);
                    match &classified {
                        Ok(_) => debug!(tx_hash = ?local_hash, "Transaction already in node pool"),
                        Err(BroadcastError::Indeterminate(_)) => {
                            warn!(tx_hash = ?local_hash, code = response.code, error = %response.message, "Node errored after receiving the transaction")
                        }
                        Err(_) => {}
                    }
                    classified
                }
                None => {
                    warn!(tx_hash = ?local_hash, error = %err, "Broadcast failed without a node response");
                    Err(BroadcastError::Indeterminate(err.to_string()))
                }
            },
        }
    }
}
