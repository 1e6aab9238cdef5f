// src/entry_point.rs
//! Calldata encoding and return/revert decoding for the entry point contract.
//!
//! Only the functions the relayer calls are covered: `simulateValidation`,
//! `handleOps`, `getRequestId` and `balanceOf`.

use std::fmt;

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;

use crate::types::UserOperation;

const USER_OPERATION_TUPLE: &str =
    "(address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,address,bytes,bytes)";

const FAILED_OP_SIGNATURE: &str = "FailedOp(uint256,address,string)";
const ERROR_SIGNATURE: &str = "Error(string)";

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend_from_slice(&abi::encode(tokens));
    Bytes::from(data)
}

/// ABI tuple for `op`, signature included.
pub(crate) fn user_operation_token(op: &UserOperation) -> Token {
    user_operation_token_with_signature(op, op.signature.to_vec())
}

pub(crate) fn user_operation_token_with_signature(op: &UserOperation, signature: Vec<u8>) -> Token {
    Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::Address(op.paymaster_or_zero()),
        Token::Bytes(op.paymaster_data.to_vec()),
        Token::Bytes(signature),
    ])
}

pub fn encode_simulate_validation(op: &UserOperation) -> Bytes {
    with_selector(
        &format!("simulateValidation({USER_OPERATION_TUPLE})"),
        &[user_operation_token(op)],
    )
}

pub fn encode_handle_ops(ops: &[UserOperation], beneficiary: Address) -> Bytes {
    let ops = ops.iter().map(user_operation_token).collect();
    with_selector(
        &format!("handleOps({USER_OPERATION_TUPLE}[],address)"),
        &[Token::Array(ops), Token::Address(beneficiary)],
    )
}

pub fn encode_get_request_id(op: &UserOperation) -> Bytes {
    with_selector(
        &format!("getRequestId({USER_OPERATION_TUPLE})"),
        &[user_operation_token(op)],
    )
}

pub fn encode_balance_of(account: Address) -> Bytes {
    with_selector("balanceOf(address)", &[Token::Address(account)])
}

/// Return values of a successful `simulateValidation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReturn {
    pub pre_op_gas: U256,
    pub prefund: U256,
}

pub fn decode_simulate_validation(data: &[u8]) -> Result<ValidationReturn, abi::Error> {
    let mut tokens = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], data)?.into_iter();
    match (
        tokens.next().and_then(Token::into_uint),
        tokens.next().and_then(Token::into_uint),
    ) {
        (Some(pre_op_gas), Some(prefund)) => Ok(ValidationReturn {
            pre_op_gas,
            prefund,
        }),
        _ => Err(abi::Error::InvalidData),
    }
}

pub fn decode_uint256(data: &[u8]) -> Result<U256, abi::Error> {
    abi::decode(&[ParamType::Uint(256)], data)?
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or(abi::Error::InvalidData)
}

pub fn decode_bytes32(data: &[u8]) -> Result<H256, abi::Error> {
    abi::decode(&[ParamType::FixedBytes(32)], data)?
        .into_iter()
        .next()
        .and_then(Token::into_fixed_bytes)
        .filter(|bytes| bytes.len() == 32)
        .map(|bytes| H256::from_slice(&bytes))
        .ok_or(abi::Error::InvalidData)
}

/// Decoded revert payload of an entry point call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    /// `FailedOp(opIndex, paymaster, reason)` raised by the entry point.
    FailedOp {
        op_index: U256,
        paymaster: Address,
        reason: String,
    },
    /// Plain `require`/`revert` message.
    Error(String),
    /// Anything else, kept verbatim.
    Unknown(Bytes),
}

impl RevertReason {
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 4 {
            return RevertReason::Unknown(Bytes::from(data.to_vec()));
        }
        let (selector, payload) = data.split_at(4);

        if selector == id(FAILED_OP_SIGNATURE) {
            let params = [ParamType::Uint(256), ParamType::Address, ParamType::String];
            if let Ok(tokens) = abi::decode(&params, payload) {
                if let [Token::Uint(op_index), Token::Address(paymaster), Token::String(reason)] =
                    tokens.as_slice()
                {
                    return RevertReason::FailedOp {
                        op_index: *op_index,
                        paymaster: *paymaster,
                        reason: reason.clone(),
                    };
                }
            }
        }

        if selector == id(ERROR_SIGNATURE) {
            if let Ok(tokens) = abi::decode(&[ParamType::String], payload) {
                if let Some(Token::String(message)) = tokens.into_iter().next() {
                    return RevertReason::Error(message);
                }
            }
        }

        RevertReason::Unknown(Bytes::from(data.to_vec()))
    }

    /// Human readable reason, without the op index.
    pub fn message(&self) -> String {
        match self {
            RevertReason::FailedOp { reason, .. } => reason.clone(),
            RevertReason::Error(message) => message.clone(),
            RevertReason::Unknown(data) if data.is_empty() => "reverted without data".to_string(),
            RevertReason::Unknown(data) => format!("unknown revert: {data}"),
        }
    }

    pub fn op_index(&self) -> Option<U256> {
        match self {
            RevertReason::FailedOp { op_index, .. } => Some(*op_index),
            _ => None,
        }
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertReason::FailedOp {
                op_index,
                paymaster,
                reason,
            } => write!(f, "FailedOp({op_index}, {paymaster:?}, {reason})"),
            other => f.write_str(&other.message()),
        }
    }
}
