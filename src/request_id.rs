// src/request_id.rs
//! Request identifiers, computed the way the entry point's `getRequestId` does.
//!
//! `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`, where
//! `pack(op)` is the ABI encoding of the operation tuple with an empty
//! signature, minus the leading offset word and the trailing signature
//! length word. The signature never contributes to the identifier.

use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;

use crate::entry_point::user_operation_token_with_signature;
use crate::types::UserOperation;

const WORD: usize = 32;

/// Operation encoding hashed into the request id.
pub fn pack(op: &UserOperation) -> Vec<u8> {
    let encoded = abi::encode(&[user_operation_token_with_signature(op, Vec::new())]);
    // encoded = offset word | tuple head | tuple tail ... | empty signature length word
    encoded[WORD..encoded.len() - WORD].to_vec()
}

pub fn operation_hash(op: &UserOperation) -> H256 {
    H256::from(keccak256(pack(op)))
}

pub fn derive(op: &UserOperation, entry_point: Address, chain_id: U256) -> H256 {
    let encoded = abi::encode(&[
        Token::FixedBytes(operation_hash(op).as_bytes().to_vec()),
        Token::Address(entry_point),
        Token::Uint(chain_id),
    ]);
    H256::from(keccak256(encoded))
}

/// Derives identifiers for one entry point on one chain.
#[derive(Debug, Clone, Copy)]
pub struct RequestIdDeriver {
    entry_point: Address,
    chain_id: U256,
}

impl RequestIdDeriver {
    pub fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id: U256::from(chain_id),
        }
    }

    pub fn derive(&self, op: &UserOperation) -> H256 {
        derive(op, self.entry_point, self.chain_id)
    }
}
