// src/error.rs
use ethers::types::{Bytes, H256, U256};
use thiserror::Error;

/// The chain could not be asked, or its answer could not be read. The
/// outcome of whatever was being asked is unknown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Ethereum provider error: {0}")]
    Rpc(String),

    #[error("Timed out waiting for the Ethereum provider")]
    Timeout,

    #[error("Malformed provider response: {0}")]
    Decode(String),
}

/// Failure of a non-broadcasting contract call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Call reverted: {0}")]
    Reverted(Bytes),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure of `eth_sendRawTransaction`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The node answered and refused the transaction.
    #[error("Transaction rejected by node: {0}")]
    Rejected(String),

    /// The request may or may not have reached the node.
    #[error("Broadcast outcome unknown: {0}")]
    Indeterminate(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Sequence manager halted: {0}")]
    Halted(String),

    #[error("Release of sequence {number} out of order (most recent reservation: {expected:?})")]
    OutOfOrderRelease { number: U256, expected: Option<U256> },

    #[error("Sequence {0} is not reserved")]
    NotReserved(U256),

    #[error("Failed to read relayer sequence from chain: {0}")]
    Sync(TransportError),
}

impl SequenceError {
    /// Everything except a failed chain read leaves the manager halted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SequenceError::Sync(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Batch is empty")]
    EmptyBatch,

    #[error("Simulation of {request_id:?} is stale: {reason}")]
    StaleSimulation { request_id: H256, reason: String },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Failed to resolve batch fees: {0}")]
    Fees(TransportError),

    #[error("Failed to sign batch transaction: {0}")]
    Signing(String),

    #[error("Transaction rejected by node: {0}")]
    Rejected(String),

    #[error("Deadline passed before broadcast")]
    Cancelled,

    #[error("Submission task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

impl SubmitError {
    pub fn is_fatal(&self) -> bool {
        match self {
            SubmitError::Sequence(err) => err.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid UserOperation: {0}")]
    InvalidInput(String),

    #[error("Relayer halted: {0}")]
    Fatal(SequenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
