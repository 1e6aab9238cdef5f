// src/types.rs
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::entry_point::RevertReason;

/// A user operation as accepted by the entry point's `simulateValidation` and
/// `handleOps`. Field order follows the on-chain struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster: Option<Address>,
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Paymaster as the entry point sees it; no paymaster is the zero address.
    pub fn paymaster_or_zero(&self) -> Address {
        self.paymaster.unwrap_or_else(Address::zero)
    }
}

/// An operation that passed `simulateValidation`. Only the simulator creates
/// these, so holding one means the operation was simulated at `simulated_at`.
#[derive(Debug, Clone)]
pub struct ValidatedOperation {
    request_id: H256,
    operation: UserOperation,
    pre_op_gas: U256,
    prefund: U256,
    simulated_at: Instant,
}

impl ValidatedOperation {
    pub(crate) fn new(
        request_id: H256,
        operation: UserOperation,
        pre_op_gas: U256,
        prefund: U256,
    ) -> Self {
        Self {
            request_id,
            operation,
            pre_op_gas,
            prefund,
            simulated_at: Instant::now(),
        }
    }

    pub fn request_id(&self) -> H256 {
        self.request_id
    }

    pub fn operation(&self) -> &UserOperation {
        &self.operation
    }

    pub fn pre_op_gas(&self) -> U256 {
        self.pre_op_gas
    }

    pub fn prefund(&self) -> U256 {
        self.prefund
    }

    pub fn simulated_at(&self) -> Instant {
        self.simulated_at
    }
}

/// A simulation the entry point reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub request_id: H256,
    pub reason: RevertReason,
}

impl Rejection {
    pub fn reason(&self) -> String {
        self.reason.message()
    }
}

/// Result of a completed simulation. Transport failures are not a variant:
/// the simulator returns them on the `Err` side.
#[derive(Debug, Clone)]
pub enum SimulationOutcome {
    Accepted(ValidatedOperation),
    Rejected(Rejection),
}

/// What happened to a broadcast batch transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// The node accepted the transaction for mining.
    Submitted { tx_hash: H256, sequence: U256 },
    /// The broadcast was attempted but its acceptance is unknown. The sequence
    /// number stays consumed; poll for `tx_hash` instead of resubmitting blindly.
    Indeterminate {
        tx_hash: H256,
        sequence: U256,
        reason: String,
    },
}

impl SubmissionOutcome {
    pub fn tx_hash(&self) -> H256 {
        match self {
            SubmissionOutcome::Submitted { tx_hash, .. } => *tx_hash,
            SubmissionOutcome::Indeterminate { tx_hash, .. } => *tx_hash,
        }
    }

    pub fn sequence(&self) -> U256 {
        match self {
            SubmissionOutcome::Submitted { sequence, .. } => *sequence,
            SubmissionOutcome::Indeterminate { sequence, .. } => *sequence,
        }
    }
}

/// Per-operation result of a relay cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Submitted {
        tx_hash: H256,
        sequence: U256,
    },
    Rejected {
        reason: String,
    },
    /// Simulation could not complete; validity is unknown and the operation
    /// was left out of the batch.
    Unknown {
        error: String,
    },
    Indeterminate {
        tx_hash: H256,
        sequence: U256,
        reason: String,
    },
    /// Simulation passed but the batch transaction was not broadcast.
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub request_id: H256,
    pub sender: Address,
    #[serde(flatten)]
    pub status: OperationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    /// One entry per submitted operation, in submission order.
    pub results: Vec<OperationResult>,
    /// Batch transaction, if one was broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<SubmissionOutcome>,
}

impl RelayReport {
    pub fn status_of(&self, request_id: H256) -> Option<&OperationStatus> {
        self.results
            .iter()
            .find(|result| result.request_id == request_id)
            .map(|result| &result.status)
    }
}
