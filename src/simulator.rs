// src/simulator.rs
use std::sync::Arc;

use ethers::types::{Address, H256};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::chain::EntryPointApi;
use crate::entry_point::RevertReason;
use crate::error::{CallError, TransportError};
use crate::request_id::RequestIdDeriver;
use crate::types::{Rejection, SimulationOutcome, UserOperation, ValidatedOperation};

/// Result of simulating one operation: an outcome, or a transport failure that
/// leaves the operation's validity unknown.
pub type SimulationResult = Result<SimulationOutcome, TransportError>;

/// Dry-runs operations through `simulateValidation`. Holds no mutable state,
/// so clones can simulate in parallel.
pub struct ValidationSimulator<E: ?Sized> {
    chain: Arc<E>,
    relayer: Address,
    request_ids: RequestIdDeriver,
}

impl<E: ?Sized> Clone for ValidationSimulator<E> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            relayer: self.relayer,
            request_ids: self.request_ids,
        }
    }
}

impl<E: EntryPointApi + ?Sized + 'static> ValidationSimulator<E> {
    pub fn new(chain: Arc<E>, relayer: Address, chain_id: u64) -> Self {
        let request_ids = RequestIdDeriver::new(chain.address(), chain_id);
        Self {
            chain,
            relayer,
            request_ids,
        }
    }

    pub fn request_id(&self, op: &UserOperation) -> H256 {
        self.request_ids.derive(op)
    }

    pub async fn simulate(&self, op: UserOperation, deadline: Option<Instant>) -> SimulationResult {
        let request_id = self.request_id(&op);
        let call = self.chain.simulate_validation(self.relayer, &op);
        let result = match deadline {
            Some(deadline) => timeout_at(deadline, call)
                .await
                .unwrap_or(Err(CallError::Transport(TransportError::Timeout))),
            None => call.await,
        };

        match result {
            Ok(validation) => {
                debug!(
                    request_id = ?request_id,
                    sender = ?op.sender,
                    pre_op_gas = %validation.pre_op_gas,
                    prefund = %validation.prefund,
                    "Simulation accepted"
                );
                Ok(SimulationOutcome::Accepted(ValidatedOperation::new(
                    request_id,
                    op,
                    validation.pre_op_gas,
                    validation.prefund,
                )))
            }
            Err(CallError::Reverted(data)) => {
                let reason = RevertReason::decode(&data);
                info!(request_id = ?request_id, sender = ?op.sender, %reason, "Simulation rejected");
                Ok(SimulationOutcome::Rejected(Rejection { request_id, reason }))
            }
            Err(CallError::Transport(err)) => {
                warn!(request_id = ?request_id, sender = ?op.sender, error = %err, "Simulation outcome unknown");
                Err(err)
            }
        }
    }

    /// Simulates every operation concurrently. Returns one result per input,
    /// in input order.
    pub async fn simulate_all(
        &self,
        ops: Vec<UserOperation>,
        deadline: Option<Instant>,
    ) -> Vec<(UserOperation, SimulationResult)> {
        let handles: Vec<_> = ops
            .into_iter()
            .map(|op| {
                let simulator = self.clone();
                let task_op = op.clone();
                let handle =
                    tokio::spawn(async move { simulator.simulate(task_op, deadline).await });
                (op, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (op, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(TransportError::Rpc(format!("simulation task failed: {e}"))));
            results.push((op, result));
        }
        results
    }
}
