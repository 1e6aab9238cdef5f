// src/submitter.rs
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::chain::EntryPointApi;
use crate::entry_point;
use crate::error::{BroadcastError, SubmitError, TransportError};
use crate::fees::{BatchFees, FeePolicy, NetworkFees};
use crate::sequence::SequenceManager;
use crate::types::{SubmissionOutcome, UserOperation, ValidatedOperation};

/// Gas charged once per transaction on top of the operations' own limits.
pub const INTRINSIC_GAS: u64 = 21_000;

/// Decides whether a simulation result is still recent enough to submit.
pub trait FreshnessPolicy: Send + Sync {
    fn check(&self, op: &ValidatedOperation) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy)]
pub struct MaxSimulationAge(pub Duration);

impl FreshnessPolicy for MaxSimulationAge {
    fn check(&self, op: &ValidatedOperation) -> Result<(), String> {
        let age = op.simulated_at().elapsed();
        if age > self.0 {
            return Err(format!(
                "simulated {}ms ago, limit is {}ms",
                age.as_millis(),
                self.0.as_millis()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitterConfig {
    /// Receives the fees the entry point collects from the batch.
    pub beneficiary: Address,
    pub chain_id: u64,
    pub gas_overhead: U256,
    /// Send pre-EIP-1559 transactions priced at `max_fee_per_gas`.
    pub legacy_transactions: bool,
}

/// Builds, signs and broadcasts `handleOps` transactions from the relayer
/// account. All submissions in the process go through one lock, from sequence
/// reservation to the end of the broadcast.
pub struct BatchSubmitter<E> {
    chain: Arc<E>,
    wallet: Arc<LocalWallet>,
    sequence: Arc<SequenceManager<E>>,
    fees: Arc<dyn FeePolicy>,
    freshness: Arc<dyn FreshnessPolicy>,
    config: SubmitterConfig,
    submission: Arc<Mutex<()>>,
}

impl<E> Clone for BatchSubmitter<E> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            wallet: Arc::clone(&self.wallet),
            sequence: Arc::clone(&self.sequence),
            fees: Arc::clone(&self.fees),
            freshness: Arc::clone(&self.freshness),
            config: self.config,
            submission: Arc::clone(&self.submission),
        }
    }
}

impl<E: EntryPointApi + 'static> BatchSubmitter<E> {
    pub fn new(chain: Arc<E>, wallet: LocalWallet, config: SubmitterConfig) -> Self {
        let sequence = SequenceManager::new(Arc::clone(&chain), wallet.address());
        Self {
            chain,
            wallet: Arc::new(wallet),
            sequence: Arc::new(sequence),
            fees: Arc::new(NetworkFees),
            freshness: Arc::new(MaxSimulationAge(Duration::from_secs(60))),
            config,
            submission: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_fee_policy(mut self, fees: impl FeePolicy + 'static) -> Self {
        self.fees = Arc::new(fees);
        self
    }

    pub fn with_freshness(mut self, freshness: impl FreshnessPolicy + 'static) -> Self {
        self.freshness = Arc::new(freshness);
        self
    }

    pub fn sequence(&self) -> &SequenceManager<E> {
        &self.sequence
    }

    pub fn relayer(&self) -> Address {
        self.wallet.address()
    }

    pub fn beneficiary(&self) -> Address {
        self.config.beneficiary
    }

    /// Submits `batch` as one `handleOps` transaction.
    ///
    /// `Ok` means the transaction was broadcast (or may have been); it says
    /// nothing about whether each operation executes successfully on chain.
    pub async fn submit(
        &self,
        batch: Vec<ValidatedOperation>,
        deadline: Option<Instant>,
    ) -> Result<SubmissionOutcome, SubmitError> {
        if batch.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        self.check_freshness(&batch)?;

        // Runs detached: dropping this future must not skip confirm/release.
        let submitter = self.clone();
        tokio::spawn(async move { submitter.submit_batch(batch, deadline).await })
            .await
            .map_err(|e| SubmitError::Aborted(e.to_string()))?
    }

    fn check_freshness(&self, batch: &[ValidatedOperation]) -> Result<(), SubmitError> {
        for validated in batch {
            self.freshness
                .check(validated)
                .map_err(|reason| SubmitError::StaleSimulation {
                    request_id: validated.request_id(),
                    reason,
                })?;
        }
        Ok(())
    }

    async fn submit_batch(
        &self,
        batch: Vec<ValidatedOperation>,
        deadline: Option<Instant>,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let ops: Vec<UserOperation> = batch.iter().map(|v| v.operation().clone()).collect();
        let gas_limit = self.gas_limit(&ops)?;
        let fees = self.fees.batch_fees(&ops, self.chain.as_ref());
        let fees = match deadline {
            Some(deadline) => timeout_at(deadline, fees)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => fees.await,
        }
        .map_err(SubmitError::Fees)?;
        let calldata = entry_point::encode_handle_ops(&ops, self.config.beneficiary);

        let _serial = match deadline {
            Some(deadline) => timeout_at(deadline, self.submission.lock())
                .await
                .map_err(|_| SubmitError::Cancelled)?,
            None => self.submission.lock().await,
        };
        // The wait for the lock may have outlived the simulations.
        self.check_freshness(&batch)?;
        let sequence = self.sequence.reserve_next(deadline).await?;
        let tx = self.build_transaction(sequence, calldata, gas_limit, &fees);

        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(signature) => signature,
            Err(e) => {
                self.sequence.release(sequence).await?;
                return Err(SubmitError::Signing(e.to_string()));
            }
        };
        let raw = tx.rlp_signed(&signature);
        let tx_hash = tx.hash(&signature);

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.sequence.release(sequence).await?;
            return Err(SubmitError::Cancelled);
        }

        let broadcast = match deadline {
            Some(deadline) => timeout_at(deadline, self.chain.broadcast(raw))
                .await
                .unwrap_or_else(|_| {
                    Err(BroadcastError::Indeterminate(
                        "deadline elapsed during broadcast".to_string(),
                    ))
                }),
            None => self.chain.broadcast(raw).await,
        };

        let request_ids: Vec<String> = batch
            .iter()
            .map(|v| format!("{:?}", v.request_id()))
            .collect();

        match broadcast {
            Ok(accepted_hash) => {
                if accepted_hash != tx_hash {
                    warn!(?accepted_hash, ?tx_hash, "Node reported a different transaction hash");
                }
                self.sequence.confirm(sequence).await?;
                info!(
                    tx_hash = ?accepted_hash,
                    sequence = %sequence,
                    ops = batch.len(),
                    request_ids = ?request_ids,
                    "Batch submitted"
                );
                Ok(SubmissionOutcome::Submitted {
                    tx_hash: accepted_hash,
                    sequence,
                })
            }
            Err(BroadcastError::Rejected(reason)) => {
                self.sequence.release(sequence).await?;
                self.sequence.invalidate().await;
                error!(
                    sequence = %sequence,
                    request_ids = ?request_ids,
                    %reason,
                    "Batch rejected by node"
                );
                Err(SubmitError::Rejected(reason))
            }
            Err(BroadcastError::Indeterminate(reason)) => {
                self.sequence.confirm_tentative(sequence).await?;
                warn!(
                    tx_hash = ?tx_hash,
                    sequence = %sequence,
                    request_ids = ?request_ids,
                    %reason,
                    "Batch broadcast indeterminate"
                );
                Ok(SubmissionOutcome::Indeterminate {
                    tx_hash,
                    sequence,
                    reason,
                })
            }
        }
    }

    fn gas_limit(&self, ops: &[UserOperation]) -> Result<U256, SubmitError> {
        ops.iter().try_fold(self.config.gas_overhead, |total, op| {
            let verification_multiplier = if op.paymaster.is_some() { 3u64 } else { 1 };
            op.verification_gas_limit
                .checked_mul(U256::from(verification_multiplier))
                .and_then(|gas| gas.checked_add(op.call_gas_limit))
                .and_then(|gas| gas.checked_add(op.pre_verification_gas))
                .and_then(|gas| total.checked_add(gas))
                .ok_or_else(|| {
                    SubmitError::InvalidBatch(format!("gas limit overflow for sender {:?}", op.sender))
                })
        })
    }

    fn build_transaction(
        &self,
        sequence: U256,
        calldata: Bytes,
        gas_limit: U256,
        fees: &BatchFees,
    ) -> TypedTransaction {
        let from = self.wallet.address();
        let to = self.chain.address();
        if self.config.legacy_transactions {
            TransactionRequest::new()
                .from(from)
                .to(to)
                .data(calldata)
                .nonce(sequence)
                .gas(gas_limit)
                .gas_price(fees.max_fee_per_gas)
                .chain_id(self.config.chain_id)
                .into()
        } else {
            Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .data(calldata)
                .nonce(sequence)
                .gas(gas_limit)
                .max_fee_per_gas(fees.max_fee_per_gas)
                .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
                .chain_id(self.config.chain_id)
                .into()
        }
    }
}
