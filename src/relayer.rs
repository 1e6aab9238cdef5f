// src/relayer.rs
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chain::EntryPointApi;
use crate::error::{CallError, RelayError, SubmitError, TransportError};
use crate::fees::{FeeConfig, FixedFees, NetworkFees, OperationFees};
use crate::sequence::{SequenceManager, SequenceSnapshot};
use crate::simulator::{SimulationResult, ValidationSimulator};
use crate::submitter::{BatchSubmitter, MaxSimulationAge, SubmitterConfig, INTRINSIC_GAS};
use crate::types::{
    OperationResult, OperationStatus, RelayReport, SimulationOutcome, SubmissionOutcome,
    UserOperation,
};

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub chain_id: u64,
    /// Defaults to the relayer account.
    pub beneficiary: Option<Address>,
    pub simulation_timeout: Duration,
    pub submission_timeout: Duration,
    pub max_simulation_age: Duration,
    pub fees: FeeConfig,
    pub gas_overhead: U256,
    pub legacy_transactions: bool,
}

impl RelayerConfig {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            beneficiary: None,
            simulation_timeout: Duration::from_secs(10),
            submission_timeout: Duration::from_secs(30),
            max_simulation_age: Duration::from_secs(60),
            fees: FeeConfig::Network,
            gas_overhead: U256::from(INTRINSIC_GAS),
            legacy_transactions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayerStatus {
    pub relayer: Address,
    pub beneficiary: Address,
    pub chain_id: u64,
    pub entry_point: Address,
    pub sequence: SequenceSnapshot,
}

/// Takes operations from callers, simulates them, and submits the accepted
/// ones as a single batch.
pub struct Relayer<E> {
    chain: Arc<E>,
    simulator: ValidationSimulator<E>,
    submitter: BatchSubmitter<E>,
    config: RelayerConfig,
}

impl<E: EntryPointApi + 'static> Relayer<E> {
    pub fn new(chain: Arc<E>, wallet: LocalWallet, config: RelayerConfig) -> Self {
        let relayer = wallet.address();
        let beneficiary = config.beneficiary.unwrap_or(relayer);
        let submitter_config = SubmitterConfig {
            beneficiary,
            chain_id: config.chain_id,
            gas_overhead: config.gas_overhead,
            legacy_transactions: config.legacy_transactions,
        };

        let submitter = BatchSubmitter::new(Arc::clone(&chain), wallet, submitter_config)
            .with_freshness(MaxSimulationAge(config.max_simulation_age));
        let submitter = match config.fees {
            FeeConfig::Network => submitter.with_fee_policy(NetworkFees),
            FeeConfig::Operation => submitter.with_fee_policy(OperationFees),
            FeeConfig::Fixed(fees) => submitter.with_fee_policy(FixedFees(fees)),
        };
        let simulator = ValidationSimulator::new(Arc::clone(&chain), relayer, config.chain_id);

        info!(
            relayer = ?relayer,
            beneficiary = ?beneficiary,
            entry_point = ?chain.address(),
            chain_id = config.chain_id,
            "Initialized relayer"
        );

        Self {
            chain,
            simulator,
            submitter,
            config,
        }
    }

    pub fn relayer(&self) -> Address {
        self.submitter.relayer()
    }

    pub fn sequence(&self) -> &SequenceManager<E> {
        self.submitter.sequence()
    }

    pub fn request_id(&self, op: &UserOperation) -> H256 {
        self.simulator.request_id(op)
    }

    /// Simulates and submits `ops` in one cycle.
    ///
    /// Every operation gets a status in the report. `Err` is returned for
    /// empty input and when the sequence manager has halted.
    pub async fn relay(&self, ops: Vec<UserOperation>) -> Result<RelayReport, RelayError> {
        if ops.is_empty() {
            return Err(RelayError::InvalidInput("no user operations".to_string()));
        }

        let deadline = Instant::now() + self.config.simulation_timeout;
        let simulated = self.simulator.simulate_all(ops, Some(deadline)).await;

        let mut entries = Vec::with_capacity(simulated.len());
        let mut batch = Vec::new();
        for (op, result) in simulated {
            let request_id = self.simulator.request_id(&op);
            let status = match result {
                Ok(SimulationOutcome::Accepted(validated)) => {
                    batch.push(validated);
                    None
                }
                Ok(SimulationOutcome::Rejected(rejection)) => Some(OperationStatus::Rejected {
                    reason: rejection.reason(),
                }),
                Err(err) => Some(OperationStatus::Unknown {
                    error: err.to_string(),
                }),
            };
            entries.push((request_id, op.sender, status));
        }

        if batch.is_empty() {
            info!(ops = entries.len(), "No operation passed simulation");
            return Ok(RelayReport {
                results: entries
                    .into_iter()
                    .filter_map(|(request_id, sender, status)| {
                        status.map(|status| OperationResult {
                            request_id,
                            sender,
                            status,
                        })
                    })
                    .collect(),
                transaction: None,
            });
        }

        let deadline = Instant::now() + self.config.submission_timeout;
        let (batch_status, transaction) = match self.submitter.submit(batch, Some(deadline)).await {
            Ok(outcome) => (submitted_status(&outcome), Some(outcome)),
            Err(SubmitError::Sequence(err)) if err.is_fatal() => {
                return Err(RelayError::Fatal(err));
            }
            Err(err) => {
                warn!(error = %err, "Batch submission failed");
                (
                    OperationStatus::Failed {
                        error: err.to_string(),
                    },
                    None,
                )
            }
        };

        let results = entries
            .into_iter()
            .map(|(request_id, sender, status)| OperationResult {
                request_id,
                sender,
                status: status.unwrap_or_else(|| batch_status.clone()),
            })
            .collect();

        Ok(RelayReport {
            results,
            transaction,
        })
    }

    pub async fn simulate(&self, op: UserOperation) -> SimulationResult {
        let deadline = Instant::now() + self.config.simulation_timeout;
        self.simulator.simulate(op, Some(deadline)).await
    }

    pub async fn deposit_of(&self, account: Address) -> Result<U256, TransportError> {
        self.chain.deposit_of(account).await
    }

    /// Compares the local request id derivation with the entry point's
    /// `getRequestId` for a sample operation.
    pub async fn verify_request_ids(&self) -> Result<bool, CallError> {
        let sample = sample_operation(self.relayer());
        let local = self.request_id(&sample);
        let on_chain = self.chain.request_id(&sample).await?;
        if local != on_chain {
            warn!(local = ?local, on_chain = ?on_chain, "Request id derivation does not match entry point");
        }
        Ok(local == on_chain)
    }

    pub async fn status(&self) -> RelayerStatus {
        RelayerStatus {
            relayer: self.relayer(),
            beneficiary: self.submitter.beneficiary(),
            chain_id: self.config.chain_id,
            entry_point: self.chain.address(),
            sequence: self.sequence().snapshot().await,
        }
    }
}

fn submitted_status(outcome: &SubmissionOutcome) -> OperationStatus {
    match outcome.clone() {
        SubmissionOutcome::Submitted { tx_hash, sequence } => {
            OperationStatus::Submitted { tx_hash, sequence }
        }
        SubmissionOutcome::Indeterminate {
            tx_hash,
            sequence,
            reason,
        } => OperationStatus::Indeterminate {
            tx_hash,
            sequence,
            reason,
        },
    }
}

fn sample_operation(sender: Address) -> UserOperation {
    UserOperation {
        sender,
        nonce: U256::from(1),
        init_code: Bytes::default(),
        call_data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(150_000),
        pre_verification_gas: U256::from(21_000),
        max_fee_per_gas: U256::from(1_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000u64),
        paymaster: None,
        paymaster_data: Bytes::default(),
        signature: Bytes::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockEntryPointApi;
    use crate::entry_point::ValidationReturn;
    use crate::error::{BroadcastError, SequenceError};
    use crate::fees::BatchFees;
    use ethers::abi::{self, Token};
    use ethers::utils::id;

    const CHAIN_ID: u64 = 5;

    fn wallet() -> LocalWallet {
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse::<LocalWallet>()
            .unwrap()
            .with_chain_id(CHAIN_ID)
    }

    fn op(sender: u8) -> UserOperation {
        let mut op = sample_operation(Address::repeat_byte(sender));
        op.max_fee_per_gas = U256::from(2_000_000);
        op.max_priority_fee_per_gas = U256::from(1_000);
        op.signature = Bytes::from(vec![sender; 65]);
        op
    }

    fn failed_op(reason: &str) -> Bytes {
        let mut data = id("FailedOp(uint256,address,string)").to_vec();
        data.extend(abi::encode(&[
            Token::Uint(U256::zero()),
            Token::Address(Address::zero()),
            Token::String(reason.to_string()),
        ]));
        Bytes::from(data)
    }

    /// Sender `0xba..` fails validation, `0x0f..` hits a transport error.
    fn chain() -> MockEntryPointApi {
        let mut chain = MockEntryPointApi::new();
        chain
            .expect_address()
            .return_const(Address::repeat_byte(0xee));
        chain.expect_simulate_validation().returning(|_, op| {
            if op.sender == Address::repeat_byte(0xba) {
                Err(CallError::Reverted(failed_op("invalid signature")))
            } else if op.sender == Address::repeat_byte(0x0f) {
                Err(CallError::Transport(TransportError::Rpc("connection reset".into())))
            } else {
                Ok(ValidationReturn {
                    pre_op_gas: U256::from(40_000),
                    prefund: U256::from(100_000),
                })
            }
        });
        chain
    }

    fn config() -> RelayerConfig {
        RelayerConfig {
            fees: FeeConfig::Operation,
            ..RelayerConfig::new(CHAIN_ID)
        }
    }

    #[tokio::test]
    async fn test_empty_input_is_invalid() {
        let relayer = Relayer::new(Arc::new(chain()), wallet(), config());
        assert_eq!(
            relayer.relay(vec![]).await,
            Err(RelayError::InvalidInput("no user operations".into()))
        );
    }

    #[tokio::test]
    async fn test_happy_path_reports_submission() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .times(1)
            .returning(|_| Ok(U256::from(4)));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x11)));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let operation = op(0xaa);
        let request_id = relayer.request_id(&operation);
        let report = relayer.relay(vec![operation]).await.unwrap();

        assert_eq!(
            report.status_of(request_id),
            Some(&OperationStatus::Submitted {
                tx_hash: H256::repeat_byte(0x11),
                sequence: U256::from(4),
            })
        );
        assert_eq!(
            report.transaction.map(|tx| tx.sequence()),
            Some(U256::from(4))
        );
    }

    #[tokio::test]
    async fn test_rejected_operation_touches_no_sequence() {
        let mut chain = chain();
        chain.expect_sequence_number().never();
        chain.expect_broadcast().never();
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let operation = op(0xba);
        let request_id = relayer.request_id(&operation);
        let report = relayer.relay(vec![operation]).await.unwrap();

        assert_eq!(
            report.status_of(request_id),
            Some(&OperationStatus::Rejected {
                reason: "invalid signature".into()
            })
        );
        assert!(report.transaction.is_none());
        assert_eq!(relayer.sequence().snapshot().await.next, None);
    }

    #[tokio::test]
    async fn test_unknown_validity_is_left_out_of_batch() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::zero()));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x22)));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let good = op(0xaa);
        let flaky = op(0x0f);
        let (good_id, flaky_id) = (relayer.request_id(&good), relayer.request_id(&flaky));
        let report = relayer.relay(vec![good, flaky]).await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert!(matches!(
            report.status_of(good_id),
            Some(OperationStatus::Submitted { .. })
        ));
        assert!(matches!(
            report.status_of(flaky_id),
            Some(OperationStatus::Unknown { .. })
        ));
    }

    #[tokio::test]
    async fn test_two_senders_share_one_sequence() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::from(9)));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x33)));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let report = relayer.relay(vec![op(0xaa), op(0xbb)]).await.unwrap();
        let sequences: Vec<_> = report
            .results
            .iter()
            .map(|result| match &result.status {
                OperationStatus::Submitted { sequence, .. } => *sequence,
                other => panic!("unexpected status {other:?}"),
            })
            .collect();
        assert_eq!(sequences, vec![U256::from(9), U256::from(9)]);
        assert_eq!(relayer.sequence().snapshot().await.next, Some(U256::from(10)));
    }

    #[tokio::test]
    async fn test_indeterminate_submission_reported_per_operation() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::from(2)));
        chain
            .expect_broadcast()
            .returning(|_| Err(BroadcastError::Indeterminate("connection closed".into())));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let operation = op(0xaa);
        let request_id = relayer.request_id(&operation);
        let report = relayer.relay(vec![operation]).await.unwrap();

        match report.status_of(request_id) {
            Some(OperationStatus::Indeterminate { sequence, .. }) => {
                assert_eq!(*sequence, U256::from(2))
            }
            other => panic!("unexpected status {other:?}"),
        }
        let snapshot = relayer.sequence().snapshot().await;
        assert!(snapshot.stale);
        assert!(snapshot.outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_node_rejection_fails_batch_operations() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::from(2)));
        chain
            .expect_broadcast()
            .returning(|_| Err(BroadcastError::Rejected("nonce too low".into())));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());

        let report = relayer.relay(vec![op(0xaa), op(0xba)]).await.unwrap();
        assert!(matches!(
            report.results[0].status,
            OperationStatus::Failed { .. }
        ));
        assert!(matches!(
            report.results[1].status,
            OperationStatus::Rejected { .. }
        ));
        assert!(report.transaction.is_none());
    }

    #[tokio::test]
    async fn test_halted_sequence_is_fatal() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::zero()));
        let relayer = Relayer::new(Arc::new(chain), wallet(), config());
        let _ = relayer.sequence().confirm(U256::from(3)).await;

        assert!(matches!(
            relayer.relay(vec![op(0xaa)]).await,
            Err(RelayError::Fatal(SequenceError::Halted(_)))
        ));
    }

    #[tokio::test]
    async fn test_fixed_fee_config_is_used() {
        let mut chain = chain();
        chain
            .expect_sequence_number()
            .returning(|_| Ok(U256::zero()));
        chain.expect_suggested_fees().never();
        chain.expect_broadcast().returning(|raw| {
            use ethers::types::transaction::eip2718::TypedTransaction;
            use ethers::utils::rlp::Rlp;
            let (tx, _) = TypedTransaction::decode_signed(&Rlp::new(&raw)).unwrap();
            match tx {
                TypedTransaction::Eip1559(tx) => {
                    assert_eq!(tx.max_fee_per_gas, Some(U256::from(99)));
                    assert_eq!(tx.max_priority_fee_per_gas, Some(U256::from(7)));
                }
                other => panic!("unexpected transaction type {other:?}"),
            }
            Ok(H256::repeat_byte(0x44))
        });
        let config = RelayerConfig {
            fees: FeeConfig::Fixed(BatchFees {
                max_fee_per_gas: U256::from(99),
                max_priority_fee_per_gas: U256::from(7),
            }),
            ..RelayerConfig::new(CHAIN_ID)
        };
        let relayer = Relayer::new(Arc::new(chain), wallet(), config);
        assert!(relayer.relay(vec![op(0xaa)]).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_request_ids_against_entry_point() {
        let wallet = wallet();
        let expected = crate::request_id::derive(
            &sample_operation(wallet.address()),
            Address::repeat_byte(0xee),
            U256::from(CHAIN_ID),
        );
        let mut chain = chain();
        let mut calls = 0;
        chain.expect_request_id().returning(move |_| {
            calls += 1;
            Ok(if calls == 1 { expected } else { H256::zero() })
        });
        let relayer = Relayer::new(Arc::new(chain), wallet, config());

        assert_eq!(relayer.verify_request_ids().await, Ok(true));
        assert_eq!(relayer.verify_request_ids().await, Ok(false));
    }

    #[tokio::test]
    async fn test_status_defaults_beneficiary_to_relayer() {
        let relayer = Relayer::new(Arc::new(chain()), wallet(), config());
        let status = relayer.status().await;
        assert_eq!(status.beneficiary, relayer.relayer());
        assert_eq!(status.chain_id, CHAIN_ID);
        assert_eq!(status.entry_point, Address::repeat_byte(0xee));
        assert!(status.sequence.halted.is_none());
    }
}
