//! A scripted in-memory entry point shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use arka_bundler::chain::EntryPointApi;
use arka_bundler::entry_point::ValidationReturn;
use arka_bundler::error::{BroadcastError, CallError, TransportError};
use arka_bundler::fees::BatchFees;
use arka_bundler::request_id;
use arka_bundler::UserOperation;
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::rlp::Rlp;
use ethers::utils::{id, keccak256};

pub const CHAIN_ID: u64 = 1337;

pub fn entry_point() -> Address {
    "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap()
}

pub fn wallet() -> LocalWallet {
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
        .parse::<LocalWallet>()
        .unwrap()
        .with_chain_id(CHAIN_ID)
}

pub fn user_operation(sender: u8, nonce: u64) -> UserOperation {
    UserOperation {
        sender: Address::repeat_byte(sender),
        nonce: U256::from(nonce),
        init_code: Bytes::default(),
        call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(150_000),
        pre_verification_gas: U256::from(21_000),
        max_fee_per_gas: U256::from(2_000_000),
        max_priority_fee_per_gas: U256::from(1_000),
        paymaster: None,
        paymaster_data: Bytes::default(),
        signature: Bytes::from(vec![0x1b; 65]),
    }
}

#[derive(Debug, Clone)]
pub enum Simulation {
    Accept { pre_op_gas: U256, prefund: U256 },
    Reject(String),
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    Accept,
    Reject,
    /// The caller sees a transport failure; `landed` says whether the node got it.
    Indeterminate { landed: bool },
}

#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub nonce: U256,
    pub chain_id: Option<u64>,
    pub to: Option<Address>,
    pub data: Bytes,
    pub hash: H256,
}

#[derive(Default)]
struct ChainState {
    /// Pending transaction count of the relayer.
    account_nonce: U256,
    simulations: HashMap<Address, Simulation>,
    broadcasts: VecDeque<Broadcast>,
    sent: Vec<SentTransaction>,
    deposits: HashMap<Address, U256>,
}

/// Behaves like a node with the entry point deployed. Simulations are scripted
/// per sender, broadcasts by a queue of responses (accepting once empty).
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    /// While set, reads of the relayer's sequence number never answer.
    stall_sequence_reads: AtomicBool,
}

impl ScriptedChain {
    pub fn new(account_nonce: u64) -> Self {
        Self {
            state: Mutex::new(ChainState {
                account_nonce: U256::from(account_nonce),
                ..ChainState::default()
            }),
            stall_sequence_reads: AtomicBool::new(false),
        }
    }

    pub fn script_simulation(&self, sender: Address, simulation: Simulation) {
        self.state.lock().unwrap().simulations.insert(sender, simulation);
    }

    pub fn script_broadcasts(&self, responses: impl IntoIterator<Item = Broadcast>) {
        self.state.lock().unwrap().broadcasts.extend(responses);
    }

    pub fn set_deposit(&self, account: Address, amount: U256) {
        self.state.lock().unwrap().deposits.insert(account, amount);
    }

    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn stall_sequence_reads(&self, stall: bool) {
        self.stall_sequence_reads.store(stall, Ordering::SeqCst);
    }

    pub fn account_nonce(&self) -> U256 {
        self.state.lock().unwrap().account_nonce
    }
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

#[async_trait]
impl EntryPointApi for ScriptedChain {
    fn address(&self) -> Address {
        entry_point()
    }

    async fn simulate_validation(
        &self,
        _caller: Address,
        op: &UserOperation,
    ) -> Result<ValidationReturn, CallError> {
        let simulation = self.state.lock().unwrap().simulations.get(&op.sender).cloned();
        match simulation {
            None => Ok(ValidationReturn {
                pre_op_gas: U256::from(40_000),
                prefund: U256::from(100_000),
            }),
            Some(Simulation::Accept {
                pre_op_gas,
                prefund,
            }) => Ok(ValidationReturn {
                pre_op_gas,
                prefund,
            }),
            Some(Simulation::Reject(reason)) => Err(CallError::Reverted(failed_op(&reason))),
            Some(Simulation::Unreachable) => Err(CallError::Transport(TransportError::Rpc(
                "connection refused".into(),
            ))),
        }
    }

    async fn request_id(&self, op: &UserOperation) -> Result<H256, CallError> {
        Ok(request_id::derive(op, entry_point(), U256::from(CHAIN_ID)))
    }

    async fn deposit_of(&self, account: Address) -> Result<U256, TransportError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn sequence_number(&self, _account: Address) -> Result<U256, TransportError> {
        if self.stall_sequence_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.account_nonce())
    }

    async fn suggested_fees(&self) -> Result<BatchFees, TransportError> {
        Ok(BatchFees {
            max_fee_per_gas: U256::from(3_000_000),
            max_priority_fee_per_gas: U256::from(1_000),
        })
    }

    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError> {
        let (tx, _signature) = TypedTransaction::decode_signed(&Rlp::new(&raw))
            .map_err(|e| BroadcastError::Rejected(format!("invalid transaction: {e}")))?;
        let hash = H256::from(keccak256(&raw));
        let nonce = tx.nonce().copied().unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        if nonce < state.account_nonce {
            return Err(BroadcastError::Rejected("nonce too low".into()));
        }
        let response = state.broadcasts.pop_front().unwrap_or(Broadcast::Accept);
        let lands = matches!(
            response,
            Broadcast::Accept | Broadcast::Indeterminate { landed: true }
        );
        if lands {
            state.account_nonce = nonce + U256::one();
            state.sent.push(SentTransaction {
                nonce,
                chain_id: tx.chain_id().map(|id| id.as_u64()),
                to: tx.to_addr().copied(),
                data: tx.data().cloned().unwrap_or_default(),
                hash,
            });
        }

        match response {
            Broadcast::Accept => Ok(hash),
            Broadcast::Reject => Err(BroadcastError::Rejected(
                "insufficient funds for gas * price + value".into(),
            )),
            Broadcast::Indeterminate { .. } => Err(BroadcastError::Indeterminate(
                "error sending request: connection closed before message completed".into(),
            )),
        }
    }
}
