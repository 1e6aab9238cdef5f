// src/sequence.rs
//! Allocation of the relayer account's on-chain sequence numbers (nonces).
//!
//! One [`SequenceManager`] owns the counter for the process. Every number it
//! hands out ends in exactly one of `confirm`, `confirm_tentative` or `release`.
//! Any call that would break the counter halts the manager for good.

use std::sync::Arc;

use ethers::types::{Address, U256};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::chain::EntryPointApi;
use crate::error::{SequenceError, TransportError};

#[derive(Debug, Default)]
struct SequenceState {
    /// Next number to hand out. `None` until first read from the chain.
    next: Option<U256>,
    /// Re-read the chain before the next reservation.
    stale: bool,
    /// Reserved, not yet confirmed or released, in reservation order.
    outstanding: Vec<U256>,
    last_confirmed: Option<U256>,
    halted: Option<String>,
}

impl SequenceState {
    fn ensure_running(&self) -> Result<(), SequenceError> {
        match &self.halted {
            Some(reason) => Err(SequenceError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&mut self, err: SequenceError) -> SequenceError {
        error!(error = %err, "Sequence manager halted");
        self.halted = Some(err.to_string());
        err
    }

    /// Never moves backwards: a number handed out once is never handed out again.
    fn reconcile(&mut self, on_chain: U256) -> U256 {
        let next = match self.next {
            Some(local) if local > on_chain => {
                debug!(%local, %on_chain, "Chain has not caught up with local sequence");
                local
            }
            Some(local) if local < on_chain => {
                warn!(%local, %on_chain, "Relayer account used outside this process, adopting chain sequence");
                on_chain
            }
            _ => on_chain,
        };
        self.next = Some(next);
        self.stale = false;
        next
    }
}

/// Read-only view of the sequence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSnapshot {
    pub next: Option<U256>,
    pub outstanding: Vec<U256>,
    pub last_confirmed: Option<U256>,
    pub stale: bool,
    pub halted: Option<String>,
}

pub struct SequenceManager<E: ?Sized> {
    chain: Arc<E>,
    account: Address,
    state: Mutex<SequenceState>,
}

impl<E: EntryPointApi + ?Sized> SequenceManager<E> {
    pub fn new(chain: Arc<E>, account: Address) -> Self {
        Self {
            chain,
            account,
            state: Mutex::new(SequenceState::default()),
        }
    }

    /// Hands out the next sequence number. The chain is consulted first when
    /// nothing is cached yet or the cache was marked stale; that read gives up
    /// at `deadline` with `Sync(Timeout)` and reserves nothing.
    pub async fn reserve_next(&self, deadline: Option<Instant>) -> Result<U256, SequenceError> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;

        let number = match state.next {
            Some(next) if !state.stale => next,
            _ => {
                let read = self.chain.sequence_number(self.account);
                let on_chain = match deadline {
                    Some(deadline) => timeout_at(deadline, read)
                        .await
                        .unwrap_or(Err(TransportError::Timeout)),
                    None => read.await,
                }
                .map_err(SequenceError::Sync)?;
                state.reconcile(on_chain)
            }
        };

        state.next = Some(number + U256::one());
        state.outstanding.push(number);
        debug!(sequence = %number, "Reserved sequence number");
        Ok(number)
    }

    /// The transaction using `number` was accepted by the node.
    pub async fn confirm(&self, number: U256) -> Result<(), SequenceError> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        Self::take_outstanding(&mut state, number)?;
        state.last_confirmed = Some(state.last_confirmed.map_or(number, |last| last.max(number)));
        info!(sequence = %number, "Confirmed sequence number");
        Ok(())
    }

    /// The transaction using `number` may or may not have reached the node.
    /// The number stays consumed and the chain is re-read before the next
    /// reservation.
    pub async fn confirm_tentative(&self, number: U256) -> Result<(), SequenceError> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        Self::take_outstanding(&mut state, number)?;
        state.stale = true;
        warn!(sequence = %number, "Sequence number tentatively confirmed");
        Ok(())
    }

    /// Returns `number` unused. Only the most recent reservation can be
    /// released; anything else halts the manager.
    pub async fn release(&self, number: U256) -> Result<(), SequenceError> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;

        let most_recent = state
            .outstanding
            .last()
            .copied()
            .filter(|last| state.next == Some(*last + U256::one()));

        if most_recent != Some(number) {
            let err = SequenceError::OutOfOrderRelease {
                number,
                expected: most_recent,
            };
            return Err(state.halt(err));
        }

        state.outstanding.pop();
        state.next = Some(number);
        info!(sequence = %number, "Released sequence number");
        Ok(())
    }

    /// Forces a chain read before the next reservation.
    pub async fn invalidate(&self) {
        self.state.lock().await.stale = true;
    }

    pub async fn snapshot(&self) -> SequenceSnapshot {
        let state = self.state.lock().await;
        SequenceSnapshot {
            next: state.next,
            outstanding: state.outstanding.clone(),
            last_confirmed: state.last_confirmed,
            stale: state.stale,
            halted: state.halted.clone(),
        }
    }

    fn take_outstanding(state: &mut SequenceState, number: U256) -> Result<(), SequenceError> {
        match state.outstanding.iter().position(|n| *n == number) {
            Some(index) => {
                state.outstanding.remove(index);
                Ok(())
            }
            None => Err(state.halt(SequenceError::NotReserved(number))),
        }
    }
}
