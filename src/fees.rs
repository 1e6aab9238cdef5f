// src/fees.rs
//! Fee parameters for the relayer-funded batch transaction.
//!
//! How an operation's own fee fields relate to the batch transaction is a
//! policy choice, so it sits behind [`FeePolicy`].

use async_trait::async_trait;
use clap::ValueEnum;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::chain::EntryPointApi;
use crate::error::TransportError;
use crate::types::UserOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[async_trait]
pub trait FeePolicy: Send + Sync {
    async fn batch_fees(
        &self,
        ops: &[UserOperation],
        chain: &dyn EntryPointApi,
    ) -> Result<BatchFees, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeeStrategy {
    /// Use the node's EIP-1559 estimate.
    Network,
    /// Bid no more than the cheapest operation in the batch offers.
    Operation,
    /// Use configured values.
    Fixed,
}

/// A [`FeeStrategy`] together with the values it needs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FeeConfig {
    #[default]
    Network,
    Operation,
    Fixed(BatchFees),
}

/// Node estimate; the relayer pays and is reimbursed by the entry point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkFees;

#[async_trait]
impl FeePolicy for NetworkFees {
    async fn batch_fees(
        &self,
        _ops: &[UserOperation],
        chain: &dyn EntryPointApi,
    ) -> Result<BatchFees, TransportError> {
        chain.suggested_fees().await
    }
}

/// Pass operation fees through: the lowest `maxFeePerGas` and
/// `maxPriorityFeePerGas` in the batch, so no operation is charged above what
/// it signed for.
#[derive(Debug, Default, Clone, Copy)]
pub struct OperationFees;

impl OperationFees {
    pub fn fees_for(ops: &[UserOperation]) -> BatchFees {
        let max_fee_per_gas = ops
            .iter()
            .map(|op| op.max_fee_per_gas)
            .min()
            .unwrap_or_default();
        let max_priority_fee_per_gas = ops
            .iter()
            .map(|op| op.max_priority_fee_per_gas)
            .min()
            .unwrap_or_default()
            .min(max_fee_per_gas);
        BatchFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }
}

#[async_trait]
impl FeePolicy for OperationFees {
    async fn batch_fees(
        &self,
        ops: &[UserOperation],
        _chain: &dyn EntryPointApi,
    ) -> Result<BatchFees, TransportError> {
        Ok(Self::fees_for(ops))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedFees(pub BatchFees);

#[async_trait]
impl FeePolicy for FixedFees {
    async fn batch_fees(
        &self,
        _ops: &[UserOperation],
        _chain: &dyn EntryPointApi,
    ) -> Result<BatchFees, TransportError> {
        Ok(self.0)
    }
}
