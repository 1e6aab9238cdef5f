// src/config.rs
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use ethers::types::{Address, U256};
use tracing::Level;

use crate::fees::{BatchFees, FeeConfig, FeeStrategy};
use crate::relayer::RelayerConfig;
use crate::submitter::INTRINSIC_GAS;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:8545")]
    pub rpc_server_addr: String,

    /// Key of the relayer account that signs and pays for batches
    #[clap(short, long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    #[clap(short, long, env = "CHAIN_ID")]
    pub chain_id: u64,

    #[clap(short, long, env = "ETH_RPC_URL")]
    pub eth_rpc_url: String,

    #[clap(long, env = "ENTRY_POINT")]
    pub entry_point: Address,

    /// Receives the batch fees; defaults to the relayer account
    #[clap(long, env = "BENEFICIARY")]
    pub beneficiary: Option<Address>,

    #[clap(long, env = "SIMULATION_TIMEOUT_SECS", default_value_t = 10)]
    pub simulation_timeout_secs: u64,

    #[clap(long, env = "SUBMISSION_TIMEOUT_SECS", default_value_t = 30)]
    pub submission_timeout_secs: u64,

    #[clap(long, env = "MAX_SIMULATION_AGE_SECS", default_value_t = 60)]
    pub max_simulation_age_secs: u64,

    #[clap(long, env = "FEE_STRATEGY", value_enum, default_value_t = FeeStrategy::Network)]
    pub fee_strategy: FeeStrategy,

    /// Used with `--fee-strategy fixed`
    #[clap(long, env = "MAX_FEE_PER_GAS")]
    pub max_fee_per_gas: Option<u128>,

    /// Used with `--fee-strategy fixed`
    #[clap(long, env = "MAX_PRIORITY_FEE_PER_GAS")]
    pub max_priority_fee_per_gas: Option<u128>,

    /// Gas added to every batch on top of the operations' limits
    #[clap(long, env = "BATCH_GAS_OVERHEAD", default_value_t = INTRINSIC_GAS)]
    pub batch_gas_overhead: u64,

    /// Send pre-EIP-1559 transactions
    #[clap(long, env = "LEGACY_TRANSACTIONS")]
    pub legacy_transactions: bool,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: Level,
}

impl Args {
    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        self.rpc_server_addr
            .parse()
            .with_context(|| format!("invalid RPC server address {}", self.rpc_server_addr))
    }

    pub fn relayer_config(&self) -> anyhow::Result<RelayerConfig> {
        if self.simulation_timeout_secs == 0 || self.submission_timeout_secs == 0 {
            bail!("timeouts must be positive");
        }
        if self.max_simulation_age_secs < self.simulation_timeout_secs {
            bail!(
                "max simulation age ({}s) is shorter than the simulation timeout ({}s)",
                self.max_simulation_age_secs,
                self.simulation_timeout_secs
            );
        }

        let fees = match self.fee_strategy {
            FeeStrategy::Network => FeeConfig::Network,
            FeeStrategy::Operation => FeeConfig::Operation,
            FeeStrategy::Fixed => {
                let (Some(max_fee), Some(priority_fee)) =
                    (self.max_fee_per_gas, self.max_priority_fee_per_gas)
                else {
                    bail!("fixed fee strategy needs --max-fee-per-gas and --max-priority-fee-per-gas");
                };
                if priority_fee > max_fee {
                    bail!("max priority fee {priority_fee} exceeds max fee {max_fee}");
                }
                FeeConfig::Fixed(BatchFees {
                    max_fee_per_gas: U256::from(max_fee),
                    max_priority_fee_per_gas: U256::from(priority_fee),
                })
            }
        };

        Ok(RelayerConfig {
            chain_id: self.chain_id,
            beneficiary: self.beneficiary,
            simulation_timeout: Duration::from_secs(self.simulation_timeout_secs),
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            max_simulation_age: Duration::from_secs(self.max_simulation_age_secs),
            fees,
            gas_overhead: U256::from(self.batch_gas_overhead),
            legacy_transactions: self.legacy_transactions,
        })
    }
}
