// src/lib.rs
pub mod chain;
pub mod config;
pub mod entry_point;
pub mod error;
pub mod fees;
pub mod relayer;
pub mod request_id;
pub mod rpc;
pub mod sequence;
pub mod simulator;
pub mod submitter;
pub mod types;

pub use chain::{EntryPointApi, EthEntryPoint};
pub use relayer::{Relayer, RelayerConfig};
pub use types::{RelayReport, UserOperation};
