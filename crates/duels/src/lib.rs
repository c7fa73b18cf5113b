pub mod config;
pub mod domain;
pub mod infra;
pub mod startup;

pub use config::*;
pub use domain::*;
pub use infra::db::{DBConnection, DatabasePoolConfig};
pub use infra::events::EventHub;
pub use infra::solana::{
    ContractGateway, ContractRequest, Endpoint, FeeRefreshWatcher, PriorityFees, SignatureTracker,
    TrackerError, Wallet, WalletService,
};
pub use startup::*;
