pub mod contract;
pub mod fees;
pub mod logs;
pub mod tracker;
pub mod wallet;

pub use contract::{instructions_from, ContractGateway, ContractRequest, Endpoint};
pub use fees::{FeeRefreshWatcher, PriorityFees, FALLBACK_MICRO_LAMPORTS};
pub use tracker::{
    PubsubConnector, RpcStatusClient, SignatureTracker, StatusRpc, TrackerError, WsConnector,
};
pub use wallet::{Wallet, WalletService, TX_CONFIRMATION_TIMEOUT};
