use anyhow::anyhow;
use log::{debug, error, info, warn};
use http::Extensions;
use reqwest_middleware::{reqwest, ClientBuilder, ClientWithMiddleware, Middleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::Settings,
    domain::{
        DuelOrchestrator, DuelStore, LedgerStore, NotificationCleanupWatcher, NotificationService,
        SessionStore, UserStore,
    },
    infra::{
        db::DBConnection,
        events::EventHub,
        share_image::ShareImageClient,
        solana::{
            ContractGateway, FeeRefreshWatcher, PriorityFees, PubsubConnector, RpcStatusClient,
            SignatureTracker, WalletService,
        },
    },
};

pub struct Application {
    app_state: AppState,
    tracker: Arc<SignatureTracker>,
    cancellation_token: CancellationToken,
    background_tasks: TaskTracker,
}

/// Every handle the edge layer consumes. The HTTP/WS surface itself lives
/// outside this service.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DuelOrchestrator>,
    pub notifications: Arc<NotificationService>,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub events: EventHub,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, anyhow::Error> {
        let (app_state, tracker, background_tasks, cancellation_token) =
            build_app(config).await?;
        Ok(Self {
            app_state,
            tracker,
            cancellation_token,
            background_tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        info!("Service running, waiting for shutdown signal");
        shutdown_signal().await;

        info!("Shutdown initiated");
        self.cancellation_token.cancel();
        self.tracker.close().await;

        let timeout = tokio::time::sleep(Duration::from_secs(10));
        select! {
            _ = self.background_tasks.wait() => {
                info!("Background tasks completed gracefully");
            }
            _ = timeout => {
                warn!("Background tasks timed out during shutdown");
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

// Transient-failure retries per outbound service. The contract service
// only authors raw transactions, so replaying a request is safe; the
// share-image call is a best-effort side effect and gets one retry.
const CONTRACT_SERVICE_RETRIES: u32 = 3;
const SHARE_IMAGE_RETRIES: u32 = 1;

pub async fn build_app(
    config: Settings,
) -> Result<(AppState, Arc<SignatureTracker>, TaskTracker, CancellationToken), anyhow::Error> {
    let rpc_client = Arc::new(RpcClient::new(config.solana_settings.rpc_url.clone()));
    info!("Solana RPC client configured @ {}", config.solana_settings.rpc_url);

    let fees = PriorityFees::new(config.solana_settings.fee_oracle_url.clone())
        .await
        .map_err(|e| anyhow!("Error setting up priority fees: {}", e))?;
    info!(
        "Priority fees configured: medium {} / high {} micro-lamports",
        fees.medium_micro_lamports(),
        fees.high_micro_lamports()
    );

    let tracker = SignatureTracker::new(
        Arc::new(RpcStatusClient::new(rpc_client.clone())),
        Arc::new(PubsubConnector::new(config.solana_settings.ws_url.clone())),
    );
    tracker.start();

    let gateway = ContractGateway::new(
        build_http_client("contract-service", CONTRACT_SERVICE_RETRIES),
        config.solana_settings.contract_service_url.clone(),
    );

    let usdc_mint = Pubkey::from_str(&config.solana_settings.usdc_mint_address)
        .map_err(|e| anyhow!("Invalid usdc mint address: {}", e))?;

    let wallet = WalletService::new(
        rpc_client,
        gateway,
        tracker.clone(),
        fees.clone(),
        &config.solana_settings.admin_private_key,
        config.solana_settings.program_address.clone(),
        usdc_mint,
    )
    .map_err(|e| anyhow!("Error setting up wallet service: {}", e))?;
    info!("Wallet service configured");

    std::fs::create_dir_all(&config.db_settings.data_folder)?;
    let db = DBConnection::new(
        &config.db_settings.data_folder,
        "duels",
        config.db_settings.clone().into(),
    )
    .await
    .map_err(|e| anyhow!("Error setting up duels db: {}", e))?;
    info!("Database configured @ {}", db.database_path);

    let duel_store = DuelStore::new(db.clone());
    let user_store = UserStore::new(db.clone());
    let ledger = LedgerStore::new(db.clone());

    let hub = EventHub::new();
    let notifications = Arc::new(NotificationService::new(db, hub.clone()));

    let share_image = if config.coordinator_settings.share_image_url.is_empty() {
        info!("Share image service disabled");
        None
    } else {
        Some(ShareImageClient::new(
            build_http_client("share-image", SHARE_IMAGE_RETRIES),
            config.coordinator_settings.share_image_url.clone(),
        ))
    };

    let orchestrator = Arc::new(DuelOrchestrator::new(
        Arc::new(wallet),
        duel_store,
        user_store.clone(),
        ledger,
        notifications.clone(),
        hub.clone(),
        share_image,
        usdc_mint,
    ));
    info!("Duel orchestrator configured");

    let background_tasks = TaskTracker::new();
    let cancel_token = CancellationToken::new();

    let fee_watcher = FeeRefreshWatcher::new(
        fees,
        cancel_token.clone(),
        Duration::from_secs(config.coordinator_settings.fee_refresh_interval_secs),
    );
    background_tasks.spawn(async move {
        match fee_watcher.watch().await {
            Ok(_) => info!("Successfully shutdown priority fee watcher"),
            Err(e) => error!("Error in priority fee watcher: {}", e),
        }
    });

    let cleanup_watcher = NotificationCleanupWatcher::new(
        notifications.clone(),
        cancel_token.clone(),
        time::Duration::days(config.coordinator_settings.notification_retention_days as i64),
        Duration::from_secs(config.coordinator_settings.notification_sweep_interval_secs),
    );
    background_tasks.spawn(async move {
        match cleanup_watcher.watch().await {
            Ok(_) => info!("Successfully shutdown notification cleanup watcher"),
            Err(e) => error!("Error in notification cleanup watcher: {}", e),
        }
    });

    background_tasks.close();

    let app_state = AppState {
        orchestrator,
        notifications,
        users: user_store,
        sessions: SessionStore::new(),
        events: hub,
    };

    Ok((app_state, tracker, background_tasks, cancel_token))
}

fn build_http_client(service: &'static str, max_retries: u32) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
    ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(OutboundLogMiddleware { service })
        .build()
}

/// Tags every outbound request with the service it targets and the time
/// it took, without leaking query strings into the log.
struct OutboundLogMiddleware {
    service: &'static str,
}

#[async_trait::async_trait]
impl Middleware for OutboundLogMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let method = req.method().clone();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(response) => {
                debug!(
                    "{}: {} {} -> {} in {:?}",
                    self.service,
                    method,
                    path,
                    response.status(),
                    started.elapsed()
                );
            }
            Err(error) => {
                warn!(
                    "{}: {} {} failed after {:?}: {}",
                    self.service,
                    method,
                    path,
                    started.elapsed(),
                    error
                );
            }
        }

        result
    }
}

async fn shutdown_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    select! {
        _ = sigint.recv() => info!("Received SIGINT signal"),
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
    }
}
