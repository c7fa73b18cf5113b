use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info};
use solana_client::{
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_config::RpcSignatureSubscribeConfig,
};
use solana_sdk::{commitment_config::CommitmentConfig, signature::Signature};
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::logs::is_broken_connection;

const PENDING_SIGNATURES_CAPACITY: usize = 1024;
const MAX_WS_RETRIES: u32 = 5;
const MAX_RPC_RETRIES: u32 = 3;
const MIN_BACKOFF: Duration = Duration::from_millis(300);
const MAX_BACKOFF: Duration = Duration::from_millis(1200);
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Sentinel: the signature did not reach Confirmed within the bounds.
    #[error("signature {0}: not confirmed")]
    NotConfirmed(Signature),
    #[error("signature status rpc failed: {0}")]
    Rpc(String),
}

impl TrackerError {
    pub fn is_not_confirmed(&self) -> bool {
        matches!(self, TrackerError::NotConfirmed(_))
    }
}

#[derive(Error, Debug)]
pub enum WsError {
    #[error("ws connect failed: {0}")]
    Connect(String),
    #[error("ws subscribe failed: {0}")]
    Subscribe(String),
    #[error("ws receive failed: {0}")]
    Receive(String),
    #[error("ws stream closed")]
    Closed,
}

impl WsError {
    pub fn is_broken_connection(&self) -> bool {
        match self {
            WsError::Closed => true,
            other => is_broken_connection(&other.to_string()),
        }
    }
}

/// One in-flight signature subscription. Resolves once, when the node
/// pushes the first notification for the signature.
pub struct SignatureNotification {
    rx: oneshot::Receiver<Result<(), WsError>>,
}

impl SignatureNotification {
    pub async fn recv(self) -> Result<(), WsError> {
        self.rx.await.unwrap_or(Err(WsError::Closed))
    }
}

/// A connected signature-subscription transport.
#[async_trait]
pub trait SignatureWs: Send + Sync {
    async fn signature_subscribe(
        &self,
        signature: Signature,
    ) -> Result<SignatureNotification, WsError>;
}

/// Factory for [`SignatureWs`] connections, so the tracker owns reconnect
/// policy without owning transport details.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SignatureWs>, WsError>;
}

/// The slice of chain RPC the tracker needs.
#[async_trait]
pub trait StatusRpc: Send + Sync {
    /// `GetSignatureStatuses` with transaction-history search enabled.
    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionStatus>, TrackerError>;
}

pub struct PubsubConnector {
    ws_url: String,
}

impl PubsubConnector {
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }
}

#[async_trait]
impl WsConnector for PubsubConnector {
    async fn connect(&self) -> Result<Arc<dyn SignatureWs>, WsError> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .map_err(|e| WsError::Connect(e.to_string()))?;
        Ok(Arc::new(PubsubSignatureWs {
            client: Arc::new(client),
        }))
    }
}

struct PubsubSignatureWs {
    client: Arc<PubsubClient>,
}

#[async_trait]
impl SignatureWs for PubsubSignatureWs {
    async fn signature_subscribe(
        &self,
        signature: Signature,
    ) -> Result<SignatureNotification, WsError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = oneshot::channel();
        let client = self.client.clone();

        // The pubsub stream borrows the client, so the subscription runs in
        // its own task and forwards the first notification.
        tokio::spawn(async move {
            let config = RpcSignatureSubscribeConfig {
                commitment: Some(CommitmentConfig::confirmed()),
                enable_received_notification: None,
            };
            match client.signature_subscribe(&signature, Some(config)).await {
                Ok((mut stream, unsubscribe)) => {
                    let _ = ready_tx.send(Ok(()));
                    let result = match stream.next().await {
                        Some(_notification) => Ok(()),
                        None => Err(WsError::Closed),
                    };
                    drop(stream);
                    unsubscribe().await;
                    let _ = notify_tx.send(result);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(WsError::Subscribe(e.to_string())));
                }
            }
        });

        ready_rx.await.unwrap_or(Err(WsError::Closed))?;
        Ok(SignatureNotification { rx: notify_rx })
    }
}

pub struct RpcStatusClient {
    rpc: Arc<RpcClient>,
}

impl RpcStatusClient {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl StatusRpc for RpcStatusClient {
    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionStatus>, TrackerError> {
        let response = self
            .rpc
            .get_signature_statuses_with_history(&[*signature])
            .await
            .map_err(|e| TrackerError::Rpc(e.to_string()))?;
        Ok(response.value.into_iter().next().flatten())
    }
}

struct SignatureEntry {
    // All waiters for this signature; one WS subscription serves them all
    waiters: Vec<(u64, oneshot::Sender<bool>)>,
    started: bool,
}

/// Tracks Solana transaction confirmations with a shared WS subscription
/// per signature and RPC verification as the fallback and final word.
///
/// Every waiter receives exactly one verdict. A waiter's timeout removes
/// only that waiter; the shared subscription keeps serving the rest.
pub struct SignatureTracker {
    me: Weak<SignatureTracker>,
    rpc: Arc<dyn StatusRpc>,
    connector: Arc<dyn WsConnector>,
    ws: AsyncMutex<Option<Arc<dyn SignatureWs>>>,
    entries: Mutex<HashMap<Signature, SignatureEntry>>,
    pending_tx: async_channel::Sender<Signature>,
    pending_rx: async_channel::Receiver<Signature>,
    next_waiter_id: AtomicU64,
    cancel_token: CancellationToken,
}

impl SignatureTracker {
    pub fn new(rpc: Arc<dyn StatusRpc>, connector: Arc<dyn WsConnector>) -> Arc<Self> {
        let (pending_tx, pending_rx) = async_channel::bounded(PENDING_SIGNATURES_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            rpc,
            connector,
            ws: AsyncMutex::new(None),
            entries: Mutex::new(HashMap::new()),
            pending_tx,
            pending_rx,
            next_waiter_id: AtomicU64::new(0),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Spawn the subscription manager that drains the pending queue.
    pub fn start(&self) {
        info!("SignatureTracker started");
        if let Some(tracker) = self.me.upgrade() {
            tokio::spawn(async move { tracker.run_subscription_manager().await });
        }
    }

    /// Cancel everything and resolve every outstanding waiter with `false`.
    ///
    /// Waiters are resolved before the root context is cancelled, so every
    /// live waiter observes the `false` verdict rather than the timeout
    /// sentinel.
    pub async fn close(&self) {
        let drained: Vec<SignatureEntry> = {
            let mut entries = self.entries.lock().expect("tracker entries lock poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            for (_, waiter) in entry.waiters {
                let _ = waiter.send(false);
            }
        }

        self.cancel_token.cancel();

        {
            let mut ws = self.ws.lock().await;
            *ws = None;
        }

        info!("SignatureTracker closed");
    }

    /// Wait for the confirmation verdict of a signature.
    ///
    /// Returns `Ok(true)` once the signature reaches Confirmed/Finalized,
    /// `Ok(false)` when the chain reports the transaction failed, and the
    /// not-confirmed sentinel when `timeout` elapses first. Concurrent
    /// callers for the same signature share one WS subscription.
    pub async fn subscribe(
        &self,
        signature: Signature,
        timeout: Duration,
    ) -> Result<bool, TrackerError> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        let should_enqueue = {
            let mut entries = self.entries.lock().expect("tracker entries lock poisoned");
            let entry = entries.entry(signature).or_insert_with(|| SignatureEntry {
                waiters: Vec::with_capacity(1),
                started: false,
            });
            entry.waiters.push((waiter_id, waiter_tx));
            if !entry.started {
                entry.started = true;
                true
            } else {
                false
            }
        };

        if should_enqueue && self.pending_tx.try_send(signature).is_err() {
            // Queue full: fall back to an ad-hoc worker instead of dropping
            if let Some(tracker) = self.me.upgrade() {
                tokio::spawn(async move { tracker.track_signature(signature).await });
            }
        }

        debug!(
            "waiter {} registered for signature {} (timeout {:?})",
            waiter_id, signature, timeout
        );

        tokio::select! {
            biased;
            verdict = waiter_rx => Ok(verdict.unwrap_or(false)),
            _ = sleep(timeout) => {
                self.remove_waiter(&signature, waiter_id);
                Err(TrackerError::NotConfirmed(signature))
            }
            _ = self.cancel_token.cancelled() => {
                self.remove_waiter(&signature, waiter_id);
                Err(TrackerError::NotConfirmed(signature))
            }
        }
    }

    fn remove_waiter(&self, signature: &Signature, waiter_id: u64) {
        let mut entries = self.entries.lock().expect("tracker entries lock poisoned");
        if let Some(entry) = entries.get_mut(signature) {
            entry.waiters.retain(|(id, _)| *id != waiter_id);
        }
    }

    async fn run_subscription_manager(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("SignatureTracker subscription manager stopped");
                    return;
                }
                next = self.pending_rx.recv() => {
                    let Ok(signature) = next else { return };

                    if let Err(e) = self.ensure_ws().await {
                        error!("ws connect failed, requeueing {}: {}", signature, e);
                        let tracker = self.clone();
                        tokio::spawn(async move {
                            sleep(CONNECT_RETRY_DELAY).await;
                            if tracker.pending_tx.try_send(signature).is_err() {
                                tracker.track_signature(signature).await;
                            }
                        });
                        continue;
                    }

                    let tracker = self.clone();
                    tokio::spawn(async move { tracker.track_signature(signature).await });
                }
            }
        }
    }

    /// Per-signature worker: WS subscription with bounded retries, then RPC
    /// verification of whatever the notification (or its absence) implied.
    async fn track_signature(self: Arc<Self>, signature: Signature) {
        let mut subscription = None;

        for attempt in 0..=MAX_WS_RETRIES {
            if let Err(e) = self.ensure_ws().await {
                error!(
                    "ws connect failed for {} (attempt {}): {}",
                    signature, attempt, e
                );
                sleep(backoff(attempt)).await;
                continue;
            }

            // The ws mutex covers the subscribe call only; the receive
            // below happens outside of it.
            let result = {
                let ws = self.ws.lock().await;
                match ws.as_ref() {
                    Some(client) => client.signature_subscribe(signature).await,
                    None => Err(WsError::Closed),
                }
            };

            match result {
                Ok(sub) => {
                    subscription = Some(sub);
                    break;
                }
                Err(e) => {
                    error!(
                        "signature subscribe failed for {} (attempt {}): {}",
                        signature, attempt, e
                    );
                    if e.is_broken_connection() {
                        if let Err(reconnect_err) = self.restart_ws().await {
                            error!("ws reconnect failed: {}", reconnect_err);
                        }
                    }
                    sleep(backoff(attempt)).await;
                }
            }
        }

        let Some(subscription) = subscription else {
            self.finish(&signature, false);
            return;
        };

        let received = tokio::select! {
            _ = self.cancel_token.cancelled() => return, // close() resolves the waiters
            received = subscription.recv() => received,
        };

        let confirmed = match received {
            Ok(()) => {
                // Confirm over RPC for reliability even after a WS push
                self.check_by_rpc(&signature).await.unwrap_or(false)
            }
            Err(e) => {
                error!("subscription receive failed for {}: {}", signature, e);
                if e.is_broken_connection() {
                    self.check_by_rpc(&signature).await.unwrap_or(false)
                } else {
                    false
                }
            }
        };

        self.finish(&signature, confirmed);
    }

    /// Classify the signature status over RPC, retrying transport errors.
    async fn check_by_rpc(&self, signature: &Signature) -> Result<bool, TrackerError> {
        for attempt in 0..=MAX_RPC_RETRIES {
            let status = match tokio::time::timeout(
                RPC_CALL_TIMEOUT,
                self.rpc.signature_status(signature),
            )
            .await
            {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    if attempt == MAX_RPC_RETRIES {
                        return Err(e);
                    }
                    sleep(backoff(attempt)).await;
                    continue;
                }
                Err(_elapsed) => {
                    if attempt == MAX_RPC_RETRIES {
                        return Err(TrackerError::Rpc(format!(
                            "status call for {} timed out",
                            signature
                        )));
                    }
                    sleep(backoff(attempt)).await;
                    continue;
                }
            };

            let Some(status) = status else {
                return Err(TrackerError::NotConfirmed(*signature));
            };

            if status.err.is_some() {
                return Ok(false);
            }

            return match status.confirmation_status {
                Some(
                    TransactionConfirmationStatus::Confirmed
                    | TransactionConfirmationStatus::Finalized,
                ) => Ok(true),
                _ => Err(TrackerError::NotConfirmed(*signature)),
            };
        }

        Err(TrackerError::NotConfirmed(*signature))
    }

    /// Resolve a signature: remove its entry and hand every waiter the same
    /// verdict exactly once.
    fn finish(&self, signature: &Signature, confirmed: bool) {
        let entry = {
            let mut entries = self.entries.lock().expect("tracker entries lock poisoned");
            entries.remove(signature)
        };

        if let Some(entry) = entry {
            for (_, waiter) in entry.waiters {
                let _ = waiter.send(confirmed);
            }
        }

        info!("signature {} resolved, confirmed: {}", signature, confirmed);
    }

    async fn ensure_ws(&self) -> Result<(), WsError> {
        self.connect_ws(false).await
    }

    async fn restart_ws(&self) -> Result<(), WsError> {
        self.connect_ws(true).await
    }

    async fn connect_ws(&self, force: bool) -> Result<(), WsError> {
        let mut ws = self.ws.lock().await;

        if ws.is_some() && !force {
            return Ok(());
        }

        *ws = None; // drop any previous connection before redialing
        let client = self.connector.connect().await?;
        *ws = Some(client);

        if force {
            info!("ws reconnected");
        } else {
            info!("ws connected");
        }
        Ok(())
    }
}

fn backoff(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    MIN_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::transaction::TransactionError;

    fn confirmed_status() -> TransactionStatus {
        TransactionStatus {
            slot: 1,
            confirmations: None,
            status: Ok(()),
            err: None,
            confirmation_status: Some(TransactionConfirmationStatus::Confirmed),
        }
    }

    fn failed_status() -> TransactionStatus {
        TransactionStatus {
            slot: 1,
            confirmations: None,
            status: Err(TransactionError::AccountNotFound),
            err: Some(TransactionError::AccountNotFound),
            confirmation_status: Some(TransactionConfirmationStatus::Confirmed),
        }
    }

    struct StubRpc {
        status: Mutex<Option<TransactionStatus>>,
        calls: AtomicU64,
    }

    impl StubRpc {
        fn returning(status: Option<TransactionStatus>) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl StatusRpc for StubRpc {
        async fn signature_status(
            &self,
            _signature: &Signature,
        ) -> Result<Option<TransactionStatus>, TrackerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.status.lock().unwrap().clone())
        }
    }

    struct StubWs {
        notify_after: Duration,
        subscribes: AtomicU64,
    }

    impl StubWs {
        fn notifying_after(notify_after: Duration) -> Arc<Self> {
            Arc::new(Self {
                notify_after,
                subscribes: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl SignatureWs for StubWs {
        async fn signature_subscribe(
            &self,
            _signature: Signature,
        ) -> Result<SignatureNotification, WsError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            let delay = self.notify_after;
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = tx.send(Ok(()));
            });
            Ok(SignatureNotification { rx })
        }
    }

    struct StubConnector {
        ws: Arc<StubWs>,
        connects: AtomicU64,
        fail_first: AtomicU64,
    }

    impl StubConnector {
        fn new(ws: Arc<StubWs>) -> Arc<Self> {
            Arc::new(Self {
                ws,
                connects: AtomicU64::new(0),
                fail_first: AtomicU64::new(0),
            })
        }

        fn failing_first(ws: Arc<StubWs>, failures: u64) -> Arc<Self> {
            Arc::new(Self {
                ws,
                connects: AtomicU64::new(0),
                fail_first: AtomicU64::new(failures),
            })
        }
    }

    #[async_trait]
    impl WsConnector for StubConnector {
        async fn connect(&self) -> Result<Arc<dyn SignatureWs>, WsError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(WsError::Connect("connection refused".to_string()));
            }
            Ok(self.ws.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_subscription() {
        let ws = StubWs::notifying_after(Duration::from_millis(100));
        let connector = StubConnector::new(ws.clone());
        let tracker =
            SignatureTracker::new(StubRpc::returning(Some(confirmed_status())), connector.clone());
        tracker.start();

        let signature = Signature::default();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.subscribe(signature, Duration::from_secs(30)).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        assert_eq!(ws.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_timeout_does_not_cancel_other_waiters() {
        // WS confirms at 800ms; a 200ms waiter times out, a second caller
        // joining at 500ms still receives the confirmation.
        let ws = StubWs::notifying_after(Duration::from_millis(800));
        let tracker = SignatureTracker::new(
            StubRpc::returning(Some(confirmed_status())),
            StubConnector::new(ws.clone()),
        );
        tracker.start();

        let signature = Signature::default();

        let early = {
            let tracker = tracker.clone();
            tokio::spawn(
                async move { tracker.subscribe(signature, Duration::from_millis(200)).await },
            )
        };
        let late = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(500)).await;
                tracker.subscribe(signature, Duration::from_secs(30)).await
            })
        };

        let early_result = early.await.unwrap();
        assert!(matches!(early_result, Err(TrackerError::NotConfirmed(_))));

        assert!(late.await.unwrap().unwrap());
        assert_eq!(ws.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_failure_resolves_false_without_error() {
        let ws = StubWs::notifying_after(Duration::from_millis(50));
        let tracker = SignatureTracker::new(
            StubRpc::returning(Some(failed_status())),
            StubConnector::new(ws),
        );
        tracker.start();

        let confirmed = tracker
            .subscribe(Signature::default(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_status_resolves_false() {
        let ws = StubWs::notifying_after(Duration::from_millis(50));
        let tracker = SignatureTracker::new(StubRpc::returning(None), StubConnector::new(ws));
        tracker.start();

        let confirmed = tracker
            .subscribe(Signature::default(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_resolves_outstanding_waiters_with_false() {
        // A WS that never notifies within the test horizon
        let ws = StubWs::notifying_after(Duration::from_secs(3600));
        let tracker = SignatureTracker::new(
            StubRpc::returning(Some(confirmed_status())),
            StubConnector::new(ws),
        );
        tracker.start();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .subscribe(Signature::default(), Duration::from_secs(600))
                    .await
            })
        };

        sleep(Duration::from_millis(100)).await;
        tracker.close().await;

        let verdict = waiter.await.unwrap().unwrap();
        assert!(!verdict);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_retries_after_connect_failure() {
        let ws = StubWs::notifying_after(Duration::from_millis(50));
        let connector = StubConnector::failing_first(ws, 1);
        let tracker = SignatureTracker::new(
            StubRpc::returning(Some(confirmed_status())),
            connector.clone(),
        );
        tracker.start();

        let confirmed = tracker
            .subscribe(Signature::default(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(confirmed);
        assert!(connector.connects.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn backoff_is_clamped() {
        assert_eq!(backoff(0), Duration::from_millis(300));
        assert_eq!(backoff(1), Duration::from_millis(600));
        assert_eq!(backoff(2), Duration::from_millis(1200));
        assert_eq!(backoff(3), Duration::from_millis(1200));
        assert_eq!(backoff(31), Duration::from_millis(1200));
    }
}
