use log::{error, info, warn};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    CancelDuelRequest, CreateDuelRequest, Duel, DuelParams, DuelStore, JoinDuelRequest, Player,
    ResolveDuelRequest,
};
use crate::{
    domain::{
        DuelModerationPayload, DuelPlayersJoinedPayload, DuelResolvePayload, Error, LedgerStore,
        Notification, NotificationService, TxRecord, UserStore, VotedForPayload,
    },
    infra::{events::EventHub, share_image::ShareImageClient, solana::Wallet},
};
use duels_core::{
    DuelStatus, PlayerStatus, ResolveStatus, TxType, UserEvent, NOTIFICATION_DUEL_MODERATION,
    NOTIFICATION_DUEL_PLAYERS_JOINED, NOTIFICATION_DUEL_REFUND, NOTIFICATION_DUEL_RESOLVE,
    NOTIFICATION_VOTED_FOR, USDC_PRICE_MULTIPLIER,
};

const PLAYER_MILESTONES: [u64; 3] = [100, 500, 1000];

/// Orchestrates the duel lifecycle: on-chain actions first, then one
/// atomic relational commit, then best-effort notification fan-out.
#[derive(Clone)]
pub struct DuelOrchestrator {
    wallet: Arc<dyn Wallet>,
    duel_store: DuelStore,
    user_store: UserStore,
    ledger: LedgerStore,
    notifications: Arc<NotificationService>,
    hub: EventHub,
    share_image: Option<ShareImageClient>,
    usdc_mint: Pubkey,
}

impl DuelOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet: Arc<dyn Wallet>,
        duel_store: DuelStore,
        user_store: UserStore,
        ledger: LedgerStore,
        notifications: Arc<NotificationService>,
        hub: EventHub,
        share_image: Option<ShareImageClient>,
        usdc_mint: Pubkey,
    ) -> Self {
        Self {
            wallet,
            duel_store,
            user_store,
            ledger,
            notifications,
            hub,
            share_image,
            usdc_mint,
        }
    }

    /// Create a duel whose `init`+`join` transaction the client already
    /// submitted on chain.
    pub async fn create_crypto_duel(
        &self,
        user_id: Uuid,
        req: CreateDuelRequest,
    ) -> Result<Duel, Error> {
        req.validate()?;

        let room_number = match self
            .wallet
            .validate_init_transaction(&req.hash, &req.question, req.duel_price)
            .await
        {
            Ok(room_number) => room_number,
            Err(e) => {
                warn!("transaction validation failed: {}", e);
                return Err(Error::BadRequest("transaction validation failed".to_string()));
            }
        };

        let user = self.user_store.get_by_id(user_id).await?;

        let mut duel = Duel::from_create_request(&req, &user);
        duel.room_number = room_number;

        let mut tx = self.duel_store.begin().await?;
        self.duel_store.insert_duel(&mut tx, &duel).await?;
        self.duel_store
            .join_duel(&mut tx, user.id, duel.id, req.answer)
            .await?;
        if !req.hash.is_empty() {
            self.ledger
                .insert(&mut tx, &TxRecord::new(TxType::DuelPrediction, req.hash.clone()))
                .await?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to create duel: {}", e)))?;
        duel.players_count = 1;

        if let Some(share_image) = &self.share_image {
            if let Err(e) = share_image.request_duel_image(&duel).await {
                warn!("share image request failed: {}", e);
            }
        }

        self.send_notification(
            user.id,
            NOTIFICATION_VOTED_FOR,
            &VotedForPayload {
                duel_id: duel.id,
                duel_name: duel.question.clone(),
                voted_for: req.answer,
            },
        )
        .await;

        Ok(duel)
    }

    /// Join a running duel after the client's `join` transaction landed.
    pub async fn join_crypto_duel(
        &self,
        user_id: Uuid,
        req: JoinDuelRequest,
    ) -> Result<Player, Error> {
        let user = self.user_store.get_by_id(user_id).await?;
        let duel = self.duel_store.get_duel(req.duel_id).await?;

        self.ensure_able_to_join(&duel, user.id).await?;

        if let Err(e) = self.wallet.validate_join_transaction(&req.hash).await {
            warn!("transaction validation failed: {}", e);
            return Err(Error::BadRequest("transaction validation failed".to_string()));
        }

        let mut tx = self.duel_store.begin().await?;
        let player = self
            .duel_store
            .join_duel(&mut tx, user.id, duel.id, req.answer)
            .await?;
        self.ledger
            .insert(&mut tx, &TxRecord::new(TxType::DuelPrediction, req.hash.clone()))
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to join duel: {}", e)))?;

        self.send_notification(
            user.id,
            NOTIFICATION_VOTED_FOR,
            &VotedForPayload {
                duel_id: duel.id,
                duel_name: duel.question.clone(),
                voted_for: req.answer,
            },
        )
        .await;

        let players_count = duel.players_count + 1;
        if PLAYER_MILESTONES.contains(&players_count) {
            self.send_notification(
                duel.owner_id,
                NOTIFICATION_DUEL_PLAYERS_JOINED,
                &DuelPlayersJoinedPayload {
                    duel_id: duel.id,
                    duel_name: duel.question.clone(),
                    players_count,
                },
            )
            .await;
        }

        Ok(player)
    }

    /// Build the external-wallet `init`+`join` transaction for signing.
    pub async fn prepare_create_transaction(
        &self,
        user_id: Uuid,
        req: CreateDuelRequest,
    ) -> Result<String, Error> {
        req.validate()?;
        let user = self.user_store.get_by_id(user_id).await?;
        let duel = Duel::from_create_request(&req, &user);

        self.surface_insufficient_funds(
            user.id,
            self.wallet
                .prepare_create_transaction(&duel, &user, req.answer)
                .await,
        )
    }

    /// Build the external-wallet `join` transaction for signing.
    pub async fn prepare_join_transaction(
        &self,
        user_id: Uuid,
        req: JoinDuelRequest,
    ) -> Result<String, Error> {
        let user = self.user_store.get_by_id(user_id).await?;
        let duel = self.duel_store.get_duel(req.duel_id).await?;

        self.ensure_able_to_join(&duel, user.id).await?;

        self.surface_insufficient_funds(
            user.id,
            self.wallet
                .prepare_join_transaction(&duel, &user, req.answer)
                .await,
        )
    }

    /// Resolve a duel with the owner's verdict. Returns every chain
    /// signature produced along the way.
    pub async fn resolve_by_owner(
        &self,
        owner_id: Uuid,
        req: ResolveDuelRequest,
    ) -> Result<Vec<String>, Error> {
        let duel = self.duel_store.get_duel(req.duel_id).await?;

        if duel.owner_id != owner_id {
            return Err(Error::BadRequest(
                "only the owner of the duel can resolve it".to_string(),
            ));
        }
        if duel.status != DuelStatus::InProcess {
            return Err(Error::BadRequest(
                "resolve is not possible from current status".to_string(),
            ));
        }

        self.resolve_crypto_duel(duel, req.answer).await
    }

    /// Cancel a duel (admin action or expiry housekeeping), refunding the
    /// players when their stakes were already taken.
    pub async fn cancel_duel(&self, req: CancelDuelRequest) -> Result<Vec<String>, Error> {
        let duel = self.duel_store.get_duel(req.duel_id).await?;

        if !duel.status.can_transition(req.status) {
            return Err(Error::BadRequest(format!(
                "cannot cancel duel from its current status ({:?})",
                duel.status
            )));
        }

        let owner_id = duel.owner_id;
        let duel_id = duel.id;
        let duel_name = duel.question.clone();
        let cancellation_reason = req.cancellation_reason.clone();
        let admin_cancelled = req.status == DuelStatus::AdminCancelled;

        let tx_hashes = self.cancel_crypto_duel(duel, req).await?;

        if admin_cancelled {
            self.send_notification(
                owner_id,
                NOTIFICATION_DUEL_MODERATION,
                &DuelModerationPayload {
                    duel_id,
                    duel_name,
                    is_approved: false,
                    cancellation_reason,
                },
            )
            .await;
        }

        Ok(tx_hashes)
    }

    async fn resolve_crypto_duel(
        &self,
        mut duel: Duel,
        verdict: u8,
    ) -> Result<Vec<String>, Error> {
        let deadline = duel.event_date;

        let winners = self
            .duel_store
            .get_duel_winners(duel.id, verdict, deadline)
            .await?;
        let winners_count = winners.len() as u64;

        let players_to_refund = self
            .duel_store
            .count_players_to_refund(duel.id, deadline)
            .await?;

        let players_pool = duel.players_count.saturating_sub(players_to_refund);
        if players_pool == 0 || players_pool == winners_count || winners_count == 0 {
            let cancel = CancelDuelRequest::auto_cancel(&duel);
            return self.cancel_crypto_duel(duel, cancel).await;
        }

        let mut refund_tx_hashes = Vec::new();
        if players_to_refund > 0 {
            refund_tx_hashes = self.partial_crypto_refund(&mut duel, deadline).await?;
        }

        let unpaid_winners = self
            .duel_store
            .get_unpaid_winners(duel.id, verdict)
            .await?;
        if unpaid_winners.is_empty() {
            return Ok(Vec::new());
        }

        let players_count = duel.players_count - duel.refunded_players_count;
        let params = DuelParams::new(duel.duel_price, duel.commission, players_count, winners_count);
        let multiplier = USDC_PRICE_MULTIPLIER as f64;
        let win_amount_units = params.final_crypto_reward(multiplier);
        let display_win_amount = win_amount_units as f64 / multiplier;

        let reward_tx_hashes = self
            .wallet
            .transfer_bulk(win_amount_units, &unpaid_winners, self.usdc_mint)
            .await?;

        let mut records = TxRecord::with_same_type(TxType::DuelReward, &reward_tx_hashes);
        records.extend(TxRecord::with_same_type(TxType::DuelRefund, &refund_tx_hashes));

        let owner = self.user_store.get_by_id(duel.owner_id).await?;
        let commission_units = params.crypto_commission_reward(multiplier);
        let commission_tx_hash = self
            .wallet
            .transfer_commission(
                owner.public_address.as_deref().unwrap_or_default(),
                commission_units,
                self.usdc_mint,
            )
            .await?;
        if let Some(hash) = &commission_tx_hash {
            records.push(TxRecord::new(TxType::DuelCommission, hash.clone()));
        }

        // Room closing failures leave funds reclaimable later; they must
        // not lose the payout bookkeeping.
        let close_tx_hash = match self.wallet.close_room(duel.room_number).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                error!(
                    "failed to close solana room after resolve: {} (duel {}, room {})",
                    e, duel.id, duel.room_number
                );
                None
            }
        };

        duel.status = DuelStatus::Resolved;
        duel.final_result = Some(verdict);
        duel.winners_count = winners_count;

        let winner_player_ids: Vec<Uuid> = winners.iter().map(|p| p.id).collect();
        let winner_user_ids: Vec<Uuid> = winners.iter().map(|p| p.user_id).collect();

        let mut tx = self.duel_store.begin().await?;
        self.duel_store
            .update_duel_winners(&mut tx, &winner_player_ids, display_win_amount)
            .await?;
        self.duel_store.update_duel(&mut tx, &duel).await?;
        self.ledger.insert_many(&mut tx, &records).await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to resolve a duel: {}", e)))?;

        info!(
            "duel {} resolved: {} winners, {} refunds, verdict {}",
            duel.id, winners_count, players_to_refund, verdict
        );

        let mut all_tx_hashes = reward_tx_hashes;
        if let Some(hash) = &commission_tx_hash {
            all_tx_hashes.push(hash.clone());
        }
        if let Some(hash) = close_tx_hash {
            all_tx_hashes.push(hash);
        }
        all_tx_hashes.extend(refund_tx_hashes);

        let this = self.clone();
        let resolved_duel = duel.clone();
        tokio::spawn(async move {
            this.send_resolve_notifications(
                resolved_duel,
                verdict,
                winner_user_ids,
                win_amount_units as f64,
                commission_units as f64,
            )
            .await;
        });

        Ok(all_tx_hashes)
    }

    /// Refund everyone who joined after the event date, marking them
    /// refunded inside one commit with the signature records.
    async fn partial_crypto_refund(
        &self,
        duel: &mut Duel,
        deadline: OffsetDateTime,
    ) -> Result<Vec<String>, Error> {
        if duel.status != DuelStatus::InProcess {
            return Ok(Vec::new());
        }

        let players = self
            .duel_store
            .get_players_to_refund(duel.id, deadline)
            .await?;
        if players.is_empty() {
            return Ok(Vec::new());
        }

        let duel_price_units = (duel.duel_price * USDC_PRICE_MULTIPLIER as f64) as u64;
        let tx_hashes = self
            .wallet
            .transfer_bulk(duel_price_units, &players, self.usdc_mint)
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to refund duel {}: {}", duel.id, e))
            })?;

        let player_ids: Vec<Uuid> = players.iter().map(|p| p.id).collect();

        let mut tx = self.duel_store.begin().await?;
        self.duel_store
            .set_players_status(&mut tx, &player_ids, PlayerStatus::Refunded)
            .await?;
        duel.refunded_players_count += players.len() as u64;
        self.duel_store.update_duel(&mut tx, duel).await?;
        self.ledger
            .insert_many_same_type(&mut tx, TxType::DuelRefund, &tx_hashes)
            .await?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to record refunds: {}", e)))?;

        Ok(tx_hashes)
    }

    async fn cancel_crypto_duel(
        &self,
        mut duel: Duel,
        req: CancelDuelRequest,
    ) -> Result<Vec<String>, Error> {
        let mut tx_hashes = Vec::new();
        let mut close_tx_hash = None;

        if has_charged_duel_price(duel.players_count, duel.status, req.status) {
            let players = self
                .duel_store
                .get_all_players_with_addresses(duel.id)
                .await?;

            let duel_price_units = (duel.duel_price * USDC_PRICE_MULTIPLIER as f64) as u64;
            tx_hashes = self
                .wallet
                .transfer_bulk(duel_price_units, &players, self.usdc_mint)
                .await
                .map_err(|e| {
                    Error::ServiceUnavailable(format!("failed to refund duel {}: {}", duel.id, e))
                })?;

            close_tx_hash = match self.wallet.close_room(duel.room_number).await {
                Ok(hash) => Some(hash),
                Err(e) => {
                    error!(
                        "failed to close solana room after refund: {} (duel {}, room {})",
                        e, duel.id, duel.room_number
                    );
                    None
                }
            };
        }

        let refunds_sent = !tx_hashes.is_empty();
        duel.status = req.status;
        duel.cancellation_reason = req.cancellation_reason;

        let mut tx = self.duel_store.begin().await?;
        self.duel_store.update_duel(&mut tx, &duel).await?;
        self.duel_store
            .set_all_players_status(&mut tx, duel.id, PlayerStatus::Refunded)
            .await?;
        if refunds_sent {
            self.ledger
                .insert_many_same_type(&mut tx, TxType::DuelRefund, &tx_hashes)
                .await?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to cancel duel: {}", e)))?;

        info!(
            "duel {} cancelled ({:?}): {}",
            duel.id, duel.status, duel.cancellation_reason
        );

        if refunds_sent {
            let this = self.clone();
            let cancelled_duel = duel.clone();
            tokio::spawn(async move {
                this.send_refund_notifications(&cancelled_duel).await;
            });
        }

        if let Some(hash) = close_tx_hash {
            tx_hashes.push(hash);
        }

        Ok(tx_hashes)
    }

    async fn ensure_able_to_join(&self, duel: &Duel, user_id: Uuid) -> Result<(), Error> {
        let joinable = matches!(duel.status, DuelStatus::InProcess | DuelStatus::InReview);
        if !joinable {
            return Err(Error::BadRequest("failed to join duel".to_string()));
        }

        if self
            .duel_store
            .user_already_participant(user_id, duel.id)
            .await?
        {
            return Err(Error::BadRequest(
                "user is already participating in this duel".to_string(),
            ));
        }

        Ok(())
    }

    fn surface_insufficient_funds(
        &self,
        user_id: Uuid,
        result: Result<String, Error>,
    ) -> Result<String, Error> {
        if let Err(Error::PaymentRequired(_)) = &result {
            if let Err(e) = self.hub.publish(user_id, &UserEvent::insufficient_funds()) {
                error!("failed to publish insufficient funds event: {}", e);
            }
        }
        result
    }

    async fn send_notification<T: serde::Serialize>(
        &self,
        user_id: Uuid,
        notification_type: u8,
        payload: &T,
    ) {
        let notification = match Notification::new(user_id, notification_type, payload) {
            Ok(notification) => notification,
            Err(e) => {
                error!("failed to build notification: {}", e);
                return;
            }
        };

        if let Err(e) = self.notifications.publish(&notification).await {
            error!("failed to send notification: {}", e);
        }
    }

    async fn send_resolve_notifications(
        &self,
        duel: Duel,
        verdict: u8,
        winner_user_ids: Vec<Uuid>,
        win_amount: f64,
        creator_commission: f64,
    ) {
        for user_id in winner_user_ids {
            self.send_notification(
                user_id,
                NOTIFICATION_DUEL_RESOLVE,
                &DuelResolvePayload {
                    duel_id: duel.id,
                    duel_name: duel.question.clone(),
                    voted_for: verdict,
                    amount: win_amount,
                    status: ResolveStatus::Won as u8,
                },
            )
            .await;
        }

        let wrong_answer = 1 - verdict.min(1);
        match self
            .duel_store
            .get_loser_ids(duel.id, wrong_answer, duel.event_date)
            .await
        {
            Ok(loser_ids) => {
                for user_id in loser_ids {
                    self.send_notification(
                        user_id,
                        NOTIFICATION_DUEL_RESOLVE,
                        &DuelResolvePayload {
                            duel_id: duel.id,
                            duel_name: duel.question.clone(),
                            voted_for: wrong_answer,
                            amount: duel.duel_price,
                            status: ResolveStatus::Lost as u8,
                        },
                    )
                    .await;
                }
            }
            Err(e) => error!("failed to get duel loser ids: {}", e),
        }

        self.send_refund_outcome_notifications(&duel, NOTIFICATION_DUEL_RESOLVE)
            .await;

        if creator_commission != 0.0 {
            self.send_notification(
                duel.owner_id,
                NOTIFICATION_DUEL_RESOLVE,
                &DuelResolvePayload {
                    duel_id: duel.id,
                    duel_name: duel.question.clone(),
                    voted_for: verdict,
                    amount: creator_commission,
                    status: ResolveStatus::Commission as u8,
                },
            )
            .await;
        }
    }

    async fn send_refund_notifications(&self, duel: &Duel) {
        self.send_refund_outcome_notifications(duel, NOTIFICATION_DUEL_REFUND)
            .await;
    }

    async fn send_refund_outcome_notifications(&self, duel: &Duel, notification_type: u8) {
        let refunded = match self.duel_store.get_refunded_players(duel.id).await {
            Ok(players) => players,
            Err(e) => {
                error!("failed to get refunded players: {}", e);
                return;
            }
        };

        for player in refunded {
            self.send_notification(
                player.user_id,
                notification_type,
                &DuelResolvePayload {
                    duel_id: duel.id,
                    duel_name: duel.question.clone(),
                    voted_for: player.answer,
                    amount: duel.duel_price,
                    status: ResolveStatus::Refund as u8,
                },
            )
            .await;
        }
    }
}

/// Whether stakes were already collected for the transition, meaning a
/// cancellation owes refunds.
pub fn has_charged_duel_price(
    players_count: u64,
    old_status: DuelStatus,
    new_status: DuelStatus,
) -> bool {
    let in_process_refund =
        old_status == DuelStatus::InProcess && new_status == DuelStatus::Refund;
    let review_admin_cancel =
        old_status == DuelStatus::InReview && new_status == DuelStatus::AdminCancelled;

    (in_process_refund || review_admin_cancel) && players_count > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{PlayerWithAddress, User},
        infra::db::DBConnection,
    };
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    };
    use time::{format_description::well_known::Rfc3339, Duration};

    struct StubWallet {
        transfer_calls: Mutex<Vec<(u64, usize)>>,
        commission_calls: Mutex<Vec<(String, u64)>>,
        close_calls: AtomicU64,
        sig_counter: AtomicU64,
        fail_transfers: bool,
        insufficient_funds: bool,
    }

    impl StubWallet {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                transfer_calls: Mutex::new(Vec::new()),
                commission_calls: Mutex::new(Vec::new()),
                close_calls: AtomicU64::new(0),
                sig_counter: AtomicU64::new(1),
                fail_transfers: false,
                insufficient_funds: false,
            })
        }

        fn broke() -> Arc<Self> {
            Arc::new(Self {
                transfer_calls: Mutex::new(Vec::new()),
                commission_calls: Mutex::new(Vec::new()),
                close_calls: AtomicU64::new(0),
                sig_counter: AtomicU64::new(1),
                fail_transfers: false,
                insufficient_funds: true,
            })
        }

        fn fresh_signature(&self) -> String {
            let n = self.sig_counter.fetch_add(1, Ordering::SeqCst);
            let mut raw = [0u8; 64];
            raw[..8].copy_from_slice(&n.to_le_bytes());
            solana_sdk::signature::Signature::from(raw).to_string()
        }
    }

    #[async_trait]
    impl Wallet for StubWallet {
        async fn validate_init_transaction(
            &self,
            _tx_hash: &str,
            _question: &str,
            _duel_price: f64,
        ) -> Result<u64, Error> {
            Ok(4711)
        }

        async fn validate_join_transaction(&self, _tx_hash: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn transfer_bulk(
            &self,
            amount: u64,
            recipients: &[PlayerWithAddress],
            _mint: Pubkey,
        ) -> Result<Vec<String>, Error> {
            if self.fail_transfers {
                return Err(Error::ServiceUnavailable("rpc down".to_string()));
            }
            self.transfer_calls
                .lock()
                .unwrap()
                .push((amount, recipients.len()));

            let batches = recipients.len().div_ceil(32);
            Ok((0..batches).map(|_| self.fresh_signature()).collect())
        }

        async fn transfer_commission(
            &self,
            recipient_address: &str,
            amount: u64,
            _mint: Pubkey,
        ) -> Result<Option<String>, Error> {
            if amount == 0 {
                return Ok(None);
            }
            self.commission_calls
                .lock()
                .unwrap()
                .push((recipient_address.to_string(), amount));
            Ok(Some(self.fresh_signature()))
        }

        async fn close_room(&self, _room_number: u64) -> Result<String, Error> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.fresh_signature())
        }

        async fn prepare_create_transaction(
            &self,
            _duel: &Duel,
            _user: &User,
            _answer: u8,
        ) -> Result<String, Error> {
            if self.insufficient_funds {
                return Err(Error::PaymentRequired(
                    "insufficient funds for proceeding a transaction".to_string(),
                ));
            }
            Ok("c2lnbmVk".to_string())
        }

        async fn prepare_join_transaction(
            &self,
            _duel: &Duel,
            _user: &User,
            _answer: u8,
        ) -> Result<String, Error> {
            if self.insufficient_funds {
                return Err(Error::PaymentRequired(
                    "insufficient funds for proceeding a transaction".to_string(),
                ));
            }
            Ok("c2lnbmVk".to_string())
        }
    }

    struct Harness {
        orchestrator: DuelOrchestrator,
        wallet: Arc<StubWallet>,
        duels: DuelStore,
        users: UserStore,
        ledger: LedgerStore,
        notifications: Arc<NotificationService>,
        hub: EventHub,
        pool: SqlitePool,
    }

    fn setup(pool: SqlitePool) -> Harness {
        setup_with_wallet(pool, StubWallet::new())
    }

    fn setup_with_wallet(pool: SqlitePool, wallet: Arc<StubWallet>) -> Harness {
        let db = DBConnection::new_with_pools(
            "test".to_string(),
            ":memory:".to_string(),
            pool.clone(),
            pool.clone(),
        );
        let duels = DuelStore::new(db.clone());
        let users = UserStore::new(db.clone());
        let ledger = LedgerStore::new(db.clone());
        let hub = EventHub::new();
        let notifications = Arc::new(NotificationService::new(db, hub.clone()));

        let orchestrator = DuelOrchestrator::new(
            wallet.clone(),
            duels.clone(),
            users.clone(),
            ledger.clone(),
            notifications.clone(),
            hub.clone(),
            None,
            Pubkey::new_unique(),
        );

        Harness {
            orchestrator,
            wallet,
            duels,
            users,
            ledger,
            notifications,
            hub,
            pool,
        }
    }

    async fn seed_user(h: &Harness, name: &str) -> User {
        let mut user = User::test_user(name);
        user.public_address = Some(format!("addr_{}", name));
        h.users.create_user(&user).await.unwrap();
        user
    }

    async fn seed_duel(h: &Harness, owner: &User, price: f64, commission: u64) -> Duel {
        let request = CreateDuelRequest {
            image_url: String::new(),
            bg_url: String::new(),
            question: "Will SOL close above 200?".to_string(),
            duel_price: price,
            commission,
            duel_info: None,
            event_date: OffsetDateTime::now_utc(),
            answer: 1,
            hash: String::new(),
        };
        let duel = Duel::from_create_request(&request, owner);

        let mut tx = h.duels.begin().await.unwrap();
        h.duels.insert_duel(&mut tx, &duel).await.unwrap();
        tx.commit().await.unwrap();
        duel
    }

    async fn join_at(h: &Harness, duel: &Duel, user: &User, answer: u8, offset: Duration) {
        let mut tx = h.duels.begin().await.unwrap();
        h.duels
            .join_duel(&mut tx, user.id, duel.id, answer)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let created_at = duel.event_date + offset;
        sqlx::query("UPDATE players SET created_at = ? WHERE user_id = ? AND duel_id = ?")
            .bind(created_at.format(&Rfc3339).unwrap())
            .bind(user.id.to_string())
            .bind(duel.id.to_string())
            .execute(&h.pool)
            .await
            .unwrap();
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn unanimous_predictions_take_the_cancel_path(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;

        let a = seed_user(&h, "a").await;
        let b = seed_user(&h, "b").await;
        join_at(&h, &duel, &a, 1, Duration::seconds(-10)).await;
        join_at(&h, &duel, &b, 1, Duration::seconds(-5)).await;

        let hashes = h
            .orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await
            .unwrap();

        // one refund batch plus the room-closing signature
        assert_eq!(hashes.len(), 2);
        assert_eq!(*h.wallet.transfer_calls.lock().unwrap(), vec![(10_000_000, 2)]);
        assert_eq!(h.wallet.close_calls.load(Ordering::SeqCst), 1);

        let cancelled = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(cancelled.status, DuelStatus::Refund);
        assert_eq!(
            cancelled.cancellation_reason,
            super::super::SAME_PREDICTION_CANCELLATION_REASON
        );
        assert!(cancelled.final_result.is_none());

        let refunded = h.duels.get_refunded_players(duel.id).await.unwrap();
        assert_eq!(refunded.len(), 2);

        let records = h.ledger.get_by_signatures(&hashes[..1].to_vec()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_type, TxType::DuelRefund);
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn late_joiner_is_refunded_and_winner_rewarded(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;

        let a = seed_user(&h, "a").await;
        let b = seed_user(&h, "b").await;
        let c = seed_user(&h, "c").await;
        join_at(&h, &duel, &a, 1, Duration::seconds(-10)).await;
        join_at(&h, &duel, &b, 0, Duration::seconds(-5)).await;
        join_at(&h, &duel, &c, 1, Duration::seconds(5)).await;

        let hashes = h
            .orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await
            .unwrap();

        // reward + commission + close + refund
        assert_eq!(hashes.len(), 4);

        // refund of the stake to C, then the reward transfer to A
        let transfers = h.wallet.transfer_calls.lock().unwrap().clone();
        assert_eq!(transfers, vec![(10_000_000, 1), (19_000_000, 1)]);

        // half of the 5% commission on the 2-player pool
        let commissions = h.wallet.commission_calls.lock().unwrap().clone();
        assert_eq!(commissions, vec![("addr_owner".to_string(), 500_000)]);

        let resolved = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(resolved.status, DuelStatus::Resolved);
        assert_eq!(resolved.final_result, Some(1));
        assert_eq!(resolved.winners_count, 1);
        assert_eq!(resolved.refunded_players_count, 1);

        let winners = h
            .duels
            .get_duel_winners(duel.id, 1, duel.event_date)
            .await
            .unwrap();
        assert_eq!(winners.len(), 1);
        assert!(winners[0].is_winner);
        assert_eq!(winners[0].win_amount, 19.0);
        assert_eq!(winners[0].final_status, PlayerStatus::Resolved);

        // every signature minted by the stub landed in the ledger
        let recorded = h.ledger.get_by_signatures(&hashes).await.unwrap();
        assert_eq!(recorded.len(), 3, "close signature is not a ledger entry");

        // notifications fan out after commit
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let winner_inbox = h.notifications.get_for_user(a.id).await.unwrap();
        assert_eq!(winner_inbox.len(), 1);
        assert_eq!(winner_inbox[0].data["status"], ResolveStatus::Won as u8);
        assert_eq!(winner_inbox[0].data["amount"], 19_000_000.0);

        let loser_inbox = h.notifications.get_for_user(b.id).await.unwrap();
        assert_eq!(loser_inbox[0].data["status"], ResolveStatus::Lost as u8);
        assert_eq!(loser_inbox[0].data["amount"], 10.0);

        let refund_inbox = h.notifications.get_for_user(c.id).await.unwrap();
        assert_eq!(refund_inbox[0].data["status"], ResolveStatus::Refund as u8);

        let owner_inbox = h.notifications.get_for_user(owner.id).await.unwrap();
        assert_eq!(owner_inbox[0].data["status"], ResolveStatus::Commission as u8);

        // replay is rejected by the status guard
        let replay = h
            .orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await;
        assert!(matches!(replay, Err(Error::BadRequest(_))));
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn zero_winners_take_the_cancel_path(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;

        let a = seed_user(&h, "a").await;
        let b = seed_user(&h, "b").await;
        join_at(&h, &duel, &a, 0, Duration::seconds(-10)).await;
        join_at(&h, &duel, &b, 0, Duration::seconds(-5)).await;

        h.orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await
            .unwrap();

        let cancelled = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(cancelled.status, DuelStatus::Refund);
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn hundred_winners_pay_out_in_four_batches(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 2.0, 0).await;

        for i in 0..100 {
            let user = seed_user(&h, &format!("w{}", i)).await;
            join_at(&h, &duel, &user, 1, Duration::seconds(-30)).await;
        }
        let loser = seed_user(&h, "loser").await;
        join_at(&h, &duel, &loser, 0, Duration::seconds(-30)).await;

        let hashes = h
            .orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await
            .unwrap();

        // 4 reward batches + close (commission is zero)
        assert_eq!(hashes.len(), 5);

        let reward_records = h.ledger.get_by_signatures(&hashes).await.unwrap();
        assert_eq!(reward_records.len(), 4);
        assert!(reward_records.iter().all(|r| r.tx_type == TxType::DuelReward));

        let resolved = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(resolved.winners_count, 100);
        assert!(h.duels.get_unpaid_winners(duel.id, 1).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn create_records_duel_owner_player_and_prediction(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let prediction_hash = h.wallet.fresh_signature();

        let request = CreateDuelRequest {
            image_url: String::new(),
            bg_url: String::new(),
            question: "Will SOL close above 200?".to_string(),
            duel_price: 10.0,
            commission: 5,
            duel_info: None,
            event_date: OffsetDateTime::now_utc() + Duration::hours(1),
            answer: 1,
            hash: prediction_hash.clone(),
        };

        let duel = h
            .orchestrator
            .create_crypto_duel(owner.id, request)
            .await
            .unwrap();

        assert_eq!(duel.room_number, 4711);
        assert_eq!(duel.players_count, 1);
        assert_eq!(duel.status, DuelStatus::InProcess);

        let stored = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(stored.players_count, 1);
        assert!(h
            .duels
            .user_already_participant(owner.id, duel.id)
            .await
            .unwrap());

        let records = h
            .ledger
            .get_by_signatures(&[prediction_hash])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_type, TxType::DuelPrediction);
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn join_gates_reject_participants_and_settled_duels(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;
        let player = seed_user(&h, "player").await;

        let join = JoinDuelRequest {
            duel_id: duel.id,
            answer: 1,
            hash: h.wallet.fresh_signature(),
        };
        h.orchestrator
            .join_crypto_duel(player.id, join.clone())
            .await
            .unwrap();

        let rejoin = h.orchestrator.join_crypto_duel(player.id, join).await;
        assert!(matches!(rejoin, Err(Error::BadRequest(_))));

        // settle the duel, joining becomes impossible
        let late = seed_user(&h, "late").await;
        let mut tx = h.duels.begin().await.unwrap();
        let mut settled = h.duels.get_duel(duel.id).await.unwrap();
        settled.status = DuelStatus::Resolved;
        h.duels.update_duel(&mut tx, &settled).await.unwrap();
        tx.commit().await.unwrap();

        let join_settled = h
            .orchestrator
            .join_crypto_duel(
                late.id,
                JoinDuelRequest {
                    duel_id: duel.id,
                    answer: 0,
                    hash: h.wallet.fresh_signature(),
                },
            )
            .await;
        assert!(matches!(join_settled, Err(Error::BadRequest(_))));
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn resolve_requires_the_owner(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;
        let stranger = seed_user(&h, "stranger").await;

        let result = h
            .orchestrator
            .resolve_by_owner(stranger.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await;
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn resolve_without_players_auto_cancels_without_chain_action(pool: SqlitePool) {
        let h = setup(pool);
        let owner = seed_user(&h, "owner").await;
        let duel = seed_duel(&h, &owner, 10.0, 5).await;

        let hashes = h
            .orchestrator
            .resolve_by_owner(owner.id, ResolveDuelRequest { duel_id: duel.id, answer: 1 })
            .await
            .unwrap();

        assert!(hashes.is_empty());
        assert!(h.wallet.transfer_calls.lock().unwrap().is_empty());
        assert_eq!(h.wallet.close_calls.load(Ordering::SeqCst), 0);

        let cancelled = h.duels.get_duel(duel.id).await.unwrap();
        assert_eq!(cancelled.status, DuelStatus::AutoCancelled);
        assert_eq!(
            cancelled.cancellation_reason,
            super::super::LACK_OF_PARTICIPANTS_CANCELLATION_REASON
        );
    }

    #[sqlx::test(migrations = "./migrations/duels")]
    async fn insufficient_funds_surfaces_and_publishes_event(pool: SqlitePool) {
        let h = setup_with_wallet(pool, StubWallet::broke());
        let user = seed_user(&h, "payer").await;
        let mut events = h.hub.subscribe(user.id);

        let request = CreateDuelRequest {
            image_url: String::new(),
            bg_url: String::new(),
            question: "Will SOL close above 200?".to_string(),
            duel_price: 10.0,
            commission: 5,
            duel_info: None,
            event_date: OffsetDateTime::now_utc() + Duration::hours(1),
            answer: 1,
            hash: String::new(),
        };

        let result = h
            .orchestrator
            .prepare_create_transaction(user.id, request)
            .await;
        assert!(matches!(result, Err(Error::PaymentRequired(_))));

        let event = events.try_recv().unwrap();
        assert_eq!(event, r#"{"type":1}"#);

        // No duel row was created along the way
        let duel_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duels")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(duel_count, 0);
    }

    #[test]
    fn charge_detection_truth_table() {
        use DuelStatus::*;

        assert!(has_charged_duel_price(3, InProcess, Refund));
        assert!(has_charged_duel_price(1, InReview, AdminCancelled));

        assert!(!has_charged_duel_price(0, InProcess, Refund));
        assert!(!has_charged_duel_price(0, InReview, AdminCancelled));
        assert!(!has_charged_duel_price(3, InProcess, AutoCancelled));
        assert!(!has_charged_duel_price(3, InReview, InProcess));
        assert!(!has_charged_duel_price(3, InProcess, AdminCancelled));
    }
}
