use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{error, warn};
use solana_client::{
    nonblocking::rpc_client::RpcClient,
    rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig, RpcTransactionConfig},
};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::Transaction,
};
use solana_transaction_status::UiTransactionEncoding;
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account,
};
use std::{str::FromStr, sync::Arc, time::Duration};

use super::{
    contract::{instructions_from, ContractGateway, ContractRequest, Endpoint},
    fees::PriorityFees,
    logs::{is_account_uninitialized, parse_logs_for_error, ACCOUNT_UNINITIALIZED_MESSAGE},
    tracker::SignatureTracker,
};
use crate::domain::{Duel, Error, PlayerWithAddress, User};
use duels_core::USDC_PRICE_MULTIPLIER;

pub const TX_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRANSFER_INSTRUCTIONS_PER_TRANSACTION: usize = 32;
pub const CU_EXTRA_CAPACITY_COEFFICIENT: f64 = 1.20;
pub const FALLBACK_CU_TRANSFER: u32 = 25_000;
const CU_BASE_PADDING: f64 = 300.0;
const SEND_MAX_RETRIES: usize = 10;

/// Chain operations the orchestrator depends on.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Verify a client-submitted `init` transaction and extract the room
    /// number assigned by the program.
    async fn validate_init_transaction(
        &self,
        tx_hash: &str,
        question: &str,
        duel_price: f64,
    ) -> Result<u64, Error>;

    /// Verify a client-submitted `join` transaction.
    async fn validate_join_transaction(&self, tx_hash: &str) -> Result<(), Error>;

    /// Send `amount` base units to every recipient, batching transfers into
    /// transactions of at most 32 instructions. Returns one signature per
    /// batch, in order.
    async fn transfer_bulk(
        &self,
        amount: u64,
        recipients: &[PlayerWithAddress],
        mint: Pubkey,
    ) -> Result<Vec<String>, Error>;

    /// Pay the creator commission, creating the recipient's associated
    /// token account when missing. `Ok(None)` when the amount is zero.
    async fn transfer_commission(
        &self,
        recipient_address: &str,
        amount: u64,
        mint: Pubkey,
    ) -> Result<Option<String>, Error>;

    /// Close the on-chain room and wait for confirmation.
    async fn close_room(&self, room_number: u64) -> Result<String, Error>;

    /// Build the `init`+`join` transaction for an external wallet: admin
    /// partially signed, base64 encoded, payer set to the user.
    async fn prepare_create_transaction(
        &self,
        duel: &Duel,
        user: &User,
        answer: u8,
    ) -> Result<String, Error>;

    /// Build the `join` transaction for an external wallet.
    async fn prepare_join_transaction(
        &self,
        duel: &Duel,
        user: &User,
        answer: u8,
    ) -> Result<String, Error>;
}

/// Builds, sizes, signs and submits transactions with the admin key.
pub struct WalletService {
    rpc: Arc<RpcClient>,
    gateway: ContractGateway,
    tracker: Arc<SignatureTracker>,
    fees: Arc<PriorityFees>,
    admin_keypair: Keypair,
    program_address: String,
    usdc_mint: Pubkey,
}

impl WalletService {
    pub fn new(
        rpc: Arc<RpcClient>,
        gateway: ContractGateway,
        tracker: Arc<SignatureTracker>,
        fees: Arc<PriorityFees>,
        admin_private_key: &str,
        program_address: String,
        usdc_mint: Pubkey,
    ) -> Result<Self, Error> {
        let key_bytes = bs58::decode(admin_private_key)
            .into_vec()
            .map_err(|e| {
                Error::Internal(format!("failed to decode solana admin private key: {}", e))
            })?;
        let admin_keypair = Keypair::try_from(key_bytes.as_slice()).map_err(|e| {
            Error::Internal(format!("failed to parse solana admin private key: {}", e))
        })?;
        Ok(Self {
            rpc,
            gateway,
            tracker,
            fees,
            admin_keypair,
            program_address,
            usdc_mint,
        })
    }

    fn admin_pubkey(&self) -> Pubkey {
        self.admin_keypair.pubkey()
    }

    /// Simulate a throwaway signed transaction and read the consumed
    /// compute units. The blockhash is replaced server side, so the
    /// transaction can carry an empty one.
    pub async fn simulation_compute_units(&self, tx: &Transaction) -> Result<u32, Error> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false, // conflicts with replace_recent_blockhash
            replace_recent_blockhash: true,
            ..Default::default()
        };

        let response = self
            .rpc
            .simulate_transaction_with_config(tx, config)
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to send simulation transaction: {}", e))
            })?;

        let result = response.value;
        if let Some(sim_err) = result.err {
            let err_text = format!("{:?}", sim_err);
            error!("transaction simulation: {}", err_text);

            if is_account_uninitialized(&err_text) {
                return Err(Error::Internal(ACCOUNT_UNINITIALIZED_MESSAGE.to_string()));
            }
            return Err(parse_logs_for_error(&result.logs.unwrap_or_default()));
        }

        let units = result
            .units_consumed
            .ok_or_else(|| Error::Internal("transaction simulation: 0 units consumed".to_string()))?;

        Ok(units as u32)
    }

    fn transaction_for_simulation(&self, instructions: &[Instruction]) -> Result<Transaction, Error> {
        let message = Message::new(instructions, Some(&self.admin_pubkey()));
        let mut tx = Transaction::new_unsigned(message);
        // Latest blockhash is attached just before sending or replaced
        // during simulation
        tx.try_sign(&[&self.admin_keypair], Hash::default())
            .map_err(|e| {
                Error::Internal(format!("failed to sign a transaction for simulation: {}", e))
            })?;
        Ok(tx)
    }

    /// CU budget for a batch: simulation result padded by the capacity
    /// coefficient, or the flat per-transfer fallback when simulation
    /// fails on a multi-instruction batch.
    async fn budget_compute_units(&self, tx: &Transaction, instruction_count: usize) -> u32 {
        let units = match self.simulation_compute_units(tx).await {
            Ok(units) => units,
            Err(e) => {
                warn!("compute unit simulation failed: {}", e);
                if instruction_count > 1 {
                    FALLBACK_CU_TRANSFER * instruction_count as u32
                } else {
                    0
                }
            }
        };

        (units as f64 * CU_EXTRA_CAPACITY_COEFFICIENT + CU_BASE_PADDING).round() as u32
    }

    /// Refresh the blockhash at Finalized, re-sign, and submit.
    async fn send_transaction(&self, tx: &mut Transaction) -> Result<Signature, Error> {
        let (blockhash, _) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::finalized())
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to get latest block hash: {}", e))
            })?;

        tx.try_sign(&[&self.admin_keypair], blockhash)
            .map_err(|e| Error::Internal(format!("failed to sign transaction: {}", e)))?;

        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: Some(CommitmentLevel::Finalized),
            max_retries: Some(SEND_MAX_RETRIES),
            ..Default::default()
        };

        self.rpc
            .send_transaction_with_config(tx, config)
            .await
            .map_err(|e| Error::Internal(format!("failed to send transaction: {}", e)))
    }

    /// Send and block on the tracker's confirmation verdict.
    async fn send_with_tracker(&self, tx: &mut Transaction) -> Result<Signature, Error> {
        let signature = self.send_transaction(tx).await?;

        let confirmed = match self
            .tracker
            .subscribe(signature, TX_CONFIRMATION_TIMEOUT)
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) if e.is_not_confirmed() => false,
            Err(e) => {
                return Err(Error::Internal(format!(
                    "subscribe to signature status: {}",
                    e
                )))
            }
        };

        if !confirmed {
            return Err(Error::Internal(format!("tx was not confirmed: {}", signature)));
        }

        Ok(signature)
    }

    /// The full single-transaction pipeline: simulate, prepend the compute
    /// budget at high priority, refresh the blockhash, sign and send.
    pub async fn send_instructions(&self, instructions: &[Instruction]) -> Result<Signature, Error> {
        let sim_tx = self.transaction_for_simulation(instructions)?;
        let units = self.budget_compute_units(&sim_tx, instructions.len()).await;

        let mut all = Vec::with_capacity(instructions.len() + 2);
        // Compute unit price and limit must be the first two instructions
        all.push(ComputeBudgetInstruction::set_compute_unit_price(
            self.fees.high_micro_lamports(),
        ));
        all.push(ComputeBudgetInstruction::set_compute_unit_limit(units));
        all.extend_from_slice(instructions);

        let message = Message::new(&all, Some(&self.admin_pubkey()));
        let mut tx = Transaction::new_unsigned(message);

        self.send_transaction(&mut tx).await
    }

    /// Fetch a raw transaction from the contract service and turn it into
    /// a budgeted instruction list: blockhash attached, admin-signed once
    /// to surface simulation errors, compute budget (medium priority)
    /// prepended, instructions decompiled.
    pub async fn build_instructions(
        &self,
        endpoint: Endpoint,
        request: &ContractRequest,
    ) -> Result<Vec<Instruction>, Error> {
        let mut tx = self.gateway.fetch_transaction(endpoint, request).await?;

        let (blockhash, _) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::finalized())
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to get latest block hash: {}", e))
            })?;

        tx.message.recent_blockhash = blockhash;
        tx.try_partial_sign(&[&self.admin_keypair], blockhash)
            .map_err(|e| Error::Internal(format!("failed to sign a transaction: {}", e)))?;

        let units = self.simulation_compute_units(&tx).await?;
        let units = (units as f64 * CU_EXTRA_CAPACITY_COEFFICIENT).round() as u32;

        let mut instructions = Vec::with_capacity(tx.message.instructions.len() + 2);
        instructions.push(ComputeBudgetInstruction::set_compute_unit_price(
            self.fees.medium_micro_lamports(),
        ));
        instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(units));
        instructions.extend(instructions_from(&tx)?);

        Ok(instructions)
    }

    fn transfer_instructions(
        &self,
        amount: u64,
        recipients: &[PlayerWithAddress],
        mint: &Pubkey,
    ) -> Result<Vec<Instruction>, Error> {
        let sender_token_account = get_associated_token_address(&self.admin_pubkey(), mint);

        let mut instructions = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let recipient_key = parse_recipient_address(&recipient.public_address)?;
            let recipient_token_account = get_associated_token_address(&recipient_key, mint);

            let transfer = spl_token::instruction::transfer(
                &spl_token::id(),
                &sender_token_account,
                &recipient_token_account,
                &self.admin_pubkey(),
                &[],
                amount,
            )
            .map_err(|e| Error::Internal(format!("failed to build transfer instruction: {}", e)))?;

            instructions.push(transfer);
        }

        Ok(instructions)
    }

    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64, Error> {
        let balance = self
            .rpc
            .get_token_account_balance_with_commitment(token_account, CommitmentConfig::confirmed())
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_account_uninitialized(&message) {
                    Error::BadRequest(ACCOUNT_UNINITIALIZED_MESSAGE.to_string())
                } else {
                    Error::ServiceUnavailable(format!("failed to get ata balance: {}", message))
                }
            })?;

        balance
            .value
            .amount
            .parse()
            .map_err(|e| Error::ServiceUnavailable(format!("failed to parse token balance: {}", e)))
    }

    pub async fn has_enough_token_balance(
        &self,
        token_account: &Pubkey,
        required_amount: f64,
    ) -> Result<bool, Error> {
        let balance = self.token_balance(token_account).await?;
        Ok(balance as f64 >= required_amount)
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<String, Error> {
        let config = RpcTransactionConfig {
            commitment: Some(CommitmentConfig::confirmed()),
            encoding: Some(UiTransactionEncoding::Base64),
            max_supported_transaction_version: Some(0),
        };

        let tx_info = self
            .rpc
            .get_transaction_with_config(signature, config)
            .await
            .map_err(|e| Error::Internal(format!("failed to get transaction by tx hash: {}", e)))?;

        let meta = tx_info
            .transaction
            .meta
            .ok_or_else(|| Error::Internal("transaction meta is missing".to_string()))?;

        let logs: Vec<String> = Option::from(meta.log_messages).unwrap_or_default();
        Ok(logs.join(", "))
    }

    async fn confirm_or_fail(&self, tx_hash: &str) -> Result<Signature, Error> {
        let signature = Signature::from_str(tx_hash)
            .map_err(|_| Error::BadRequest("failed to parse tx hash".to_string()))?;

        let confirmed = match self
            .tracker
            .subscribe(signature, TX_CONFIRMATION_TIMEOUT)
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) if e.is_not_confirmed() => false,
            Err(e) => {
                return Err(Error::Internal(format!(
                    "subscribe to signature status: {}",
                    e
                )))
            }
        };

        if !confirmed {
            return Err(Error::Internal(format!("tx was not confirmed: {}", signature)));
        }

        Ok(signature)
    }
}

#[async_trait]
impl Wallet for WalletService {
    async fn validate_init_transaction(
        &self,
        tx_hash: &str,
        question: &str,
        duel_price: f64,
    ) -> Result<u64, Error> {
        let signature = self.confirm_or_fail(tx_hash).await?;
        let logs = self.transaction_logs(&signature).await?;

        if !logs.contains("Instruction: Init") {
            return Err(Error::BadRequest("invalid instruction".to_string()));
        }
        if !logs.contains(&format!("Description: {}", question)) {
            return Err(Error::BadRequest("invalid description".to_string()));
        }
        if !logs.contains(&format!("Bet: {} USDC", duel_price as i64)) {
            return Err(Error::BadRequest("invalid bet".to_string()));
        }
        if !logs.contains(&format!(
            "Current executing program address: {}",
            self.program_address
        )) {
            return Err(Error::BadRequest("invalid program address".to_string()));
        }

        extract_room_number(&logs)
            .ok_or_else(|| Error::BadRequest("room number not found".to_string()))
    }

    async fn validate_join_transaction(&self, tx_hash: &str) -> Result<(), Error> {
        let signature = self.confirm_or_fail(tx_hash).await?;
        let logs = self.transaction_logs(&signature).await?;

        if !logs.contains("Instruction: Join") {
            return Err(Error::BadRequest("invalid instruction".to_string()));
        }
        if !logs.contains(&format!(
            "Current executing program address: {}",
            self.program_address
        )) {
            return Err(Error::BadRequest("invalid program address".to_string()));
        }

        Ok(())
    }

    async fn transfer_bulk(
        &self,
        amount: u64,
        recipients: &[PlayerWithAddress],
        mint: Pubkey,
    ) -> Result<Vec<String>, Error> {
        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        let instructions = self.transfer_instructions(amount, recipients, &mint)?;
        let batches = chunk_instructions(&instructions);

        let mut signatures = Vec::with_capacity(batches.len());
        for batch in batches {
            let sim_tx = self.transaction_for_simulation(batch)?;
            let units = self.budget_compute_units(&sim_tx, batch.len()).await;

            let mut all = Vec::with_capacity(batch.len() + 2);
            // Compute unit price and limit must be the first two instructions
            all.push(ComputeBudgetInstruction::set_compute_unit_price(
                self.fees.high_micro_lamports(),
            ));
            all.push(ComputeBudgetInstruction::set_compute_unit_limit(units));
            all.extend_from_slice(batch);

            let message = Message::new(&all, Some(&self.admin_pubkey()));
            let mut tx = Transaction::new_unsigned(message);

            let signature = self.send_transaction(&mut tx).await?;
            signatures.push(signature.to_string());
        }

        Ok(signatures)
    }

    async fn transfer_commission(
        &self,
        recipient_address: &str,
        amount: u64,
        mint: Pubkey,
    ) -> Result<Option<String>, Error> {
        if amount == 0 {
            return Ok(None);
        }

        let sender_token_account = get_associated_token_address(&self.admin_pubkey(), &mint);
        let recipient_key = parse_recipient_address(recipient_address)?;
        let recipient_token_account = get_associated_token_address(&recipient_key, &mint);

        let account = self
            .rpc
            .get_account_with_commitment(&recipient_token_account, CommitmentConfig::confirmed())
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to get recipient's account info: {}", e))
            })?;

        let mut instructions = Vec::with_capacity(2);
        if account.value.is_none() {
            instructions.push(create_associated_token_account(
                &self.admin_pubkey(),
                &recipient_key,
                &mint,
                &spl_token::id(),
            ));
        }

        let transfer = spl_token::instruction::transfer(
            &spl_token::id(),
            &sender_token_account,
            &recipient_token_account,
            &self.admin_pubkey(),
            &[],
            amount,
        )
        .map_err(|e| Error::Internal(format!("failed to build transfer instruction: {}", e)))?;
        instructions.push(transfer);

        let signature = self.send_instructions(&instructions).await?;
        Ok(Some(signature.to_string()))
    }

    async fn close_room(&self, room_number: u64) -> Result<String, Error> {
        let request = ContractRequest::close(room_number);
        let instructions = self.build_instructions(Endpoint::Close, &request).await?;

        let message = Message::new(&instructions, Some(&self.admin_pubkey()));
        let mut tx = Transaction::new_unsigned(message);

        let signature = self.send_with_tracker(&mut tx).await?;
        Ok(signature.to_string())
    }

    async fn prepare_create_transaction(
        &self,
        duel: &Duel,
        user: &User,
        answer: u8,
    ) -> Result<String, Error> {
        let duel_price_units = duel.duel_price * USDC_PRICE_MULTIPLIER as f64;

        let init_request = ContractRequest::init(
            duel.question.clone(),
            duel.commission as u32,
            duel_price_units as u32,
            duel.room_number,
        );
        let init_tx = self
            .gateway
            .fetch_transaction(Endpoint::Init, &init_request)
            .await?;

        let payer = user_public_key(user)?;
        let payer_token_account = get_associated_token_address(&payer, &self.usdc_mint);

        if !self
            .has_enough_token_balance(&payer_token_account, duel_price_units)
            .await?
        {
            return Err(Error::BadRequest(
                "not enough balance to proceed a transaction".to_string(),
            ));
        }

        let join_request = ContractRequest::join(answer, duel.room_number, &payer);
        let join_tx = self
            .gateway
            .fetch_transaction(Endpoint::Join, &join_request)
            .await?;

        let mut instructions = instructions_from(&init_tx)?;
        instructions.extend(instructions_from(&join_tx)?);

        self.partially_signed_base64(&instructions, &payer).await
    }

    async fn prepare_join_transaction(
        &self,
        duel: &Duel,
        user: &User,
        answer: u8,
    ) -> Result<String, Error> {
        let duel_price_units = duel.duel_price * USDC_PRICE_MULTIPLIER as f64;

        let payer = user_public_key(user)?;
        let payer_token_account = get_associated_token_address(&payer, &self.usdc_mint);

        if !self
            .has_enough_token_balance(&payer_token_account, duel_price_units)
            .await?
        {
            return Err(Error::BadRequest(
                "not enough balance to proceed a transaction".to_string(),
            ));
        }

        let join_request = ContractRequest::join(answer, duel.room_number, &payer);
        let instructions = self.build_instructions(Endpoint::Join, &join_request).await?;

        self.partially_signed_base64(&instructions, &payer).await
    }
}

impl WalletService {
    /// Assemble a transaction for an external payer, partially sign with
    /// the admin key and hand it back base64 encoded for co-signing.
    async fn partially_signed_base64(
        &self,
        instructions: &[Instruction],
        payer: &Pubkey,
    ) -> Result<String, Error> {
        let (blockhash, _) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::finalized())
            .await
            .map_err(|e| {
                Error::ServiceUnavailable(format!("failed to get latest block hash: {}", e))
            })?;

        let message = Message::new_with_blockhash(instructions, Some(payer), &blockhash);
        let mut tx = Transaction::new_unsigned(message);
        tx.try_partial_sign(&[&self.admin_keypair], blockhash)
            .map_err(|e| Error::ServiceUnavailable(format!("failed to sign transaction: {}", e)))?;

        let tx_bytes = bincode::serialize(&tx).map_err(|e| {
            Error::ServiceUnavailable(format!("failed to marshal transaction: {}", e))
        })?;

        Ok(BASE64.encode(tx_bytes))
    }
}

fn user_public_key(user: &User) -> Result<Pubkey, Error> {
    let address = user
        .public_address
        .as_deref()
        .ok_or_else(|| Error::BadRequest("user has no public address".to_string()))?;
    Pubkey::from_str(address)
        .map_err(|e| Error::Internal(format!("failed to parse user's public key: {}", e)))
}

fn parse_recipient_address(address: &str) -> Result<Pubkey, Error> {
    Pubkey::from_str(address)
        .map_err(|_| Error::BadRequest("recipient is not valid solana address".to_string()))
}

/// Split a transfer list into ≤32-instruction batches, preserving order.
fn chunk_instructions(instructions: &[Instruction]) -> Vec<&[Instruction]> {
    instructions
        .chunks(TRANSFER_INSTRUCTIONS_PER_TRANSACTION)
        .collect()
}

/// Pull the room number out of the program's `joined room <n>!` log line.
fn extract_room_number(logs: &str) -> Option<u64> {
    let (_, rest) = logs.split_once("joined room ")?;
    let digits: &str = &rest[..rest.chars().take_while(|c| c.is_ascii_digit()).count()];
    if digits.is_empty() || !rest[digits.len()..].starts_with('!') {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::AccountMeta;

    fn dummy_instruction(tag: u8) -> Instruction {
        Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![AccountMeta::new(Pubkey::new_unique(), false)],
            data: vec![tag],
        }
    }

    #[test]
    fn chunks_one_hundred_transfers_into_four_batches() {
        let instructions: Vec<Instruction> =
            (0..100).map(|i| dummy_instruction(i as u8)).collect();

        let batches = chunk_instructions(&instructions);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![32, 32, 32, 4]);

        // Order is preserved across batch boundaries
        assert_eq!(batches[0][0].data, vec![0]);
        assert_eq!(batches[1][0].data, vec![32]);
        assert_eq!(batches[3][3].data, vec![99]);
    }

    #[test]
    fn chunks_exact_multiple_without_empty_tail() {
        let instructions: Vec<Instruction> = (0..64).map(|i| dummy_instruction(i as u8)).collect();
        let batches = chunk_instructions(&instructions);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 32));
    }

    #[test]
    fn extracts_room_number_from_logs() {
        let logs = "Program log: Instruction: Init, Program log: player joined room 4711!, done";
        assert_eq!(extract_room_number(logs), Some(4711));
    }

    #[test]
    fn room_number_requires_exclamation_terminator() {
        assert_eq!(extract_room_number("joined room 123"), None);
        assert_eq!(extract_room_number("joined room !"), None);
        assert_eq!(extract_room_number("joined room x!"), None);
        assert_eq!(extract_room_number("no rooms here"), None);
    }

    #[test]
    fn cu_padding_matches_budget_rule() {
        // round(simulated * 1.20 + 300)
        let padded = (10_000f64 * CU_EXTRA_CAPACITY_COEFFICIENT + 300.0).round() as u32;
        assert_eq!(padded, 12_300);

        let fallback = FALLBACK_CU_TRANSFER * 32;
        assert_eq!(fallback, 800_000);
    }
}
