use log::error;
use reqwest_middleware::{reqwest::StatusCode, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    message::Message,
    pubkey::Pubkey,
    transaction::Transaction,
};

use crate::domain::Error;

/// Endpoints of the out-of-process contract service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Init,
    Join,
    Close,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Init => "init",
            Endpoint::Join => "join",
            Endpoint::Close => "close",
        }
    }
}

/// Request body for the contract service. Each endpoint reads a subset of
/// the fields; absent fields are omitted from the payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContractRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bet: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pda_nr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl ContractRequest {
    pub fn init(description: String, percent: u32, bet: u32, pda_nr: u64) -> Self {
        Self {
            description: Some(description),
            percent: Some(percent),
            bet: Some(bet),
            pda_nr: Some(pda_nr),
            ..Default::default()
        }
    }

    pub fn join(answer: u8, pda_nr: u64, payer: &Pubkey) -> Self {
        Self {
            multiplier: Some(1),
            answer: Some(answer),
            pda_nr: Some(pda_nr),
            payer: Some(payer.to_string()),
            ..Default::default()
        }
    }

    pub fn close(pda_nr: u64) -> Self {
        Self {
            pda_nr: Some(pda_nr),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContractTxResponse {
    raw_tx: Vec<u8>,
}

/// Client for the contract service that authors the on-chain program's
/// raw transactions.
#[derive(Clone)]
pub struct ContractGateway {
    base_url: String,
    client: ClientWithMiddleware,
}

impl ContractGateway {
    pub fn new(client: ClientWithMiddleware, base_url: String) -> Self {
        Self { base_url, client }
    }

    /// `PUT /{endpoint}` and decode the returned `{raw_tx}` binary.
    pub async fn fetch_transaction(
        &self,
        endpoint: Endpoint,
        request: &ContractRequest,
    ) -> Result<Transaction, Error> {
        let url = format!("{}{}", self.base_url, endpoint.as_str());

        let response = self
            .client
            .put(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("error calling contract service: {}", e);
                Error::ServiceUnavailable(format!("failed to call contract service: {}", e))
            })?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::BadRequest(format!(
                "contract service rejected request: {}",
                body
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ServiceUnavailable(format!(
                "failed to get transaction from contract service, status {}: {}",
                status, body
            )));
        }

        let payload: ContractTxResponse = response.json().await.map_err(|e| {
            Error::ServiceUnavailable(format!("failed to unmarshal raw transaction: {}", e))
        })?;

        bincode::deserialize(&payload.raw_tx)
            .map_err(|e| Error::ServiceUnavailable(format!("failed to decode a transaction: {}", e)))
    }
}

/// Decompile every instruction of a transaction back into concrete
/// `Instruction` values: program id resolved by index, account metas
/// reconstructed from the message header.
pub fn instructions_from(tx: &Transaction) -> Result<Vec<Instruction>, Error> {
    let message = &tx.message;
    let mut instructions = Vec::with_capacity(message.instructions.len());

    for compiled in &message.instructions {
        let program_id = *message
            .account_keys
            .get(compiled.program_id_index as usize)
            .ok_or_else(|| {
                Error::ServiceUnavailable(
                    "failed to decompile instruction: program id index out of range".to_string(),
                )
            })?;

        let mut accounts = Vec::with_capacity(compiled.accounts.len());
        for &account_index in &compiled.accounts {
            let index = account_index as usize;
            let pubkey = *message.account_keys.get(index).ok_or_else(|| {
                Error::ServiceUnavailable(
                    "failed to decompile instruction: account index out of range".to_string(),
                )
            })?;
            accounts.push(AccountMeta {
                pubkey,
                is_signer: is_signer_index(message, index),
                is_writable: is_writable_index(message, index),
            });
        }

        instructions.push(Instruction {
            program_id,
            accounts,
            data: compiled.data.clone(),
        });
    }

    Ok(instructions)
}

fn is_signer_index(message: &Message, index: usize) -> bool {
    index < message.header.num_required_signatures as usize
}

fn is_writable_index(message: &Message, index: usize) -> bool {
    let num_required = message.header.num_required_signatures as usize;
    let num_readonly_signed = message.header.num_readonly_signed_accounts as usize;
    let num_readonly_unsigned = message.header.num_readonly_unsigned_accounts as usize;

    if index < num_required {
        index < num_required - num_readonly_signed
    } else {
        index
            < message
                .account_keys
                .len()
                .saturating_sub(num_readonly_unsigned)
    }
}
