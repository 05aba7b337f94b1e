//! Off-ramp Provider HTTP Client

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ledger::check_status;
use super::{AdapterError, TransferAdapter, TransferInstruction, TransferReceipt, TransferStatus};
use crate::config::EndpointConfig;

#[derive(Serialize)]
struct CreateTransferBody<'a> {
    user_id: String,
    source_account_id: &'a str,
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    destination: Destination<'a>,
}

#[derive(Serialize)]
struct Destination<'a> {
    chain: &'a str,
    address: &'a str,
}

#[derive(Deserialize, Debug)]
struct TransferResponse {
    id: String,
    #[serde(default)]
    recipient_id: Option<String>,
    status: String,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// Off-ramp transfer provider adapter
pub struct OfframpClient {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl OfframpClient {
    pub fn new(config: EndpointConfig) -> Result<Self, AdapterError> {
        info!(base_url = %config.base_url, "Initializing off-ramp client");

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AdapterError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TransferAdapter for OfframpClient {
    fn name(&self) -> &'static str {
        "offramp"
    }

    async fn process_withdrawal(
        &self,
        req: &TransferInstruction,
    ) -> Result<TransferReceipt, AdapterError> {
        let body = CreateTransferBody {
            user_id: req.user_id.to_string(),
            source_account_id: &req.source_account_id,
            amount: req.amount,
            destination: Destination {
                chain: &req.destination_chain,
                address: &req.destination_address,
            },
        };

        let response = self
            .client
            .post(self.url("/v1/transfers"))
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", &req.reference)
            .json(&body)
            .send()
            .await?;

        let transfer: TransferResponse = check_status(response).await?.json().await?;
        let status = TransferStatus::from_provider(&transfer.status, transfer.failure_reason);
        if let TransferStatus::Failed(reason) = &status {
            return Err(AdapterError::Rejected(
                reason
                    .clone()
                    .unwrap_or_else(|| format!("transfer {} failed on creation", transfer.id)),
            ));
        }

        let recipient_id = transfer.recipient_id.ok_or_else(|| {
            AdapterError::Decode(format!("transfer {} has no recipient_id", transfer.id))
        })?;

        debug!(transfer_id = %transfer.id, status = %status, "Transfer created");
        Ok(TransferReceipt {
            transfer_id: transfer.id,
            recipient_id,
            status,
        })
    }

    async fn get_transfer_status(&self, transfer_id: &str) -> Result<TransferStatus, AdapterError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/transfers/{}", transfer_id)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        let transfer: TransferResponse = check_status(response).await?.json().await?;
        Ok(TransferStatus::from_provider(
            &transfer.status,
            transfer.failure_reason,
        ))
    }
}
