//! Brokerage Ledger HTTP Client
//!
//! Talks to the broker API for account snapshots and cash journals.
//! Journals carry the withdrawal ID as an idempotency key.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AdapterError, JournalReceipt, JournalRequest, LedgerAccount, LedgerAdapter};
use crate::config::EndpointConfig;

/// Account payload from the broker API
#[derive(Deserialize, Debug)]
struct AccountResponse {
    id: String,
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    buying_power: Decimal,
}

#[derive(Serialize)]
struct JournalBody<'a> {
    from_account: &'a str,
    to_account: &'a str,
    entry_type: &'a str,
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    description: &'a str,
}

#[derive(Deserialize, Debug)]
struct JournalResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

/// Broker API ledger adapter
pub struct BrokerLedgerClient {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl BrokerLedgerClient {
    pub fn new(config: EndpointConfig) -> Result<Self, AdapterError> {
        info!(base_url = %config.base_url, "Initializing broker ledger client");

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AdapterError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.config.api_key, self.config.api_secret.as_deref())
    }
}

/// Turn a non-2xx response into `AdapterError::Api`
pub(super) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AdapterError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl LedgerAdapter for BrokerLedgerClient {
    fn name(&self) -> &'static str {
        "broker-ledger"
    }

    async fn get_account(&self, account_id: &str) -> Result<LedgerAccount, AdapterError> {
        let response = self
            .authorize(
                self.client
                    .get(self.url(&format!("/v1/trading/accounts/{}/account", account_id))),
            )
            .send()
            .await?;

        let account: AccountResponse = check_status(response).await?.json().await?;
        debug!(account_id = %account.id, status = %account.status, "Fetched ledger account");

        Ok(LedgerAccount {
            account_id: account.id,
            status: account.status,
            buying_power: account.buying_power,
        })
    }

    async fn create_journal(&self, req: &JournalRequest) -> Result<JournalReceipt, AdapterError> {
        let body = JournalBody {
            from_account: &req.from_account,
            to_account: &req.to_account,
            entry_type: &req.entry_type,
            amount: req.amount,
            description: &req.description,
        };

        let response = self
            .authorize(self.client.post(self.url("/v1/journals")))
            .header("Idempotency-Key", &req.reference)
            .json(&body)
            .send()
            .await?;

        let journal: JournalResponse = check_status(response).await?.json().await?;
        if journal
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("rejected"))
        {
            return Err(AdapterError::Rejected(format!(
                "journal {} rejected by ledger",
                journal.id
            )));
        }

        Ok(JournalReceipt {
            journal_id: journal.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_response_decodes_string_decimal() {
        let json = r#"{"id":"acct-1","status":"ACTIVE","buying_power":"1000.25"}"#;
        let account: AccountResponse = serde_json::from_str(json).unwrap();
        assert_eq!(account.buying_power, Decimal::new(100025, 2));
    }

    #[test]
    fn test_journal_body_encodes_amount_as_string() {
        let body = JournalBody {
            from_account: "a",
            to_account: "b",
            entry_type: "JNLC",
            amount: Decimal::new(500, 0),
            description: "withdrawal",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["amount"], "500");
    }

    #[test]
    fn test_url_join() {
        let client = BrokerLedgerClient::new(EndpointConfig {
            base_url: "https://broker.example/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.url("/v1/journals"),
            "https://broker.example/v1/journals"
        );
    }
}
