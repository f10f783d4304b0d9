//! Payment provider boundary.
//!
//! The engine never speaks a specific provider's wire protocol; it consumes
//! this trait. `HttpProvider` is a thin reqwest client against whatever
//! gateway the deployment configures; tests use the scripted double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ProviderError;
use crate::ledger::models::ProviderOutcome;

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Start a transfer and return the provider-assigned reference. May be
    /// slow; callers wrap it in their own timeout.
    async fn initiate_transfer(
        &self,
        destination: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<String, ProviderError>;

    /// Poll the authoritative status of a transfer, for webhooks that never
    /// arrive.
    async fn transfer_status(&self, reference: &str) -> Result<ProviderOutcome, ProviderError>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct InitiateResponse {
    reference: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    reason: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

impl HttpProvider {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn map_error(error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout
        } else if error
            .status()
            .map(|s| s.is_client_error())
            .unwrap_or(false)
        {
            ProviderError::Rejected(error.to_string())
        } else {
            ProviderError::Unavailable(error.to_string())
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    async fn initiate_transfer(
        &self,
        destination: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/transfers", self.base_url))
            .json(&serde_json::json!({
                "destination": destination,
                "amount": amount.to_string(),
                "currency": currency,
            }))
            .send()
            .await
            .map_err(Self::map_error)?
            .error_for_status()
            .map_err(Self::map_error)?;

        let body: InitiateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(body.reference)
    }

    async fn transfer_status(&self, reference: &str) -> Result<ProviderOutcome, ProviderError> {
        let response = self
            .client
            .get(format!("{}/transfers/{reference}", self.base_url))
            .send()
            .await
            .map_err(Self::map_error)?
            .error_for_status()
            .map_err(Self::map_error)?;

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(match body.status.as_str() {
            "confirmed" | "success" | "completed" => ProviderOutcome::Confirmed {
                reference: reference.to_string(),
                confirmed_at: body.occurred_at.unwrap_or_else(Utc::now),
            },
            "failed" | "error" => ProviderOutcome::Failed {
                reason: body.reason.unwrap_or_else(|| "provider reported failure".into()),
                retry_count: 0,
            },
            "reversed" | "chargeback" => ProviderOutcome::Reversed {
                reversed_at: body.occurred_at.unwrap_or_else(Utc::now),
            },
            _ => ProviderOutcome::Pending,
        })
    }
}
