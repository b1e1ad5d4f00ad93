use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::Url;
use serde::Deserialize;
use shared::*;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("payment {0} not found at processor")]
    NotFound(String),
    #[error("processor request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("processor returned status {0}")]
    Status(u16),
    #[error("invalid payment metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid processor url: {0}")]
    InvalidUrl(String),
}

/// Source of truth for payment state. Client-supplied statuses are never trusted.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn fetch_payment(&self, reference: &str) -> Result<PaymentResult, ProcessorError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub shipping: Option<IntentShipping>,
    #[serde(default)]
    pub last_payment_error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentShipping {
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<IntentAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntentAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl PaymentIntent {
    pub fn payment_status(&self) -> PaymentStatus {
        match self.status.as_str() {
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" => PaymentStatus::Failed,
            "requires_payment_method" if self.last_payment_error.is_some() => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    fn metadata_uuid(&self, key: &str) -> Result<Option<Uuid>, ProcessorError> {
        self.metadata
            .get(key)
            .map(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|e| ProcessorError::InvalidMetadata(format!("{}: {}", key, e)))
            })
            .transpose()
    }

    fn line_items(&self) -> Result<Vec<LineItem>, ProcessorError> {
        match self.metadata.get("line_items") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ProcessorError::InvalidMetadata(format!("line_items: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    fn shipping_snapshot(&self) -> Result<Option<ShippingSnapshot>, ProcessorError> {
        let address_id = self.metadata_uuid("shipping_address_id")?;
        if self.shipping.is_none() && address_id.is_none() {
            return Ok(None);
        }

        let (name, address) = match &self.shipping {
            Some(shipping) => (
                shipping.name.clone(),
                shipping.address.clone().unwrap_or_default(),
            ),
            None => (None, IntentAddress::default()),
        };

        Ok(Some(ShippingSnapshot {
            address_id,
            name,
            line1: address.line1,
            line2: address.line2,
            city: address.city,
            state: address.state,
            postal_code: address.postal_code,
            country: address.country,
        }))
    }
}

/// Amounts arrive in minor units (cents).
pub fn minor_units_to_decimal(amount: i64) -> BigDecimal {
    BigDecimal::new(amount.into(), 2)
}

impl TryFrom<PaymentIntent> for PaymentResult {
    type Error = ProcessorError;

    fn try_from(intent: PaymentIntent) -> Result<Self, Self::Error> {
        Ok(PaymentResult {
            status: intent.payment_status(),
            amount: minor_units_to_decimal(intent.amount),
            user_id: intent.metadata_uuid("user_id")?,
            line_items: intent.line_items()?,
            shipping_snapshot: intent.shipping_snapshot()?,
            currency: intent.currency,
            reference: intent.id,
        })
    }
}

pub struct StripeProcessor {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl StripeProcessor {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ProcessorError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ProcessorError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ProcessorError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// The reference is pushed as one encoded path segment, never spliced
    /// into the path text.
    fn intent_url(&self, reference: &str) -> Result<Url, ProcessorError> {
        if reference.is_empty() || reference == "." || reference == ".." {
            return Err(ProcessorError::NotFound(reference.to_string()));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProcessorError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v1", "payment_intents", reference]);
        Ok(url)
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn fetch_payment(&self, reference: &str) -> Result<PaymentResult, ProcessorError> {
        let url = self.intent_url(reference)?;
        debug!(payment_reference = %reference, "Fetching payment intent");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(ProcessorError::NotFound(reference.to_string())),
            status if !status.is_success() => Err(ProcessorError::Status(status.as_u16())),
            _ => {
                let intent: PaymentIntent = response.json().await?;
                PaymentResult::try_from(intent)
            }
        }
    }
}

impl FromStr for PaymentIntent {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}
