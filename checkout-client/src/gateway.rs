use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use shared::*;
use std::time::Duration;

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Read-only; `None` while no order exists for the reference.
    async fn lookup_order(&self, payment_reference: &str) -> Result<Option<OrderView>>;

    async fn confirm_payment(&self, request: &ConfirmRequest) -> Result<ConfirmResponse>;
}

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid order service url {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("order service url {} cannot carry a path", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("order service url {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl OrderGateway for HttpGateway {
    async fn lookup_order(&self, payment_reference: &str) -> Result<Option<OrderView>> {
        if payment_reference.is_empty() || payment_reference == "." || payment_reference == ".." {
            anyhow::bail!("invalid payment reference {:?}", payment_reference);
        }
        let url = self.endpoint(&["orders", "by-reference", payment_reference])?;
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => anyhow::bail!("order lookup returned {}", status),
        }
    }

    async fn confirm_payment(&self, request: &ConfirmRequest) -> Result<ConfirmResponse> {
        let url = self.endpoint(&["payments", "confirm"])?;
        let response = self.client.post(url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorResponse = response
                .json()
                .await
                .with_context(|| format!("confirmation returned {}", status))?;
            anyhow::bail!("confirmation returned {}: {}", status, body.error);
        }

        Ok(response.json().await?)
    }
}
