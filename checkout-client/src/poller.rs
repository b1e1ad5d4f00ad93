//! Client-side recovery after checkout.
//!
//! The poller only reads until its attempt budget runs out, then makes one
//! confirmation call. Dropping or cancelling it at any point is harmless: the
//! webhook path still materializes the order.

use shared::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gateway::OrderGateway;

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Checking { attempt: u32 },
    Found(OrderView),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Found(OrderView),
    /// The last-resort confirmation produced (or found) the order.
    Recovered(OrderHandle),
    NotSucceeded(PaymentStatus),
    ContactSupport(String),
    Cancelled,
}

impl PollOutcome {
    /// Once the processor may have captured the charge, nothing here reads
    /// as a failed payment unless the processor itself says so.
    pub fn user_message(&self, payment_reference: &str) -> String {
        match self {
            PollOutcome::Found(order) => format!("Order {} confirmed.", order.id),
            PollOutcome::Recovered(handle) => format!("Order {} confirmed.", handle.order_id),
            PollOutcome::NotSucceeded(PaymentStatus::Failed) => {
                "Your payment did not go through. You have not been charged.".to_string()
            }
            PollOutcome::NotSucceeded(_) | PollOutcome::Cancelled => {
                "Your payment is processing; we'll confirm your order shortly.".to_string()
            }
            PollOutcome::ContactSupport(_) => format!(
                "Your payment may have succeeded, but we could not confirm your order yet. \
                 Please contact support and quote payment reference {}.",
                payment_reference
            ),
        }
    }
}

pub struct RecoveryPoller<G> {
    gateway: G,
    config: PollConfig,
    request: ConfirmRequest,
}

impl<G: OrderGateway> RecoveryPoller<G> {
    pub fn new(gateway: G, config: PollConfig, request: ConfirmRequest) -> Self {
        Self {
            gateway,
            config,
            request,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> PollOutcome {
        let mut state = PollState::Checking { attempt: 1 };

        loop {
            state = match state {
                PollState::Checking { attempt } => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(payment_reference = %self.request.payment_reference, attempt, "Order polling cancelled");
                            return PollOutcome::Cancelled;
                        }
                        _ = tokio::time::sleep(self.config.interval) => {}
                    }
                    self.check(attempt).await
                }
                PollState::Found(order) => return PollOutcome::Found(order),
                PollState::Exhausted => return self.fall_back(cancel).await,
            };
        }
    }

    /// One lookup. Lookup errors use up the attempt like a miss.
    pub async fn check(&self, attempt: u32) -> PollState {
        let reference = &self.request.payment_reference;

        match self.gateway.lookup_order(reference).await {
            Ok(Some(order)) => {
                info!(payment_reference = %reference, order_id = %order.id, attempt, "Order found");
                return PollState::Found(order);
            }
            Ok(None) => {}
            Err(e) => warn!(payment_reference = %reference, attempt, "Order lookup failed: {:#}", e),
        }

        if attempt >= self.config.max_attempts {
            PollState::Exhausted
        } else {
            PollState::Checking {
                attempt: attempt + 1,
            }
        }
    }

    async fn fall_back(&self, cancel: &CancellationToken) -> PollOutcome {
        let reference = &self.request.payment_reference;
        warn!(
            payment_reference = %reference,
            attempts = self.config.max_attempts,
            "Order not found by polling, confirming directly"
        );

        let confirmed = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            confirmed = self.gateway.confirm_payment(&self.request) => confirmed,
        };

        match confirmed {
            Ok(ConfirmResponse::Materialized { order_id, created }) => {
                PollOutcome::Recovered(OrderHandle { order_id, created })
            }
            Ok(ConfirmResponse::NotSucceeded { status }) => PollOutcome::NotSucceeded(status),
            Err(e) => {
                warn!(payment_reference = %reference, "Fallback confirmation failed: {:#}", e);
                PollOutcome::ContactSupport(format!("{:#}", e))
            }
        }
    }
}
