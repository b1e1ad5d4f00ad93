use serde::Deserialize;
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinator::{ConfirmedPayment, Coordinator, ReconcileError};
use crate::processor::{PaymentIntent, ProcessorError};
use crate::signature::{SignatureError, WebhookVerifier};

pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("malformed event body: {0}")]
    MalformedEvent(#[from] serde_json::Error),
}

/// What an authenticated event asks of us.
#[derive(Debug)]
pub enum Intake {
    Materialize {
        event_id: String,
        payment: ConfirmedPayment,
        user_id: Uuid,
    },
    /// A successful payment that does not say whose it is.
    Unattributed { event_id: String, reference: String },
    /// Authentic but unusable; redelivery would not change it.
    Unprocessable { event_id: String, reason: String },
    Ignored { event_id: String, event_type: String },
}

pub struct EventIntake {
    verifier: WebhookVerifier,
    coordinator: Coordinator,
    retry_attempts: usize,
}

impl EventIntake {
    pub fn new(verifier: WebhookVerifier, coordinator: Coordinator, retry_attempts: usize) -> Self {
        Self {
            verifier,
            coordinator,
            retry_attempts,
        }
    }

    /// Verifies and normalises one delivery. Nothing is written here.
    pub fn accept(&self, payload: &[u8], signature: &str) -> Result<Intake, IntakeError> {
        self.verifier.verify(payload, signature)?;
        normalize(payload)
    }

    /// Runs the intake off the request path. Duplicate deliveries are absorbed
    /// by the coordinator, so no event-id bookkeeping is kept here.
    pub fn dispatch(self: &Arc<Self>, intake: Intake) -> Option<JoinHandle<()>> {
        match intake {
            Intake::Materialize {
                event_id,
                payment,
                user_id,
            } => {
                let intake = Arc::clone(self);
                Some(tokio::spawn(async move {
                    if let Err(e) = intake.reconcile(&payment, user_id).await {
                        error!(
                            event_id = %event_id,
                            payment_reference = %payment.reference(),
                            "Webhook reconciliation failed, awaiting redelivery: {}", e
                        );
                    }
                }))
            }
            Intake::Unattributed { event_id, reference } => {
                error!(event_id = %event_id, payment_reference = %reference, "Succeeded payment has no user_id metadata");
                None
            }
            Intake::Unprocessable { event_id, reason } => {
                error!(event_id = %event_id, "Succeeded payment event cannot be reconciled: {}", reason);
                None
            }
            Intake::Ignored { event_id, event_type } => {
                info!(event_id = %event_id, event_type = %event_type, "Event acknowledged without action");
                None
            }
        }
    }

    pub async fn reconcile(&self, payment: &ConfirmedPayment, user_id: Uuid) -> Result<OrderHandle, ReconcileError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.retry_attempts);

        let handle = RetryIf::start(
            strategy,
            || self.coordinator.materialize(payment, user_id),
            |e: &ReconcileError| {
                if e.is_transient() {
                    warn!(payment_reference = %payment.reference(), "Retrying webhook reconciliation: {}", e);
                }
                e.is_transient()
            },
        )
        .await?;

        info!(
            payment_reference = %payment.reference(),
            order_id = %handle.order_id,
            created = handle.created,
            "Webhook reconciled"
        );
        Ok(handle)
    }
}

pub fn normalize(payload: &[u8]) -> Result<Intake, IntakeError> {
    let event: WebhookEvent = serde_json::from_slice(payload)?;

    if event.event_type != PAYMENT_SUCCEEDED {
        return Ok(Intake::Ignored {
            event_id: event.id,
            event_type: event.event_type,
        });
    }

    let result = match payment_from_object(event.data.object) {
        Ok(result) => result,
        Err(reason) => {
            return Ok(Intake::Unprocessable {
                event_id: event.id,
                reason,
            })
        }
    };

    let Some(user_id) = result.user_id else {
        return Ok(Intake::Unattributed {
            event_id: event.id,
            reference: result.reference,
        });
    };

    match ConfirmedPayment::from_result(result) {
        Ok(payment) => Ok(Intake::Materialize {
            event_id: event.id,
            payment,
            user_id,
        }),
        Err(e) => Ok(Intake::Unprocessable {
            event_id: event.id,
            reason: e.to_string(),
        }),
    }
}

fn payment_from_object(object: serde_json::Value) -> Result<PaymentResult, String> {
    let intent: PaymentIntent =
        serde_json::from_value(object).map_err(|e| format!("payment intent: {}", e))?;
    PaymentResult::try_from(intent).map_err(|e: ProcessorError| e.to_string())
}

#[cfg(test)]
pub(crate) fn succeeded_event(event_id: &str, reference: &str, user_id: Uuid) -> String {
    serde_json::json!({
        "id": event_id,
        "type": PAYMENT_SUCCEEDED,
        "data": {
            "object": {
                "id": reference,
                "object": "payment_intent",
                "status": "succeeded",
                "amount": 6997,
                "currency": "usd",
                "metadata": {
                    "user_id": user_id.to_string(),
                    "line_items": r#"[{"productId":"shoe-1","size":"M","quantity":2,"unitPrice":"29.99"},{"productId":"sock-7","size":"L","quantity":1,"unitPrice":"9.99"}]"#
                }
            }
        }
    })
    .to_string()
}
