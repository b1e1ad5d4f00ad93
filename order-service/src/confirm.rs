use shared::*;
use tracing::{info, warn};

use crate::coordinator::{ConfirmedPayment, Coordinator, ReconcileError};
use crate::processor::{PaymentProcessor, ProcessorError};

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("payment {0} belongs to another user")]
    WrongUser(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Synchronous confirmation after the browser finishes the payment flow.
///
/// Status always comes from the processor. A payment that has not succeeded
/// yet is a normal answer, not an error.
pub async fn confirm_payment(
    processor: &dyn PaymentProcessor,
    coordinator: &Coordinator,
    request: &ConfirmRequest,
) -> Result<ConfirmResponse, ConfirmError> {
    let result = processor.fetch_payment(&request.payment_reference).await?;

    if let Some(owner) = result.user_id {
        if owner != request.user_id {
            warn!(
                payment_reference = %request.payment_reference,
                "Confirmation requested by a user other than the payer"
            );
            return Err(ConfirmError::WrongUser(request.payment_reference.clone()));
        }
    }

    if result.status != PaymentStatus::Succeeded {
        info!(
            payment_reference = %request.payment_reference,
            status = %result.status,
            "Payment not yet succeeded"
        );
        return Ok(ConfirmResponse::NotSucceeded {
            status: result.status,
        });
    }

    let payment = ConfirmedPayment::from_result(result)?;
    let handle = coordinator.materialize(&payment, request.user_id).await?;
    Ok(handle.into())
}
