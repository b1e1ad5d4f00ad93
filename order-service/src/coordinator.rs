//! Turns a confirmed payment into exactly one persisted order.
//!
//! Webhook deliveries, the synchronous confirmation call and the client
//! poller's fallback may all reach [`Coordinator::materialize`] for the same
//! payment at the same time, from different processes. The only mutual
//! exclusion is the unique constraint on `orders.payment_reference`: whoever
//! inserts first writes the items and adjusts stock, everyone else observes
//! the conflict and reads the winner's row back.

use bigdecimal::BigDecimal;
use num_traits::Zero;
use shared::*;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{InsertOutcome, OrderDraft, OrderStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("payment {reference} has status {status}, not succeeded")]
    NotSucceeded {
        reference: String,
        status: PaymentStatus,
    },
    #[error("payment {reference} cannot become an order: {reason}")]
    InvalidOrder { reference: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payment {0} conflicted on insert but no winning order was found")]
    MissingWinner(String),
}

impl ReconcileError {
    /// Only store outages are worth retrying; everything else fails the same
    /// way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_transient())
    }
}

/// A payment the processor has reported as `succeeded`.
///
/// The only way to obtain one is [`ConfirmedPayment::from_result`], so
/// `materialize` cannot be reached for a pending or failed payment.
#[derive(Debug, Clone)]
pub struct ConfirmedPayment {
    result: PaymentResult,
}

impl ConfirmedPayment {
    pub fn from_result(result: PaymentResult) -> Result<Self, ReconcileError> {
        if result.status != PaymentStatus::Succeeded {
            return Err(ReconcileError::NotSucceeded {
                reference: result.reference,
                status: result.status,
            });
        }
        Ok(Self { result })
    }

    pub fn reference(&self) -> &str {
        &self.result.reference
    }

    pub fn total_amount(&self) -> &BigDecimal {
        &self.result.amount
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.result.line_items
    }

    pub fn shipping_snapshot(&self) -> Option<&ShippingSnapshot> {
        self.result.shipping_snapshot.as_ref()
    }
}

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn OrderStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    pub async fn find_order(&self, payment_reference: &str) -> Result<Option<OrderView>, StoreError> {
        self.store.find_by_reference(payment_reference).await
    }

    pub async fn materialize(
        &self,
        payment: &ConfirmedPayment,
        user_id: Uuid,
    ) -> Result<OrderHandle, ReconcileError> {
        let reference = payment.reference();

        if let Some(existing) = self.store.find_by_reference(reference).await? {
            info!(payment_reference = %reference, order_id = %existing.id, "Order already materialized");
            return Ok(OrderHandle {
                order_id: existing.id,
                created: false,
            });
        }

        let draft = build_draft(payment, user_id)?;

        match self.store.insert_order(&draft).await {
            Ok(InsertOutcome::Created { order, adjustments }) => {
                for adjustment in &adjustments {
                    match &adjustment.outcome {
                        Err(e) => warn!(
                            payment_reference = %reference,
                            order_id = %order.id,
                            stock = %adjustment.key,
                            delta = adjustment.delta,
                            "Stock adjustment skipped: {}", e
                        ),
                        Ok(quantity) if adjustment.is_oversold() => warn!(
                            payment_reference = %reference,
                            order_id = %order.id,
                            stock = %adjustment.key,
                            quantity = *quantity,
                            "Stock oversold"
                        ),
                        Ok(quantity) => debug!(stock = %adjustment.key, quantity = *quantity, "Stock adjusted"),
                    }
                }

                info!(
                    payment_reference = %reference,
                    order_id = %order.id,
                    items = order.items.len(),
                    "Order materialized"
                );
                Ok(OrderHandle {
                    order_id: order.id,
                    created: true,
                })
            }
            Ok(InsertOutcome::Conflict) => {
                debug!(payment_reference = %reference, "Lost materialization race, reading winner");
                let winner = self
                    .store
                    .find_by_reference(reference)
                    .await?
                    .ok_or_else(|| ReconcileError::MissingWinner(reference.to_string()))?;
                Ok(OrderHandle {
                    order_id: winner.id,
                    created: false,
                })
            }
            Err(e) => {
                error!(payment_reference = %reference, "Failed to persist order for captured payment: {}", e);
                Err(e.into())
            }
        }
    }
}

fn build_draft(payment: &ConfirmedPayment, user_id: Uuid) -> Result<OrderDraft, ReconcileError> {
    let reference = payment.reference();
    let invalid = |reason: String| ReconcileError::InvalidOrder {
        reference: reference.to_string(),
        reason,
    };

    let items = payment.line_items();
    if items.is_empty() {
        return Err(invalid("no line items".to_string()));
    }
    if let Some(item) = items.iter().find(|item| item.quantity <= 0) {
        return Err(invalid(format!(
            "quantity {} for {}/{}",
            item.quantity, item.product_id, item.size
        )));
    }

    let line_total = items
        .iter()
        .fold(BigDecimal::zero(), |total, item| total + item.subtotal());
    if &line_total != payment.total_amount() {
        warn!(
            payment_reference = %reference,
            charged = %payment.total_amount(),
            line_total = %line_total,
            "Charged amount differs from line items, keeping charged amount"
        );
    }

    Ok(OrderDraft {
        id: Uuid::new_v4(),
        payment_reference: reference.to_string(),
        user_id,
        total_amount: payment.total_amount().clone(),
        shipping_snapshot: payment.shipping_snapshot().cloned(),
        items: items.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StockKey;
    use crate::testing::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn example_scenario_materializes_once() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_123")).unwrap();
        let user_id = Uuid::new_v4();

        let first = coordinator.materialize(&payment, user_id).await.unwrap();
        assert!(first.created);

        let order = store.find_by_reference("pi_123").await.unwrap().unwrap();
        assert_eq!(order.id, first.order_id);
        assert_eq!(order.total_amount, BigDecimal::from_str("69.97").unwrap());
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.items.len(), 2);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(8));
        assert_eq!(store.stock(&StockKey::new("sock-7", "L")).await, Some(4));

        let second = coordinator.materialize(&payment, user_id).await.unwrap();
        assert_eq!(second.order_id, first.order_id);
        assert!(!second.created);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(8));
        assert_eq!(store.stock(&StockKey::new("sock-7", "L")).await, Some(4));
    }

    #[tokio::test]
    async fn replay_performs_no_writes() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_replay")).unwrap();
        let user_id = Uuid::new_v4();

        coordinator.materialize(&payment, user_id).await.unwrap();
        let writes = store.write_count().await;

        for _ in 0..3 {
            let handle = coordinator.materialize(&payment, user_id).await.unwrap();
            assert!(!handle.created);
        }
        assert_eq!(store.write_count().await, writes);
        assert_eq!(store.outbox_len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_create_exactly_one_order() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_race")).unwrap();
        let user_id = Uuid::new_v4();

        let calls = (0..16).map(|_| {
            let coordinator = coordinator.clone();
            let payment = payment.clone();
            tokio::spawn(async move { coordinator.materialize(&payment, user_id).await })
        });
        let handles: Vec<OrderHandle> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let order_id = handles[0].order_id;
        assert!(handles.iter().all(|h| h.order_id == order_id));
        assert_eq!(handles.iter().filter(|h| h.created).count(), 1);
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.item_count().await, 2);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(8));
        assert_eq!(store.stock(&StockKey::new("sock-7", "L")).await, Some(4));
    }

    #[tokio::test]
    async fn losing_the_insert_race_returns_the_winner() {
        let inner = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_lost")).unwrap();
        let winner = Coordinator::new(inner.clone())
            .materialize(&payment, Uuid::new_v4())
            .await
            .unwrap();

        // The first read misses, as if the winner had not committed yet.
        let racing = Arc::new(StaleFirstRead::new(inner.clone()));
        let loser = Coordinator::new(racing)
            .materialize(&payment, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(loser.order_id, winner.order_id);
        assert!(!loser.created);
        assert_eq!(inner.order_count().await, 1);
        assert_eq!(inner.stock(&StockKey::new("shoe-1", "M")).await, Some(8));
    }

    #[tokio::test]
    async fn failed_ledger_adjustment_keeps_order_and_other_items() {
        // No ledger row for sock-7/L, so its adjustment fails.
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10)]);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_partial")).unwrap();

        let handle = coordinator.materialize(&payment, Uuid::new_v4()).await.unwrap();

        assert!(handle.created);
        let order = store.find_by_reference("pi_partial").await.unwrap().unwrap();
        assert_eq!(order.items.len(), 2);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(8));
        assert_eq!(store.stock(&StockKey::new("sock-7", "L")).await, None);
    }

    #[tokio::test]
    async fn oversold_stock_goes_negative_without_blocking_the_order() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 1), ("sock-7", "L", 5)]);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_oversell")).unwrap();

        let handle = coordinator.materialize(&payment, Uuid::new_v4()).await.unwrap();

        assert!(handle.created);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(-1));
    }

    #[tokio::test]
    async fn unsucceeded_payment_never_reaches_the_ledger() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);

        for status in [PaymentStatus::Pending, PaymentStatus::Failed] {
            let mut result = succeeded_payment("pi_pending");
            result.status = status;
            let err = ConfirmedPayment::from_result(result).unwrap_err();
            assert!(matches!(err, ReconcileError::NotSucceeded { .. }));
            assert!(!err.is_transient());
        }

        assert_eq!(store.write_count().await, 0);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(10));
    }

    #[tokio::test]
    async fn empty_or_non_positive_line_items_are_rejected() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10)]);
        let coordinator = Coordinator::new(store.clone());

        let mut empty = succeeded_payment("pi_empty");
        empty.line_items.clear();
        let err = coordinator
            .materialize(&ConfirmedPayment::from_result(empty).unwrap(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidOrder { .. }));

        let mut zero = succeeded_payment("pi_zero");
        zero.line_items[0].quantity = 0;
        let err = coordinator
            .materialize(&ConfirmedPayment::from_result(zero).unwrap(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidOrder { .. }));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn charged_amount_wins_over_line_total() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        let coordinator = Coordinator::new(store.clone());
        let mut result = succeeded_payment("pi_discount");
        result.amount = BigDecimal::from_str("59.97").unwrap();

        coordinator
            .materialize(&ConfirmedPayment::from_result(result).unwrap(), Uuid::new_v4())
            .await
            .unwrap();

        let order = store.find_by_reference("pi_discount").await.unwrap().unwrap();
        assert_eq!(order.total_amount, BigDecimal::from_str("59.97").unwrap());
    }

    #[tokio::test]
    async fn store_outage_is_transient_and_writes_nothing() {
        let store = MemoryOrderStore::with_stock(&[("shoe-1", "M", 10), ("sock-7", "L", 5)]);
        store.set_unavailable(true);
        let coordinator = Coordinator::new(store.clone());
        let payment = ConfirmedPayment::from_result(succeeded_payment("pi_down")).unwrap();

        let err = coordinator.materialize(&payment, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.stock(&StockKey::new("shoe-1", "M")).await, Some(10));
    }
}
