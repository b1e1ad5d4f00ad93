//! In-memory doubles for the order store and payment processor.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use shared::*;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ledger::{Adjustment, LedgerError, StockKey};
use crate::processor::{PaymentProcessor, ProcessorError};
use crate::store::{InsertOutcome, OrderDraft, OrderStore, StoreError};

pub fn succeeded_payment(reference: &str) -> PaymentResult {
    PaymentResult {
        reference: reference.to_string(),
        status: PaymentStatus::Succeeded,
        amount: BigDecimal::from_str("69.97").unwrap(),
        currency: "usd".to_string(),
        user_id: None,
        line_items: vec![
            LineItem {
                product_id: "shoe-1".to_string(),
                size: "M".to_string(),
                quantity: 2,
                unit_price: BigDecimal::from_str("29.99").unwrap(),
            },
            LineItem {
                product_id: "sock-7".to_string(),
                size: "L".to_string(),
                quantity: 1,
                unit_price: BigDecimal::from_str("9.99").unwrap(),
            },
        ],
        shipping_snapshot: None,
    }
}

#[derive(Default)]
struct MemoryState {
    orders: HashMap<String, OrderView>,
    ledger: HashMap<StockKey, i32>,
    outbox: Vec<Uuid>,
    writes: usize,
}

/// Mirrors the Postgres store: one lock acquisition per transaction and a
/// unique index on the payment reference.
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryOrderStore {
    pub fn with_stock(entries: &[(&str, &str, i32)]) -> Arc<Self> {
        let ledger = entries
            .iter()
            .map(|(product, size, quantity)| (StockKey::new(*product, *size), *quantity))
            .collect();
        Arc::new(Self {
            state: Mutex::new(MemoryState {
                ledger,
                ..MemoryState::default()
            }),
            unavailable: AtomicBool::new(false),
        })
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn stock(&self, key: &StockKey) -> Option<i32> {
        self.state.lock().await.ledger.get(key).copied()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn item_count(&self) -> usize {
        self.state
            .lock()
            .await
            .orders
            .values()
            .map(|order| order.items.len())
            .sum()
    }

    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn outbox_len(&self) -> usize {
        self.state.lock().await.outbox.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_by_reference(&self, payment_reference: &str) -> Result<Option<OrderView>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.orders.get(payment_reference).cloned())
    }

    async fn insert_order(&self, draft: &OrderDraft) -> Result<InsertOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        if state.orders.contains_key(&draft.payment_reference) {
            return Ok(InsertOutcome::Conflict);
        }

        let mut adjustments = Vec::new();
        for (key, delta) in draft.stock_deltas() {
            let outcome = match state.ledger.get_mut(&key) {
                Some(quantity) => {
                    *quantity += delta;
                    Ok(*quantity)
                }
                None => Err(LedgerError::MissingEntry(key.clone())),
            };
            adjustments.push(Adjustment { key, delta, outcome });
        }

        let order = OrderView {
            id: draft.id,
            payment_reference: draft.payment_reference.clone(),
            user_id: draft.user_id,
            total_amount: draft.total_amount.clone(),
            status: OrderStatus::Completed,
            shipping_address_id: draft.shipping_address_id(),
            created_at: Utc::now(),
            items: draft
                .items
                .iter()
                .map(|item| OrderItemView {
                    product_id: item.product_id.clone(),
                    size: item.size.clone(),
                    quantity: item.quantity,
                    price_at_time: item.unit_price.clone(),
                })
                .collect(),
        };

        state.orders.insert(draft.payment_reference.clone(), order.clone());
        state.outbox.push(order.id);
        state.writes += 1;

        Ok(InsertOutcome::Created { order, adjustments })
    }
}

/// Hides committed orders from the first lookup, reproducing a caller that
/// checked before the winning transaction became visible.
pub struct StaleFirstRead {
    inner: Arc<MemoryOrderStore>,
    first_read_done: AtomicBool,
}

impl StaleFirstRead {
    pub fn new(inner: Arc<MemoryOrderStore>) -> Self {
        Self {
            inner,
            first_read_done: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OrderStore for StaleFirstRead {
    async fn find_by_reference(&self, payment_reference: &str) -> Result<Option<OrderView>, StoreError> {
        if !self.first_read_done.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_reference(payment_reference).await
    }

    async fn insert_order(&self, draft: &OrderDraft) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_order(draft).await
    }
}

#[derive(Default)]
pub struct FakeProcessor {
    payments: Mutex<HashMap<String, PaymentResult>>,
}

impl FakeProcessor {
    pub async fn put(&self, result: PaymentResult) {
        self.payments
            .lock()
            .await
            .insert(result.reference.clone(), result);
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn fetch_payment(&self, reference: &str) -> Result<PaymentResult, ProcessorError> {
        self.payments
            .lock()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(reference.to_string()))
    }
}
