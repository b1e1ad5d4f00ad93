use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::{self, Adjustment, StockKey};
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order store unavailable: {0}")]
    Unavailable(String),
    #[error("order store error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DieselError> for StoreError {
    fn from(error: DieselError) -> Self {
        match &error {
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
                StoreError::Unavailable(error.to_string())
            }
            DieselError::DatabaseError(kind, info) => {
                debug!(?kind, message = info.message(), "Diesel operation failed");
                StoreError::Database(error.to_string())
            }
            _ => StoreError::Database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Database(format!("serialization failed: {}", error))
    }
}

impl From<UnknownOrderStatus> for StoreError {
    fn from(error: UnknownOrderStatus) -> Self {
        StoreError::Database(error.to_string())
    }
}

/// Everything needed to write one order in a single transaction.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub id: Uuid,
    pub payment_reference: String,
    pub user_id: Uuid,
    pub total_amount: BigDecimal,
    pub shipping_snapshot: Option<ShippingSnapshot>,
    pub items: Vec<LineItem>,
}

impl OrderDraft {
    pub fn shipping_address_id(&self) -> Option<Uuid> {
        self.shipping_snapshot.as_ref().and_then(|s| s.address_id)
    }

    /// Stock decrements in line-item order, one per item.
    pub fn stock_deltas(&self) -> Vec<(StockKey, i32)> {
        self.items
            .iter()
            .map(|item| (StockKey::new(&item.product_id, &item.size), -item.quantity))
            .collect()
    }
}

#[derive(Debug)]
pub enum InsertOutcome {
    Created {
        order: OrderView,
        adjustments: Vec<Adjustment>,
    },
    /// Another writer already holds this payment reference; nothing was written.
    Conflict,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_reference(&self, payment_reference: &str) -> Result<Option<OrderView>, StoreError>;

    /// Inserts the order, its items, one ledger adjustment per item and the
    /// materialization outbox event as one transaction. Returns `Conflict`
    /// without side effects when the payment reference is already taken.
    async fn insert_order(&self, draft: &OrderDraft) -> Result<InsertOutcome, StoreError>;
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

async fn load_order(conn: &mut AsyncPgConnection, order: OrderRow) -> Result<OrderView, StoreError> {
    let items = OrderItemRow::belonging_to(&order)
        .order(order_items::position.asc())
        .load::<OrderItemRow>(conn)
        .await?;
    Ok(order.into_view(items)?)
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_by_reference(&self, payment_reference: &str) -> Result<Option<OrderView>, StoreError> {
        let mut conn = self.connection().await?;

        let order = orders::table
            .filter(orders::payment_reference.eq(payment_reference))
            .first::<OrderRow>(&mut conn)
            .await
            .optional()?;

        match order {
            Some(order) => Ok(Some(load_order(&mut conn, order).await?)),
            None => Ok(None),
        }
    }

    async fn insert_order(&self, draft: &OrderDraft) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.connection().await?;

        let new_order = NewOrder::from_draft(draft)?;
        let new_items: Vec<NewOrderItem> = draft
            .items
            .iter()
            .zip(0..)
            .map(|(item, position)| NewOrderItem::for_order(draft.id, position, item))
            .collect();
        let deltas = draft.stock_deltas();
        let order_id = draft.id;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let inserted = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .on_conflict(orders::payment_reference)
                    .do_nothing()
                    .execute(conn)
                    .await?;

                if inserted == 0 {
                    return Ok(InsertOutcome::Conflict);
                }

                diesel::insert_into(order_items::table)
                    .values(&new_items)
                    .execute(conn)
                    .await?;

                let mut adjustments = Vec::with_capacity(deltas.len());
                for (key, delta) in deltas {
                    let outcome = ledger::adjust(conn, &key, delta).await;
                    adjustments.push(Adjustment { key, delta, outcome });
                }

                let order = orders::table
                    .find(order_id)
                    .first::<OrderRow>(conn)
                    .await?;
                let order = load_order(conn, order).await?;

                let outbox_event = NewOutboxEvent::order_materialized(&order)?;
                diesel::insert_into(outbox_events::table)
                    .values(&outbox_event)
                    .execute(conn)
                    .await?;

                Ok(InsertOutcome::Created { order, adjustments })
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn draft_with(items: Vec<LineItem>) -> OrderDraft {
        OrderDraft {
            id: Uuid::new_v4(),
            payment_reference: "pi_123".to_string(),
            user_id: Uuid::new_v4(),
            total_amount: BigDecimal::from_str("69.97").unwrap(),
            shipping_snapshot: None,
            items,
        }
    }

    #[test]
    fn stock_deltas_negate_quantities() {
        let draft = draft_with(vec![
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
        ]);

        assert_eq!(
            draft.stock_deltas(),
            vec![(StockKey::new("shoe-1", "M"), -2), (StockKey::new("sock-7", "L"), -1)]
        );
    }

    #[test]
    fn shipping_address_id_comes_from_snapshot() {
        let address_id = Uuid::new_v4();
        let mut draft = draft_with(Vec::new());
        assert_eq!(draft.shipping_address_id(), None);

        draft.shipping_snapshot = Some(ShippingSnapshot {
            address_id: Some(address_id),
            ..ShippingSnapshot::default()
        });
        assert_eq!(draft.shipping_address_id(), Some(address_id));
    }

    #[test]
    fn closed_connection_is_transient() {
        let unavailable = StoreError::Unavailable("pool timed out".to_string());
        let not_found = StoreError::from(DieselError::NotFound);

        assert!(unavailable.is_transient());
        assert!(!not_found.is_transient());
    }
}
