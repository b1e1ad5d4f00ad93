use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

use crate::store::OrderDraft;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub payment_reference: String,
    pub user_id: Uuid,
    pub total_amount: BigDecimal,
    pub status: String,
    pub shipping_address_id: Option<Uuid>,
    pub shipping_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub payment_reference: String,
    pub user_id: Uuid,
    pub total_amount: BigDecimal,
    pub status: String,
    pub shipping_address_id: Option<Uuid>,
    pub shipping_snapshot: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(belongs_to(OrderRow, foreign_key = order_id))]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: String,
    pub size: String,
    pub quantity: i32,
    pub price_at_time: BigDecimal,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: String,
    pub size: String,
    pub quantity: i32,
    pub price_at_time: BigDecimal,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

pub const ORDER_MATERIALIZED: &str = "OrderMaterialized";

impl NewOrder {
    pub fn from_draft(draft: &OrderDraft) -> Result<Self, serde_json::Error> {
        let shipping_snapshot = draft
            .shipping_snapshot
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        Ok(Self {
            id: draft.id,
            payment_reference: draft.payment_reference.clone(),
            user_id: draft.user_id,
            total_amount: draft.total_amount.clone(),
            status: OrderStatus::Completed.as_str().to_string(),
            shipping_address_id: draft.shipping_address_id(),
            shipping_snapshot,
        })
    }
}

impl NewOrderItem {
    pub fn for_order(order_id: Uuid, position: i32, item: &LineItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            position,
            product_id: item.product_id.clone(),
            size: item.size.clone(),
            quantity: item.quantity,
            price_at_time: item.unit_price.clone(),
        }
    }
}

impl NewOutboxEvent {
    pub fn order_materialized(order: &OrderView) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: order.id,
            event_type: ORDER_MATERIALIZED.to_string(),
            event_data: serde_json::to_value(order)?,
        })
    }
}

impl OrderRow {
    pub fn into_view(self, items: Vec<OrderItemRow>) -> Result<OrderView, UnknownOrderStatus> {
        Ok(OrderView {
            id: self.id,
            payment_reference: self.payment_reference,
            user_id: self.user_id,
            total_amount: self.total_amount,
            status: self.status.parse()?,
            shipping_address_id: self.shipping_address_id,
            created_at: self.created_at,
            items: items.into_iter().map(OrderItemView::from).collect(),
        })
    }
}

impl From<OrderItemRow> for OrderItemView {
    fn from(row: OrderItemRow) -> Self {
        Self {
            product_id: row.product_id,
            size: row.size,
            quantity: row.quantity,
            price_at_time: row.price_at_time,
        }
    }
}
