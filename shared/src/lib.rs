use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub size: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

impl LineItem {
    pub fn subtotal(&self) -> BigDecimal {
        BigDecimal::from(self.quantity) * &self.unit_price
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingSnapshot {
    pub address_id: Option<Uuid>,
    pub name: Option<String>,
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Normalised view of one payment attempt as reported by the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub reference: String,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub user_id: Option<Uuid>,
    pub line_items: Vec<LineItem>,
    pub shipping_snapshot: Option<ShippingSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownOrderStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownOrderStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(UnknownOrderStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product_id: String,
    pub size: String,
    pub quantity: i32,
    pub price_at_time: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub payment_reference: String,
    pub user_id: Uuid,
    pub total_amount: BigDecimal,
    pub status: OrderStatus,
    pub shipping_address_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemView>,
}

/// Result of a materialize call. `created` is true only for the caller that
/// won the insert; replays and race losers see `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderHandle {
    pub order_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub payment_reference: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfirmResponse {
    #[serde(rename_all = "camelCase")]
    Materialized { order_id: Uuid, created: bool },
    NotSucceeded { status: PaymentStatus },
}

impl From<OrderHandle> for ConfirmResponse {
    fn from(handle: OrderHandle) -> Self {
        ConfirmResponse::Materialized {
            order_id: handle.order_id,
            created: handle.created,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
