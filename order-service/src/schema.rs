diesel::table! {
    orders (id) {
        id -> Uuid,
        payment_reference -> Varchar,
        user_id -> Uuid,
        total_amount -> Numeric,
        status -> Varchar,
        shipping_address_id -> Nullable<Uuid>,
        shipping_snapshot -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        position -> Int4,
        product_id -> Varchar,
        size -> Varchar,
        quantity -> Int4,
        price_at_time -> Numeric,
    }
}

diesel::table! {
    stock_ledger (product_id, size) {
        product_id -> Varchar,
        size -> Varchar,
        quantity -> Int4,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(order_items -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_items,
    stock_ledger,
    outbox_events,
);
