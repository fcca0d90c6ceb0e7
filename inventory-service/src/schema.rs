diesel::table! {
    processed_tasks (task_id) {
        task_id -> Uuid,
        task_name -> Varchar,
        result -> Nullable<Jsonb>,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    product (id) {
        id -> Int8,
        tenant_id -> Int8,
        name -> Varchar,
        description -> Text,
        price -> Numeric,
        sku -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    stock (id) {
        id -> Int8,
        tenant_id -> Int8,
        warehouse_id -> Int8,
        product_id -> Int8,
        minimum -> Int8,
        quantity -> Int8,
        reserve -> Int8,
        on_hand -> Int8,
        status -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tenant (id) {
        id -> Int8,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    transaction_ledger (id) {
        id -> Int8,
        model -> Varchar,
        event -> Varchar,
        tenant_id -> Int8,
        product_id -> Int8,
        warehouse_id -> Int8,
        stock_id -> Int8,
        quantity_old -> Int8,
        quantity_change -> Int8,
        quantity_new -> Int8,
        reserve_old -> Int8,
        reserve_change -> Int8,
        reserve_new -> Int8,
        on_hand_old -> Int8,
        on_hand_change -> Int8,
        on_hand_new -> Int8,
        status -> Bool,
        task_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(product -> tenant (tenant_id));
diesel::joinable!(transaction_ledger -> stock (stock_id));

diesel::allow_tables_to_appear_in_same_query!(
    processed_tasks,
    product,
    stock,
    tenant,
    transaction_ledger,
);
