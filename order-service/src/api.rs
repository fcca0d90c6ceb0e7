use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use inventory_service::models::{NewProduct, StockKey, StockRecord};
use inventory_service::mutation::{AdjustStock, DeductStock, MissingStockPolicy};
use inventory_service::queue::TaskPublisher;
use inventory_service::retry::RetryLoop;
use inventory_service::store::{DbPool, PgStockStore};
use inventory_service::FulfillmentError;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;
use crate::catalog;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub store: PgStockStore,
    pub publisher: TaskPublisher,
    pub retry: RetryLoop,
    pub task_topic: String,
    pub missing_stock: MissingStockPolicy,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StockRequest {
    pub product_id: i64,
    pub warehouse_id: i64,
    /// Positive to receive, negative to issue
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct TenantRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: BigDecimal,
    #[serde(default)]
    pub sku: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub message: String,
    pub task_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub message: String,
    pub ledger_entries: usize,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub message: String,
    pub stock_id: i64,
    pub current_stock: i64,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub message: String,
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into(), details: None }))
}

fn fulfillment_error(e: FulfillmentError) -> ApiError {
    let status = match &e {
        FulfillmentError::InsufficientStock { .. } | FulfillmentError::StockNotFound { .. } => StatusCode::CONFLICT,
        FulfillmentError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        FulfillmentError::TransientConflict(_)
        | FulfillmentError::ConflictExhausted { .. }
        | FulfillmentError::ConnectionFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        FulfillmentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(kind = e.kind(), "Request failed: {}", e);
    }
    let details = match &e {
        FulfillmentError::InsufficientStock { product_id, available, requested } => Some(serde_json::json!({
            "product_id": product_id,
            "stock": available,
            "required": requested,
        })),
        _ => None,
    };
    (status, Json(ErrorResponse { error: e.to_string(), details }))
}

fn tenant_id(query: &TenantQuery) -> Result<i64, ApiError> {
    let raw = match query.tenant.as_deref() {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "tenant query string is required")),
    };
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(api_error(StatusCode::BAD_REQUEST, "invalid tenant ID")),
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "invalid request body"))
}

fn order_payload(tenant_id: i64, request: OrderRequest) -> Result<DeductStockPayload, ApiError> {
    if request.warehouse_id == 0 || request.items.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "warehouse_id and items are required"));
    }
    let payload = DeductStockPayload::from_request(tenant_id, request);
    payload
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    Ok(payload)
}

/// Rejects work for tenants that were never registered.
async fn require_tenant(state: &AppState, tenant_id: i64) -> Result<(), ApiError> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|e| fulfillment_error(e.into()))?;
    let exists = catalog::tenant_exists(&mut conn, tenant_id)
        .await
        .map_err(|e| fulfillment_error(e.into()))?;
    if !exists {
        return Err(api_error(StatusCode::BAD_REQUEST, "tenant not found"));
    }
    Ok(())
}

fn valid_name(name: &str) -> bool {
    (1..=255).contains(&name.chars().count())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/orders-queue", post(enqueue_order))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/stocks", post(adjust_stock))
        .route("/api/v1/stocks/:id", get(get_stock))
        .route("/api/v1/tenants", post(create_tenant))
        .route("/api/v1/products", post(create_product))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn enqueue_order(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
    request: Result<Json<OrderRequest>, JsonRejection>,
) -> ApiResult<EnqueuedResponse> {
    let tenant_id = tenant_id(&query)?;
    let payload = order_payload(tenant_id, body(request)?)?;
    require_tenant(&state, tenant_id).await?;

    let task = Task::deduct_stock(&payload)
        .map_err(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create task payload"))?;

    if let Err(e) = state
        .publisher
        .publish(&state.task_topic, &payload.routing_key(), &task)
        .await
    {
        tracing::error!("Failed to enqueue task: {}", e);
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue task"));
    }

    tracing::info!(task_id = %task.id, tenant_id, warehouse_id = payload.warehouse_id, "Order enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            message: "Order enqueued for processing".to_string(),
            task_id: task.id,
        }),
    ))
}

pub async fn create_order(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
    request: Result<Json<OrderRequest>, JsonRejection>,
) -> ApiResult<OrderResponse> {
    let tenant_id = tenant_id(&query)?;
    let payload = order_payload(tenant_id, body(request)?)?;
    require_tenant(&state, tenant_id).await?;

    let committed = state
        .retry
        .run(&state.store, &DeductStock::new(payload, state.missing_stock))
        .await
        .map_err(fulfillment_error)?;

    Ok((
        StatusCode::CREATED,
        Json(OrderResponse {
            message: "Order created".to_string(),
            ledger_entries: committed.output.entries.len(),
            attempts: committed.attempts,
        }),
    ))
}

pub async fn adjust_stock(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
    request: Result<Json<StockRequest>, JsonRejection>,
) -> ApiResult<StockResponse> {
    let tenant_id = tenant_id(&query)?;
    let request = body(request)?;
    if request.product_id <= 0 || request.warehouse_id <= 0 || request.quantity == 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "product_id, warehouse_id, and quantity are required",
        ));
    }
    require_tenant(&state, tenant_id).await?;

    let adjustment = AdjustStock {
        key: StockKey::new(tenant_id, request.warehouse_id, request.product_id),
        delta: request.quantity,
    };
    let committed = state
        .retry
        .run(&state.store, &adjustment)
        .await
        .map_err(fulfillment_error)?;

    Ok((
        StatusCode::CREATED,
        Json(StockResponse {
            message: "Stock updated".to_string(),
            stock_id: committed.output.stock_id,
            current_stock: committed.output.levels.quantity,
        }),
    ))
}

pub async fn get_stock(
    State(state): State<AppState>,
    Path(stock_id): Path<i64>,
) -> ApiResult<StockRecord> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|e| fulfillment_error(e.into()))?;

    match catalog::stock_by_id(&mut conn, stock_id).await {
        Ok(Some(record)) => Ok((StatusCode::OK, Json(record))),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Stock not found")),
        Err(e) => Err(fulfillment_error(e.into())),
    }
}

pub async fn create_tenant(
    State(state): State<AppState>,
    request: Result<Json<TenantRequest>, JsonRejection>,
) -> ApiResult<CreatedResponse> {
    let request = body(request)?;
    if !valid_name(&request.name) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "name is required and must be <= 255 characters",
        ));
    }

    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|e| fulfillment_error(e.into()))?;
    let tenant = catalog::create_tenant(&mut conn, request.name)
        .await
        .map_err(|e| fulfillment_error(e.into()))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            message: "Tenant created".to_string(),
            id: tenant.id,
            name: tenant.name,
        }),
    ))
}

pub async fn create_product(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
    request: Result<Json<ProductRequest>, JsonRejection>,
) -> ApiResult<CreatedResponse> {
    let tenant_id = tenant_id(&query)?;
    let request = body(request)?;
    if !valid_name(&request.name) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "name is required and must be <= 255 characters",
        ));
    }
    if request.price <= BigDecimal::zero() {
        return Err(api_error(StatusCode::BAD_REQUEST, "price is required and must be > 0"));
    }

    require_tenant(&state, tenant_id).await?;

    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|e| fulfillment_error(e.into()))?;
    let product = catalog::create_product(
        &mut conn,
        NewProduct {
            tenant_id,
            name: request.name,
            description: request.description,
            price: request.price,
            sku: request.sku,
        },
    )
    .await
    .map_err(|e| fulfillment_error(e.into()))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            message: "Product created".to_string(),
            id: product.id,
            name: product.name,
        }),
    ))
}

pub async fn health_check() -> &'static str {
    "OK"
}
