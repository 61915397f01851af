use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use forno_config::Config;
use forno_contracts::{
    ApiResponse, FieldError, InboundMessage, MenuEvent, MessageText, Product, SendTextRequest,
    WebhookReceipt,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

pub mod agent;
pub mod clients;
pub mod store;

use clients::{ClientError, CompletionModel, MessageGateway, OpenAiCompletion, ZapiGateway};
use store::{
    EventPatch, EventQuery, MemoryStore, NewEvent, NewProduct, ProductPatch, ProductQuery,
    SqliteStore, StoreBackend, StoreError,
};

const INBOUND_QUEUE_CAPACITY: usize = 64;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

/// Builds the application with the real outbound clients.
pub fn build_app(cfg: Config) -> Result<Router, String> {
    let completion = OpenAiCompletion::from_config(&cfg).map_err(|e| e.to_string())?;
    let gateway = ZapiGateway::from_config(&cfg).map_err(|e| e.to_string())?;
    build_app_with(cfg, Arc::new(completion), Arc::new(gateway))
}

/// Same wiring with injectable clients; tests pass recording fakes.
pub fn build_app_with(
    cfg: Config,
    completion: Arc<dyn CompletionModel>,
    gateway: Arc<dyn MessageGateway>,
) -> Result<Router, String> {
    let (state, inbound_rx) = AppState::with_clients(cfg, completion, gateway)?;
    agent::spawn_worker(state.clone(), inbound_rx);
    Ok(router(state))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(create_event).get(list_events))
        .route(
            "/events/{id}",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/api/products", post(create_product).get(list_products))
        .route(
            "/api/products/{id}",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route("/api/products/{id}/hard", delete(hard_delete_product))
        .route("/api/messages/send", post(send_message))
        .route("/webhooks/whatsapp", post(whatsapp_webhook))
        .fallback(route_not_found)
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) cfg: Config,
    pub(crate) store: Arc<Mutex<StoreBackend>>,
    pub(crate) completion: Arc<dyn CompletionModel>,
    pub(crate) gateway: Arc<dyn MessageGateway>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl AppState {
    pub fn with_clients(
        cfg: Config,
        completion: Arc<dyn CompletionModel>,
        gateway: Arc<dyn MessageGateway>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path).map_err(|e| e.to_string())?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        Ok((
            Self {
                cfg,
                store: Arc::new(Mutex::new(store)),
                completion,
                gateway,
                inbound_tx,
            },
            inbound_rx,
        ))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation Error")]
    Validation(Vec<FieldError>),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(resource) => ApiError::NotFound(resource),
            StoreError::Backend(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::validation_failure(errors)),
            )
                .into_response(),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::failure(format!("{resource} not found"))),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                // full detail stays in the log, never in the response
                error!(%detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::failure("Internal Server Error")),
                )
                    .into_response()
            }
        }
    }
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "API is running",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn route_not_found(method: Method, uri: Uri) -> (StatusCode, Json<ApiResponse>) {
    let mut body = ApiResponse::failure("Route not found");
    body.message = Some(format!("Cannot {method} {}", uri.path()));
    (StatusCode::NOT_FOUND, Json(body))
}

// ---- products ----

async fn create_product(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ApiResponse<Product>>), ApiError> {
    let input = validate_create_product(&body)?;
    info!(name = %input.name, "creating product");
    let product = state.store.lock().await.create_product(input)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(product).with_message("Product created successfully")),
    ))
}

#[derive(Debug, Deserialize)]
struct ListProductsRaw {
    page: Option<String>,
    limit: Option<String>,
    category: Option<String>,
    #[serde(rename = "isActive")]
    is_active: Option<String>,
    search: Option<String>,
}

async fn list_products(
    State(state): State<AppState>,
    Query(raw): Query<ListProductsRaw>,
) -> Result<Json<ApiResponse<Vec<Product>>>, ApiError> {
    let query = validate_list_products(&raw)?;
    let (products, pagination) = state.store.lock().await.list_products(&query)?;
    Ok(Json(ApiResponse::ok(products).with_pagination(pagination)))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Product>>, ApiError> {
    let product = state.store.lock().await.get_product(&id)?;
    Ok(Json(ApiResponse::ok(product)))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<Product>>, ApiError> {
    let patch = validate_update_product(&body)?;
    info!(%id, "updating product");
    let product = state.store.lock().await.update_product(&id, patch)?;
    Ok(Json(
        ApiResponse::ok(product).with_message("Product updated successfully"),
    ))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    info!(%id, "soft deleting product");
    state.store.lock().await.soft_delete_product(&id)?;
    Ok(Json(ApiResponse::message_only(
        "Product deleted successfully",
    )))
}

async fn hard_delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    info!(%id, "hard deleting product");
    state.store.lock().await.hard_delete_product(&id)?;
    Ok(Json(ApiResponse::message_only("Product permanently deleted")))
}

// ---- menu events ----

async fn create_event(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ApiResponse<MenuEvent>>), ApiError> {
    let input = validate_create_event(&body)?;
    info!(store_id = %input.store_id, kind = %input.kind, "creating event");
    let event = state.store.lock().await.create_event(input)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(event))))
}

#[derive(Debug, Deserialize)]
struct ListEventsRaw {
    #[serde(rename = "storeId")]
    store_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<String>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(raw): Query<ListEventsRaw>,
) -> Result<Json<ApiResponse<Vec<MenuEvent>>>, ApiError> {
    let query = validate_list_events(&raw)?;
    let events = state.store.lock().await.list_events(&query)?;
    let count = events.len();
    Ok(Json(ApiResponse::ok(events).with_count(count)))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<MenuEvent>>, ApiError> {
    let event = state.store.lock().await.get_event(&id)?;
    Ok(Json(ApiResponse::ok(event)))
}

async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<MenuEvent>>, ApiError> {
    let patch = validate_update_event(&body)?;
    info!(%id, "updating event");
    let event = state.store.lock().await.update_event(&id, patch)?;
    Ok(Json(ApiResponse::ok(event)))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    info!(%id, "deleting event");
    state.store.lock().await.delete_event(&id)?;
    Ok(Json(ApiResponse::message_only("Event deleted successfully")))
}

// ---- messaging ----

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<forno_contracts::SendTextResponse>>, ApiError> {
    let request = validate_send_message(&body)?;
    info!(phone = %request.phone, "sending direct message");
    let receipt = state.gateway.send_text(&request).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

/// Webhook receiver: validates the provider payload and republishes it
/// onto the internal queue. Always acknowledges; pipeline failures are
/// invisible to the provider.
async fn whatsapp_webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ApiResponse<WebhookReceipt>>), ApiError> {
    let message = validate_webhook(&body)?;
    let receipt = WebhookReceipt {
        message_id: message.message_id.clone(),
        phone: message.phone.clone(),
        timestamp: message.timestamp,
    };
    info!(message_id = %receipt.message_id, "webhook accepted, enqueuing message");
    state
        .inbound_tx
        .send(message)
        .await
        .map_err(|e| ApiError::Internal(format!("inbound queue closed: {e}")))?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(receipt))))
}

// ---- validation ----

#[derive(Default)]
struct Errors(Vec<FieldError>);

impl Errors {
    fn push(&mut self, field: &str, message: &str) {
        self.0.push(FieldError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    fn check<T>(self, value: T) -> Result<T, ApiError> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(ApiError::Validation(self.0))
        }
    }
}

fn as_object<'a>(body: &'a Value, errors: &mut Errors) -> Option<&'a serde_json::Map<String, Value>> {
    match body.as_object() {
        Some(map) => Some(map),
        None => {
            errors.push("body", "Body must be a JSON object");
            None
        }
    }
}

fn required_string(
    map: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Errors,
) -> Option<String> {
    match map.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        Some(_) => {
            errors.push(field, &format!("{field} is required"));
            None
        }
        None => {
            errors.push(field, &format!("{field} is required"));
            None
        }
    }
}

fn optional_string(
    map: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Errors,
) -> Option<String> {
    match map.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(field, &format!("{field} must be a string"));
            None
        }
    }
}

fn validate_create_product(body: &Value) -> Result<NewProduct, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(NewProduct {
            name: String::new(),
            description: None,
            price: 0.0,
            category: String::new(),
            stock: 0,
            is_active: true,
        });
    };

    let name = required_string(map, "name", &mut errors).unwrap_or_default();
    if name.chars().count() > 100 {
        errors.push("name", "Name must be at most 100 characters");
    }
    let description = optional_string(map, "description", &mut errors);
    let price = match map.get("price").and_then(|v| v.as_f64()) {
        Some(price) if price > 0.0 => price,
        Some(_) => {
            errors.push("price", "Price must be positive");
            0.0
        }
        None => {
            errors.push("price", "Price is required");
            0.0
        }
    };
    let category = required_string(map, "category", &mut errors).unwrap_or_default();
    let stock = match map.get("stock") {
        None | Some(Value::Null) => 0,
        Some(value) => match value.as_i64() {
            Some(stock) if stock >= 0 => stock,
            _ => {
                errors.push("stock", "Stock must be a non-negative integer");
                0
            }
        },
    };
    let is_active = match map.get("isActive") {
        None | Some(Value::Null) => true,
        Some(value) => match value.as_bool() {
            Some(flag) => flag,
            None => {
                errors.push("isActive", "isActive must be a boolean");
                true
            }
        },
    };

    errors.check(NewProduct {
        name,
        description,
        price,
        category,
        stock,
        is_active,
    })
}

fn validate_update_product(body: &Value) -> Result<ProductPatch, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(ProductPatch::default());
    };

    let mut patch = ProductPatch {
        name: optional_string(map, "name", &mut errors),
        description: optional_string(map, "description", &mut errors),
        ..ProductPatch::default()
    };
    if let Some(name) = &patch.name {
        if name.trim().is_empty() || name.chars().count() > 100 {
            errors.push("name", "Name must be 1 to 100 characters");
        }
    }
    if let Some(value) = map.get("price").filter(|v| !v.is_null()) {
        match value.as_f64() {
            Some(price) if price > 0.0 => patch.price = Some(price),
            _ => errors.push("price", "Price must be positive"),
        }
    }
    patch.category = optional_string(map, "category", &mut errors);
    if let Some(category) = &patch.category {
        if category.trim().is_empty() {
            errors.push("category", "Category must not be empty");
        }
    }
    if let Some(value) = map.get("stock").filter(|v| !v.is_null()) {
        match value.as_i64() {
            Some(stock) if stock >= 0 => patch.stock = Some(stock),
            _ => errors.push("stock", "Stock must be a non-negative integer"),
        }
    }
    if let Some(value) = map.get("isActive").filter(|v| !v.is_null()) {
        match value.as_bool() {
            Some(flag) => patch.is_active = Some(flag),
            None => errors.push("isActive", "isActive must be a boolean"),
        }
    }

    errors.check(patch)
}

fn validate_list_products(raw: &ListProductsRaw) -> Result<ProductQuery, ApiError> {
    let mut errors = Errors::default();
    let page = parse_positive(raw.page.as_deref(), 1, "page", &mut errors);
    let limit = parse_positive(raw.limit.as_deref(), 10, "limit", &mut errors);
    let is_active = match raw.is_active.as_deref() {
        None => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(_) => {
            errors.push("isActive", "isActive must be true or false");
            None
        }
    };
    errors.check(ProductQuery {
        page,
        limit,
        category: raw.category.clone(),
        is_active,
        search: raw.search.clone(),
    })
}

fn parse_positive(raw: Option<&str>, default: u64, field: &str, errors: &mut Errors) -> u64 {
    match raw {
        None => default,
        Some(text) => match text.parse::<u64>() {
            Ok(value) if value >= 1 => value,
            _ => {
                errors.push(field, &format!("{field} must be a positive integer"));
                default
            }
        },
    }
}

fn parse_payload(
    map: &serde_json::Map<String, Value>,
    errors: &mut Errors,
) -> Option<forno_contracts::EventPayload> {
    match map.get("data") {
        None | Some(Value::Null) => None,
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(payload) => Some(payload),
            Err(err) => {
                errors.push("data", &format!("Invalid event payload: {err}"));
                None
            }
        },
    }
}

fn validate_create_event(body: &Value) -> Result<NewEvent, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(NewEvent {
            title: String::new(),
            description: None,
            kind: String::new(),
            store_id: String::new(),
            data: None,
        });
    };

    let title = required_string(map, "title", &mut errors).unwrap_or_default();
    let kind = required_string(map, "type", &mut errors).unwrap_or_default();
    let store_id = required_string(map, "storeId", &mut errors).unwrap_or_default();
    let description = optional_string(map, "description", &mut errors);
    let data = parse_payload(map, &mut errors);

    errors.check(NewEvent {
        title,
        description,
        kind,
        store_id,
        data,
    })
}

fn validate_update_event(body: &Value) -> Result<EventPatch, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(EventPatch::default());
    };

    let patch = EventPatch {
        title: optional_string(map, "title", &mut errors),
        description: optional_string(map, "description", &mut errors),
        kind: optional_string(map, "type", &mut errors),
        data: parse_payload(map, &mut errors),
    };
    if let Some(title) = &patch.title {
        if title.trim().is_empty() {
            errors.push("title", "Title must not be empty");
        }
    }
    if let Some(kind) = &patch.kind {
        if kind.trim().is_empty() {
            errors.push("type", "Type must not be empty");
        }
    }

    errors.check(patch)
}

fn validate_list_events(raw: &ListEventsRaw) -> Result<EventQuery, ApiError> {
    let mut errors = Errors::default();
    let limit = match raw.limit.as_deref() {
        None => None,
        Some(text) => match text.parse::<usize>() {
            Ok(limit) if limit >= 1 => Some(limit),
            _ => {
                errors.push("limit", "limit must be a positive integer");
                None
            }
        },
    };
    errors.check(EventQuery {
        store_id: raw.store_id.clone(),
        kind: raw.kind.clone(),
        limit,
    })
}

fn validate_send_message(body: &Value) -> Result<SendTextRequest, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(SendTextRequest {
            phone: String::new(),
            message: String::new(),
            delay_message: None,
            delay_typing: None,
        });
    };

    let phone = required_string(map, "phone", &mut errors).unwrap_or_default();
    let message = required_string(map, "message", &mut errors).unwrap_or_default();
    let delay_message = optional_u64(map, "delayMessage", &mut errors);
    let delay_typing = optional_u64(map, "delayTyping", &mut errors);

    errors.check(SendTextRequest {
        phone,
        message,
        delay_message,
        delay_typing,
    })
}

fn optional_u64(
    map: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Errors,
) -> Option<u64> {
    match map.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(number) => Some(number),
            None => {
                errors.push(field, &format!("{field} must be a non-negative integer"));
                None
            }
        },
    }
}

fn validate_webhook(body: &Value) -> Result<InboundMessage, ApiError> {
    let mut errors = Errors::default();
    let Some(map) = as_object(body, &mut errors) else {
        return errors.check(InboundMessage {
            message_id: String::new(),
            phone: String::new(),
            from_me: false,
            timestamp: None,
            text: None,
        });
    };

    let message_id = required_string(map, "messageId", &mut errors).unwrap_or_default();
    let phone = required_string(map, "phone", &mut errors).unwrap_or_default();
    let from_me = map
        .get("fromMe")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let timestamp = map.get("timestamp").and_then(|v| v.as_i64());
    let text = map
        .get("text")
        .and_then(|t| t.get("message"))
        .and_then(|m| m.as_str())
        .map(|message| MessageText {
            message: message.to_string(),
        });

    errors.check(InboundMessage {
        message_id,
        phone,
        from_me,
        timestamp,
        text,
    })
}
