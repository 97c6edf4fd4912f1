//! Purpose: Provide the HTTP/JSON server for tabula tables.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum adapter over one `Database`; the only place that authenticates callers.
//! Invariants: All engine calls run under one mutex, so begin/mutate/commit sequences never interleave.
//! Invariants: Error envelopes reuse the CLI shape; error kinds map to stable status codes.
//! Invariants: Loopback-only unless explicitly allowed, and non-loopback binds require a token.

use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::table_info_json::{error_json, rows_json, table_info_json};
use tabula::api::{Database, Error, ErrorKind, Filter, Record, Schema};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub table_dir: PathBuf,
    pub token: Option<String>,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
}

struct AppState {
    db: Mutex<Database>,
    token: Option<String>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let mut db = Database::open(&config.table_dir)?;
    let report = db.open_all()?;
    for err in &report.failed {
        tracing::warn!(
            table = err.table().unwrap_or_default(),
            kind = ?err.kind(),
            error = %err,
            "skipping table that failed to load"
        );
    }

    let state = Arc::new(AppState {
        db: Mutex::new(db),
        token: config.token,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/tables", get(list_tables))
        .route("/create_table", post(create_table))
        .route("/insert/:table", post(insert_record))
        .route("/select/:table", get(select_records))
        .route("/update/:table", put(update_records))
        .route("/delete/:table", delete(delete_records))
        .route("/drop/:table", delete(drop_table))
        .route("/begin/:table", post(begin_transaction))
        .route("/commit/:table", post(commit_transaction))
        .route("/rollback/:table", post(rollback_transaction))
        .route("/backup/:table", post(backup_table))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        dir = %config.table_dir.display(),
        tables = report.loaded.len(),
        skipped = report.failed.len(),
        "tabula serve listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    tracing::info!("tabula serve stopped");
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) {
        if !config.allow_non_loopback {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("non-loopback bind requires explicit opt-in")
                .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
        }
        if config.token.is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("non-loopback bind requires a bearer token")
                .with_hint("Provide --token-file (or --token for development)."));
        }
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    let expected = format!("Bearer {token}");
    if value != expected {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

/// Runs `op` against the shared database on the blocking pool, holding the
/// mutex for its whole duration.
async fn with_db<T, F>(state: &Arc<AppState>, op: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&mut Database) -> Result<T, Error> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        let mut db = state.db.lock().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("database lock poisoned")
        })?;
        op(&mut *db)
    })
    .await
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("database task failed")
            .with_source(err)
    })?
}

#[derive(Debug, Deserialize)]
struct CreateTableRequest {
    table_name: String,
    schema: Option<serde_json::Value>,
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct InsertQuery {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateRequest {
    #[serde(default)]
    conditions: Option<serde_json::Value>,
    updates: serde_json::Value,
}

fn conditions_filter(conditions: Option<serde_json::Value>) -> Result<Filter, Error> {
    match conditions {
        Some(value) => Record::from_json(value),
        None => Ok(Filter::new()),
    }
}

/// A DELETE body is either `{"conditions": {...}}` or the conditions object
/// itself. Record values are never objects, so an object under `conditions`
/// can only be the wrapped form.
fn delete_filter(body: serde_json::Value) -> Result<Filter, Error> {
    match body {
        serde_json::Value::Object(mut map)
            if map.len() == 1 && map.get("conditions").is_some_and(|v| v.is_object()) =>
        {
            conditions_filter(map.remove("conditions"))
        }
        other => Record::from_json(other),
    }
}

/// Query strings carry only text, so each value is read as a JSON literal
/// when it parses as a scalar (`2`, `1.5`, `true`, `null`) and as a string
/// otherwise. Quote a value (`name="2"`) to match the string form.
fn query_filter(query: BTreeMap<String, String>) -> Result<Filter, Error> {
    let mut map = serde_json::Map::new();
    for (field, raw) in query {
        let value = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) if !value.is_array() && !value.is_object() => value,
            _ => serde_json::Value::String(raw),
        };
        map.insert(field, value);
    }
    Record::from_json(serde_json::Value::Object(map))
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_tables(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match with_db(&state, |db| Ok(db.list_tables())).await {
        Ok(tables) => json_response(json!({ "tables": tables })),
        Err(err) => error_response(err),
    }
}

async fn create_table(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateTableRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let schema = match payload
        .schema
        .as_ref()
        .map(|schema| Schema::from_json(schema, payload.strict))
        .transpose()
    {
        Ok(schema) => schema,
        Err(err) => return error_response(err),
    };
    let name = payload.table_name;
    match with_db(&state, move |db| db.create_table(&name, schema)).await {
        Ok(info) => json_response(json!({ "table": table_info_json(&info) })),
        Err(err) => error_response(err),
    }
}

async fn insert_record(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
    Query(query): Query<InsertQuery>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let record = match Record::from_json(payload) {
        Ok(record) => record,
        Err(err) => return error_response(err),
    };
    let result = with_db(&state, move |db| {
        match query.key.as_deref() {
            Some(key) => db.insert_unique(&table, record, key)?,
            None => db.insert(&table, record)?,
        }
        db.table_info(&table)
    })
    .await;
    match result {
        Ok(info) => json_response(json!({ "inserted": 1, "table": table_info_json(&info) })),
        Err(err) => error_response(err),
    }
}

async fn select_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let filter = match query_filter(query) {
        Ok(filter) => filter,
        Err(err) => return error_response(err),
    };
    match with_db(&state, move |db| db.select(&table, &filter)).await {
        Ok(rows) => json_response(json!({ "count": rows.len(), "rows": rows_json(&rows) })),
        Err(err) => error_response(err),
    }
}

async fn update_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
    Json(payload): Json<UpdateRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let parsed = conditions_filter(payload.conditions)
        .and_then(|filter| Ok((filter, Record::from_json(payload.updates)?)));
    let (filter, changes) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => return error_response(err),
    };
    match with_db(&state, move |db| db.update(&table, &filter, &changes)).await {
        Ok(updated) => json_response(json!({ "updated": updated })),
        Err(err) => error_response(err),
    }
}

async fn delete_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let filter = match delete_filter(payload) {
        Ok(filter) => filter,
        Err(err) => return error_response(err),
    };
    match with_db(&state, move |db| db.delete(&table, &filter)).await {
        Ok(deleted) => json_response(json!({ "deleted": deleted })),
        Err(err) => error_response(err),
    }
}

async fn drop_table(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match with_db(&state, move |db| db.drop_table(&table)).await {
        Ok(()) => json_response(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

#[derive(Clone, Copy, Debug)]
enum TxnAction {
    Begin,
    Commit,
    Rollback,
}

async fn transaction_action(
    state: Arc<AppState>,
    headers: HeaderMap,
    table: String,
    action: TxnAction,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let result = with_db(&state, move |db| {
        match action {
            TxnAction::Begin => db.begin_transaction(&table)?,
            TxnAction::Commit => db.commit(&table)?,
            TxnAction::Rollback => db.rollback(&table)?,
        }
        db.table_info(&table)
    })
    .await;
    match result {
        Ok(info) => json_response(json!({ "ok": true, "table": table_info_json(&info) })),
        Err(err) => error_response(err),
    }
}

async fn begin_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
) -> Response {
    transaction_action(state, headers, table, TxnAction::Begin).await
}

async fn commit_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
) -> Response {
    transaction_action(state, headers, table, TxnAction::Commit).await
}

async fn rollback_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
) -> Response {
    transaction_action(state, headers, table, TxnAction::Rollback).await
}

async fn backup_table(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(table): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match with_db(&state, move |db| db.backup(&table)).await {
        Ok(path) => json_response(json!({ "backup": { "path": path.display().to_string() } })),
        Err(err) => error_response(err),
    }
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::TableNotFound => StatusCode::NOT_FOUND,
        ErrorKind::TableAlreadyExists
        | ErrorKind::DuplicateKey
        | ErrorKind::TransactionAlreadyOpen
        | ErrorKind::NoOpenTransaction => StatusCode::CONFLICT,
        ErrorKind::SchemaViolation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::CommitFailed | ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(error_json(&err))).into_response()
}
