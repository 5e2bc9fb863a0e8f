//! Admin/query surface: read-only queries over the request log plus a
//! read-only circuit-state snapshot — one `AdminState`, one `admin_auth`
//! middleware checked against a single shared key, one router function the
//! binary crate nests under `/admin`.
//!
//! Every handler here is read-only except `cleanup`, which only deletes.
//! Provider/credential mutation lives in `llmrelay-provider`'s repository
//! trait and is not exposed here — this surface is scoped to query
//! operations over the log.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use llmrelay_provider::circuit::CircuitBreakerManager;
use llmrelay_storage::entities::{self, request_body::Column as BodyColumn, request_log::Column as LogColumn};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, ExprTrait, Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;
use time::{Duration as TimeDuration, OffsetDateTime, format_description::well_known::Rfc3339};

const MAX_PAGE_SIZE: u64 = 100;
const MAX_EXPORT_RECORDS: u64 = 10_000;

#[derive(Clone)]
pub struct AdminState {
    pub db: DatabaseConnection,
    pub breakers: Arc<CircuitBreakerManager>,
    pub admin_key: String,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/logs", get(query_logs))
        .route("/logs/{trace_id}", get(get_log))
        .route("/stats", get(stats))
        .route("/export", get(export))
        .route("/cleanup", post(cleanup))
        .route("/circuits", get(circuits))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_admin_key(&headers, req.uri()).ok_or(StatusCode::UNAUTHORIZED)?;
    if key != state.admin_key {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_admin_key(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let query = uri.query()?;
    let parsed: std::collections::HashMap<String, String> = serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn normalize_opt_str(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn format_time_rfc3339(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn error_response(status: StatusCode, code: &str, detail: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": code, "detail": detail.to_string() }))).into_response()
}

fn db_error(err: sea_orm::DbErr) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", err)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    model_contains: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    cost_min: Option<f64>,
    #[serde(default)]
    cost_max: Option<f64>,
    #[serde(default)]
    error: Option<bool>,
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    sort_dir: Option<String>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
}

/// Whitelists the scalar columns this surface allows sorting by. Anything
/// not in this table falls back to `created_at` rather than erroring — a
/// stray `sort_by` shouldn't break the page.
fn sort_column(name: &str) -> LogColumn {
    match name {
        "http_status" => LogColumn::HttpStatus,
        "input_tokens" => LogColumn::InputTokens,
        "output_tokens" => LogColumn::OutputTokens,
        "duration_seconds" => LogColumn::DurationSeconds,
        "cost_total" => LogColumn::CostTotal,
        "platform" => LogColumn::Platform,
        "model" => LogColumn::Model,
        "provider" => LogColumn::Provider,
        _ => LogColumn::CreatedAt,
    }
}

fn parse_time_range(from: &Option<String>, to: &Option<String>) -> Result<(OffsetDateTime, OffsetDateTime), Response> {
    let now = OffsetDateTime::now_utc();
    let from = match normalize_opt_str(from.clone()) {
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339).map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_from", e))?,
        None => now - TimeDuration::days(30),
    };
    let to = match normalize_opt_str(to.clone()) {
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339).map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_to", e))?,
        None => now,
    };
    if to < from {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid_range", "`to` must be >= `from`"));
    }
    Ok((from, to))
}

fn apply_filters(
    mut select: sea_orm::Select<entities::RequestLogs>,
    platform: &Option<String>,
    model_contains: &Option<String>,
    provider: &Option<String>,
    from: OffsetDateTime,
    to: OffsetDateTime,
    cost_min: Option<f64>,
    cost_max: Option<f64>,
    error: Option<bool>,
) -> sea_orm::Select<entities::RequestLogs> {
    select = select.filter(LogColumn::CreatedAt.gte(from)).filter(LogColumn::CreatedAt.lte(to));
    if let Some(platform) = normalize_opt_str(platform.clone()) {
        select = select.filter(LogColumn::Platform.eq(platform));
    }
    if let Some(model) = normalize_opt_str(model_contains.clone()) {
        select = select.filter(LogColumn::Model.contains(model));
    }
    if let Some(provider) = normalize_opt_str(provider.clone()) {
        select = select.filter(LogColumn::Provider.eq(provider));
    }
    if let Some(min) = cost_min {
        select = select.filter(LogColumn::CostTotal.gte(min));
    }
    if let Some(max) = cost_max {
        select = select.filter(LogColumn::CostTotal.lte(max));
    }
    if let Some(error) = error {
        select = if error { select.filter(LogColumn::HttpStatus.gte(400)) } else { select.filter(LogColumn::HttpStatus.lt(400)) };
    }
    select
}

fn row_to_json(row: &entities::request_log::Model) -> serde_json::Value {
    serde_json::json!({
        "id": row.id,
        "trace_id": row.trace_id,
        "request_id": row.request_id,
        "platform": row.platform,
        "model": row.model,
        "provider": row.provider,
        "http_status": row.http_status,
        "input_tokens": row.input_tokens,
        "output_tokens": row.output_tokens,
        "cache_creation_input_tokens": row.cache_creation_input_tokens,
        "cache_read_input_tokens": row.cache_read_input_tokens,
        "reasoning_tokens": row.reasoning_tokens,
        "is_stream": row.is_stream,
        "duration_seconds": row.duration_seconds,
        "user_agent": row.user_agent,
        "client_ip": row.client_ip,
        "user_id": row.user_id,
        "request_method": row.request_method,
        "request_path": row.request_path,
        "error_type": row.error_type,
        "error_message": row.error_message,
        "vendor_error_code": row.vendor_error_code,
        "cost_input": row.cost_input,
        "cost_output": row.cost_output,
        "cost_cache_create": row.cost_cache_create,
        "cost_cache_read": row.cost_cache_read,
        "cost_ephemeral_5m": row.cost_ephemeral_5m,
        "cost_ephemeral_1h": row.cost_ephemeral_1h,
        "cost_total": row.cost_total,
        "has_pricing": row.has_pricing,
        "created_at": format_time_rfc3339(row.created_at),
    })
}

/// Paginated, filtered list: platform, model
/// substring, provider, time range, cost range, error boolean; sorted by any
/// whitelisted scalar field, page size clamped to 100.
async fn query_logs(State(state): State<AdminState>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let (from, to) = match parse_time_range(&query.from, &query.to) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let descending = !matches!(query.sort_dir.as_deref(), Some("asc"));
    let column = sort_column(query.sort_by.as_deref().unwrap_or("created_at"));

    let select = apply_filters(
        entities::RequestLogs::find(),
        &query.platform,
        &query.model_contains,
        &query.provider,
        from,
        to,
        query.cost_min,
        query.cost_max,
        query.error,
    );

    let rows = match select
        .order_by(column, if descending { Order::Desc } else { Order::Asc })
        .limit(limit + 1)
        .offset(offset)
        .all(&state.db)
        .await
    {
        Ok(v) => v,
        Err(err) => return db_error(err),
    };

    let has_more = rows.len() as u64 > limit;
    let rows: Vec<_> = rows.into_iter().take(limit as usize).map(|r| row_to_json(&r)).collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "from": format_time_rfc3339(from),
            "to": format_time_rfc3339(to),
            "limit": limit,
            "offset": offset,
            "has_more": has_more,
            "rows": rows,
        })),
    )
        .into_response()
}

/// Single record by `traceId`, joined with its request/response body.
async fn get_log(State(state): State<AdminState>, Path(trace_id): Path<String>) -> impl IntoResponse {
    let log = match entities::RequestLogs::find().filter(LogColumn::TraceId.eq(trace_id.clone())).one(&state.db).await {
        Ok(Some(v)) => v,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "not_found", "no record for that trace id"),
        Err(err) => return db_error(err),
    };
    let body = match entities::RequestBodies::find().filter(BodyColumn::TraceId.eq(trace_id)).one(&state.db).await {
        Ok(v) => v,
        Err(err) => return db_error(err),
    };

    let mut payload = row_to_json(&log);
    if let Some(body) = body {
        payload["request_body"] = serde_json::Value::String(String::from_utf8_lossy(&body.request_body).into_owned());
        payload["response_body"] = serde_json::Value::String(String::from_utf8_lossy(&body.response_body).into_owned());
    }
    (StatusCode::OK, Json(payload)).into_response()
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    window: Option<String>,
}

fn window_start(window: &str, now: OffsetDateTime) -> Result<Option<OffsetDateTime>, Response> {
    match window {
        "today" => Ok(Some(now - TimeDuration::hours(24))),
        "week" => Ok(Some(now - TimeDuration::days(7))),
        "month" => Ok(Some(now - TimeDuration::days(30))),
        "all" => Ok(None),
        other => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_window",
            format!("unsupported window: {other}; expected one of today/week/month/all"),
        )),
    }
}

#[derive(Debug, Default, sea_orm::FromQueryResult)]
struct GroupTotals {
    key: String,
    call_count: Option<i64>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cost_total: Option<f64>,
}

/// Aggregated statistics over `{today, week, month, all}`: overall totals
/// plus group-by-platform, group-by-provider, and
/// the top 10 models by call count.
async fn stats(State(state): State<AdminState>, Query(query): Query<StatsQuery>) -> impl IntoResponse {
    let window = query.window.as_deref().unwrap_or("today");
    let now = OffsetDateTime::now_utc();
    let start = match window_start(window, now) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut base = entities::RequestLogs::find();
    if let Some(start) = start {
        base = base.filter(LogColumn::CreatedAt.gte(start));
    }

    let total_count = match base.clone().count(&state.db).await {
        Ok(v) => v,
        Err(err) => return db_error(err),
    };

    let by_platform = match group_totals(&state.db, start, LogColumn::Platform).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let by_provider = match group_totals(&state.db, start, LogColumn::Provider).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut by_model = match group_totals(&state.db, start, LogColumn::Model).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    by_model.sort_by(|a, b| b.call_count.unwrap_or(0).cmp(&a.call_count.unwrap_or(0)));
    by_model.truncate(10);

    let totals = by_platform.iter().fold((0i64, 0i64, 0.0f64), |(inp, out, cost), g| {
        (inp + g.input_tokens.unwrap_or(0), out + g.output_tokens.unwrap_or(0), cost + g.cost_total.unwrap_or(0.0))
    });

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "window": window,
            "call_count": total_count,
            "input_tokens": totals.0,
            "output_tokens": totals.1,
            "cost_total": totals.2,
            "by_platform": group_to_json(&by_platform),
            "by_provider": group_to_json(&by_provider),
            "top_models": group_to_json(&by_model),
        })),
    )
        .into_response()
}

async fn group_totals(db: &DatabaseConnection, start: Option<OffsetDateTime>, column: LogColumn) -> Result<Vec<GroupTotals>, Response> {
    let mut select = entities::RequestLogs::find()
        .select_only()
        .column_as(column, "key")
        .column_as(Expr::col(LogColumn::Id).count(), "call_count")
        .column_as(Expr::col(LogColumn::InputTokens).sum(), "input_tokens")
        .column_as(Expr::col(LogColumn::OutputTokens).sum(), "output_tokens")
        .column_as(Expr::col(LogColumn::CostTotal).sum(), "cost_total")
        .group_by(column);
    if let Some(start) = start {
        select = select.filter(LogColumn::CreatedAt.gte(start));
    }
    select.into_model::<GroupTotals>().all(db).await.map_err(db_error)
}

fn group_to_json(groups: &[GroupTotals]) -> serde_json::Value {
    serde_json::Value::Array(
        groups
            .iter()
            .map(|g| {
                serde_json::json!({
                    "key": g.key,
                    "call_count": g.call_count.unwrap_or(0),
                    "input_tokens": g.input_tokens.unwrap_or(0),
                    "output_tokens": g.output_tokens.unwrap_or(0),
                    "cost_total": g.cost_total.unwrap_or(0.0),
                })
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

/// Export up to 10 000 records as CSV or JSON.
async fn export(State(state): State<AdminState>, Query(query): Query<ExportQuery>) -> impl IntoResponse {
    let (from, to) = match parse_time_range(&query.from, &query.to) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let format = query.format.as_deref().unwrap_or("json");

    let rows = match entities::RequestLogs::find()
        .filter(LogColumn::CreatedAt.gte(from))
        .filter(LogColumn::CreatedAt.lte(to))
        .order_by_desc(LogColumn::CreatedAt)
        .limit(MAX_EXPORT_RECORDS)
        .all(&state.db)
        .await
    {
        Ok(v) => v,
        Err(err) => return db_error(err),
    };

    match format {
        "csv" => {
            let body = render_csv(&rows);
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response()
        }
        "json" => {
            let body: Vec<_> = rows.iter().map(row_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "rows": body }))).into_response()
        }
        other => error_response(StatusCode::BAD_REQUEST, "invalid_format", format!("unsupported format: {other}; expected csv or json")),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) { format!("\"{}\"", value.replace('"', "\"\"")) } else { value.to_string() }
}

fn render_csv(rows: &[entities::request_log::Model]) -> String {
    let mut out = String::from(
        "trace_id,platform,model,provider,http_status,input_tokens,output_tokens,cost_total,is_stream,created_at\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            csv_escape(&row.trace_id),
            csv_escape(&row.platform),
            csv_escape(&row.model),
            csv_escape(&row.provider),
            row.http_status,
            row.input_tokens,
            row.output_tokens,
            row.cost_total,
            row.is_stream,
            format_time_rfc3339(row.created_at),
        ));
    }
    out
}

#[derive(Debug, Deserialize)]
struct CleanupBody {
    older_than_days: i64,
}

/// Deletes metadata and body records older than `older_than_days`. Wired to
/// the pipeline's own sweep logic so the admin surface and the TTL sweeper
/// can't disagree on what "expired" means.
async fn cleanup(State(state): State<AdminState>, Json(body): Json<CleanupBody>) -> impl IntoResponse {
    if body.older_than_days < 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid_older_than_days", "must be >= 0");
    }
    match llmrelay_storage::pipeline::cleanup_older_than(&state.db, body.older_than_days).await {
        Ok(deleted) => (StatusCode::OK, Json(serde_json::json!({ "deleted": deleted }))).into_response(),
        Err(err) => db_error(err),
    }
}

/// Read-only snapshot of every known provider's circuit state, served at
/// `/admin/circuits`.
async fn circuits(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshots = state.breakers.snapshot_all();
    let body: Vec<_> = snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "provider_id": s.provider_id,
                "state": s.state,
                "consecutive_failures": s.consecutive_failures,
                "last_failure_at": s.last_failure_at.map(format_time_rfc3339),
                "opened_at": s.opened_at.map(format_time_rfc3339),
                "total_requests": s.total_requests,
                "total_failures": s.total_failures,
                "total_successes": s.total_successes,
                "half_open_probe_in_flight": s.half_open_probe_in_flight,
            })
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "providers": body }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_column_falls_back_to_created_at_for_unknown_field() {
        assert_eq!(sort_column("nonsense"), LogColumn::CreatedAt);
        assert_eq!(sort_column("cost_total"), LogColumn::CostTotal);
    }

    #[test]
    fn csv_escape_quotes_values_containing_commas() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn extract_admin_key_prefers_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", "hdr-key".parse().unwrap());
        let uri: axum::http::Uri = "/logs?admin_key=query-key".parse().unwrap();
        assert_eq!(extract_admin_key(&headers, &uri).as_deref(), Some("hdr-key"));
    }

    #[test]
    fn extract_admin_key_falls_back_to_query_param() {
        let headers = HeaderMap::new();
        let uri: axum::http::Uri = "/logs?admin_key=query-key".parse().unwrap();
        assert_eq!(extract_admin_key(&headers, &uri).as_deref(), Some("query-key"));
    }
}
