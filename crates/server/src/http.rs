use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use meter_core::{
    DailyUsage, EndpointUsage, HourlyUsage, ModelUsageRow, RateLimitConfig, RateLimitConfigInput,
    RateLimitStatus, ResetStrategy, Snapshot, fmt_utc, local_date, parse_ts,
};
use meter_db::{Db, SortOrder};
use meter_engine::reset_status;
use serde::{Deserialize, Serialize};

use crate::coordinator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub coordinator: Arc<Coordinator>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

#[derive(Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Deserialize)]
struct DailyQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
struct ModelUsageQuery {
    pattern: Option<String>,
    start: Option<String>,
    end: Option<String>,
    order: Option<String>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct LatestUsageResponse {
    snapshot: Option<Snapshot>,
    models: Vec<ModelUsageRow>,
}

#[derive(Serialize)]
struct LimitView {
    #[serde(flatten)]
    config: RateLimitConfig,
    status: Option<RateLimitStatus>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/collector/health", get(health))
        .route("/api/collector/trigger", post(trigger))
        .route("/api/collector/reset/{config_id}", post(reset_limit))
        .route("/api/usage/latest", get(latest_usage))
        .route("/api/usage/daily", get(daily_usage))
        .route("/api/usage/models", get(model_usage))
        .route("/api/usage/hourly", get(hourly_usage))
        .route("/api/usage/endpoints", get(endpoint_usage))
        .route("/api/limits", get(list_limits).post(create_limit))
        .route("/api/limits/{id}", put(update_limit))
        .with_state(state)
}

/// Liveness only: never touches the store or the upstream.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": fmt_utc(Utc::now()),
    }))
}

async fn trigger(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    state.coordinator.trigger();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message": "collection pass queued" })),
    )
}

async fn reset_limit(
    State(state): State<AppState>,
    AxumPath(config_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let id: i64 = config_id
        .parse()
        .map_err(|_| to_bad_request("config id must be an integer"))?;
    let now = Utc::now();
    let engine = *state.coordinator.engine_config();
    let reset = state
        .coordinator
        .with_db(|db| -> meter_db::Result<Option<RateLimitStatus>> {
            let Some(config) = db.get_limit_config(id)? else {
                return Ok(None);
            };
            let status = reset_status(&config, &engine, now);
            db.upsert_limit_status(&status)?;
            db.set_reset_anchor(id, &fmt_utc(now), &fmt_utc(now))?;
            Ok(Some(status))
        })
        .map_err(to_api_error)?;
    let Some(status) = reset else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("rate limit config {id} not found"),
            }),
        ));
    };
    // the next pass sees the anchor and preserves the reset
    state.coordinator.trigger();
    Ok(Json(serde_json::json!({
        "message": format!("rate limit {id} reset"),
        "new_status": {
            "percentage": status.percentage,
            "label": status.status_label,
        },
    })))
}

async fn latest_usage(
    State(state): State<AppState>,
) -> Result<Json<LatestUsageResponse>, (StatusCode, Json<ApiError>)> {
    let db = open_db(&state)?;
    let snapshot = db.latest_snapshot().map_err(to_api_error)?;
    let models = match &snapshot {
        Some(snapshot) => db
            .model_rows_for_snapshot(snapshot.id)
            .map_err(to_api_error)?,
        None => Vec::new(),
    };
    Ok(Json(LatestUsageResponse { snapshot, models }))
}

async fn daily_usage(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<Vec<DailyUsage>>, (StatusCode, Json<ApiError>)> {
    let offset = state.coordinator.engine_config().timezone_offset_hours;
    let today = local_date(Utc::now(), offset);
    let to = match query.to {
        Some(value) => validate_date(&value)?,
        None => today.format("%Y-%m-%d").to_string(),
    };
    let from = match query.from {
        Some(value) => validate_date(&value)?,
        None => (today - Duration::days(6)).format("%Y-%m-%d").to_string(),
    };
    let db = open_db(&state)?;
    db.daily_range(&from, &to).map(Json).map_err(to_api_error)
}

async fn model_usage(
    State(state): State<AppState>,
    Query(query): Query<ModelUsageQuery>,
) -> Result<Json<Vec<ModelUsageRow>>, (StatusCode, Json<ApiError>)> {
    let (start, end) = resolve_range(&RangeQuery {
        start: query.start,
        end: query.end,
    })?;
    let order = match query.order.as_deref().unwrap_or("asc") {
        "asc" => SortOrder::Asc,
        "desc" => SortOrder::Desc,
        value => return Err(to_bad_request(format!("unsupported order {value}"))),
    };
    let limit = query.limit.map(|value| value.min(10_000));
    let db = open_db(&state)?;
    db.rows_in_range(query.pattern.as_deref(), &start, &end, order, limit)
        .map(Json)
        .map_err(to_api_error)
}

async fn hourly_usage(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<HourlyUsage>>, (StatusCode, Json<ApiError>)> {
    let (start, end) = resolve_range(&query)?;
    let offset = state.coordinator.engine_config().timezone_offset_hours;
    let db = open_db(&state)?;
    db.hourly_usage(&start, &end, offset)
        .map(Json)
        .map_err(to_api_error)
}

async fn endpoint_usage(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<EndpointUsage>>, (StatusCode, Json<ApiError>)> {
    let (start, end) = resolve_range(&query)?;
    let db = open_db(&state)?;
    db.endpoint_usage(&start, &end).map(Json).map_err(to_api_error)
}

async fn list_limits(
    State(state): State<AppState>,
) -> Result<Json<Vec<LimitView>>, (StatusCode, Json<ApiError>)> {
    let db = open_db(&state)?;
    let configs = db.list_limit_configs().map_err(to_api_error)?;
    let statuses = db.list_limit_statuses().map_err(to_api_error)?;
    let views = configs
        .into_iter()
        .map(|config| {
            let status = statuses
                .iter()
                .find(|status| status.config_id == config.id)
                .cloned();
            LimitView { config, status }
        })
        .collect();
    Ok(Json(views))
}

async fn create_limit(
    State(state): State<AppState>,
    Json(input): Json<RateLimitConfigInput>,
) -> Result<Json<RateLimitConfig>, (StatusCode, Json<ApiError>)> {
    validate_limit_input(&input)?;
    let db = open_db(&state)?;
    db.insert_limit_config(&input, &fmt_utc(Utc::now()))
        .map(Json)
        .map_err(to_api_error)
}

async fn update_limit(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(input): Json<RateLimitConfigInput>,
) -> Result<Json<RateLimitConfig>, (StatusCode, Json<ApiError>)> {
    let id: i64 = id
        .parse()
        .map_err(|_| to_bad_request("config id must be an integer"))?;
    validate_limit_input(&input)?;
    let db = open_db(&state)?;
    let updated = db
        .update_limit_config(id, &input, &fmt_utc(Utc::now()))
        .map_err(to_api_error)?;
    updated.map(Json).ok_or((
        StatusCode::NOT_FOUND,
        Json(ApiError {
            error: format!("rate limit config {id} not found"),
        }),
    ))
}

fn validate_limit_input(
    input: &RateLimitConfigInput,
) -> Result<(), (StatusCode, Json<ApiError>)> {
    if input.model_pattern.trim().is_empty() {
        return Err(to_bad_request("model_pattern is required"));
    }
    if input.reset_strategy == ResetStrategy::Rolling && input.window_minutes <= 0 {
        return Err(to_bad_request(
            "rolling limits need a positive window_minutes",
        ));
    }
    Ok(())
}

fn open_db(state: &AppState) -> Result<Db, (StatusCode, Json<ApiError>)> {
    Db::open(&state.db_path).map_err(to_api_error)
}

fn resolve_range(query: &RangeQuery) -> Result<(String, String), (StatusCode, Json<ApiError>)> {
    let end = match &query.end {
        Some(value) => parse_ts(value).map_err(to_bad_request)?,
        None => Utc::now(),
    };
    let start = match &query.start {
        Some(value) => parse_ts(value).map_err(to_bad_request)?,
        None => end - Duration::hours(24),
    };
    Ok((fmt_utc(start), fmt_utc(end)))
}

fn validate_date(value: &str) -> Result<String, (StatusCode, Json<ApiError>)> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| value.to_string())
        .map_err(|_| to_bad_request(format!("invalid date {value}, expected YYYY-MM-DD")))
}

fn to_api_error(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}

fn to_bad_request(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::pricing::PricingOracle;
    use crate::upstream::UpstreamClient;
    use axum::body::Body;
    use http::{Request, StatusCode as HttpStatus};
    use http_body_util::BodyExt;
    use meter_core::{NewModelUsage, ResetStrategy};
    use meter_db::{NewSnapshot, PassWrite};
    use meter_engine::EngineConfig;
    use std::time::Duration as StdDuration;
    use tower::util::ServiceExt;

    struct TestState {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn setup_state() -> TestState {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("test.sqlite");
        let mut db = Db::open(&db_path).expect("open db");
        db.migrate().expect("migrate db");
        let engine = EngineConfig {
            timezone_offset_hours: 0,
            ..EngineConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            db,
            UpstreamClient::new("http://127.0.0.1:1", None),
            PricingOracle::new(None, StdDuration::from_secs(3600)),
            engine,
        ));
        TestState {
            state: AppState {
                db_path,
                coordinator,
            },
            _dir: dir,
        }
    }

    fn seed_usage(state: &TestState) {
        let mut db = Db::open(&state.state.db_path).expect("open db");
        let rows = vec![
            NewModelUsage {
                api_endpoint: "chat".to_string(),
                model_name: "gpt-4".to_string(),
                request_count: 10,
                input_tokens: 600,
                output_tokens: 400,
                total_tokens: 1000,
                estimated_cost_usd: 0.042,
            },
            NewModelUsage {
                api_endpoint: "embeddings".to_string(),
                model_name: "text-embed".to_string(),
                request_count: 4,
                input_tokens: 400,
                output_tokens: 0,
                total_tokens: 400,
                estimated_cost_usd: 0.0004,
            },
        ];
        let snapshot = NewSnapshot {
            captured_at: "2024-03-15T10:00:00.000Z".to_string(),
            raw_json: "{}".to_string(),
            total_requests: 14,
            success_count: 14,
            failure_count: 0,
            total_tokens: 1400,
        };
        let daily = DailyUsage {
            date: "2024-03-15".to_string(),
            total_requests: 14,
            success_count: 14,
            failure_count: 0,
            total_tokens: 1400,
            total_cost_usd: 0.0424,
            breakdown: Default::default(),
        };
        db.commit_pass(&PassWrite {
            snapshot: &snapshot,
            cumulative_cost_usd: 0.0424,
            rows: &rows,
            daily: &daily,
        })
        .expect("commit pass");
    }

    fn seed_limit(state: &TestState, used_tokens: u64) -> RateLimitConfig {
        let db = Db::open(&state.state.db_path).expect("open db");
        let config = db
            .insert_limit_config(
                &RateLimitConfigInput {
                    model_pattern: "gpt".to_string(),
                    window_minutes: 1440,
                    reset_strategy: ResetStrategy::Daily,
                    token_limit: Some(10_000),
                    request_limit: None,
                },
                "2024-03-15T00:00:00.000Z",
            )
            .expect("insert config");
        db.upsert_limit_status(&RateLimitStatus {
            config_id: config.id,
            used_tokens,
            used_requests: 0,
            remaining_tokens: Some(10_000 - used_tokens),
            remaining_requests: None,
            percentage: (10_000 - used_tokens) * 100 / 10_000,
            status_label: format!("{used_tokens}/10000 tokens used"),
            window_start: "2024-03-15T00:00:00.000Z".to_string(),
            next_reset: "2024-03-16T00:00:00.000Z".to_string(),
            last_updated: "2024-03-15T10:00:00.000Z".to_string(),
        })
        .expect("upsert status");
        config
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("parse body")
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let test_state = setup_state();
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/collector/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["status"], "healthy");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn trigger_is_accepted() {
        let test_state = setup_state();
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collector/trigger")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::ACCEPTED);
    }

    #[tokio::test]
    async fn reset_restores_full_percentage_and_stamps_the_anchor() {
        let test_state = setup_state();
        let config = seed_limit(&test_state, 8_000);
        let app = build_app(test_state.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/collector/reset/{}", config.id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["new_status"]["percentage"], 100);

        let db = Db::open(&test_state.state.db_path).expect("open db");
        let status = db
            .get_limit_status(config.id)
            .expect("query")
            .expect("status");
        assert_eq!(status.used_tokens, 0);
        assert_eq!(status.percentage, 100);
        let config = db
            .get_limit_config(config.id)
            .expect("query")
            .expect("config");
        assert!(config.reset_anchor.is_some());
    }

    #[tokio::test]
    async fn reset_unknown_config_is_404() {
        let test_state = setup_state();
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collector/reset/999")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::NOT_FOUND);
    }

    #[tokio::test]
    async fn reset_non_integer_id_is_400() {
        let test_state = setup_state();
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collector/reset/abc")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn latest_usage_returns_snapshot_with_rows() {
        let test_state = setup_state();
        seed_usage(&test_state);
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/usage/latest")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["snapshot"]["total_requests"], 14);
        assert_eq!(payload["models"].as_array().expect("models").len(), 2);
    }

    #[tokio::test]
    async fn daily_usage_honours_explicit_range() {
        let test_state = setup_state();
        seed_usage(&test_state);
        let app = build_app(test_state.state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/usage/daily?from=2024-03-15&to=2024-03-15")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        let rows = payload.as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["date"], "2024-03-15");

        let bad = app
            .oneshot(
                Request::builder()
                    .uri("/api/usage/daily?from=15-03-2024")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(bad.status(), HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn model_usage_filters_by_pattern() {
        let test_state = setup_state();
        seed_usage(&test_state);
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(
                        "/api/usage/models?pattern=gpt&start=2024-03-15T00:00:00Z&end=2024-03-16T00:00:00Z",
                    )
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        let rows = payload.as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["model_name"], "gpt-4");
    }

    #[tokio::test]
    async fn endpoint_usage_aggregates_per_endpoint() {
        let test_state = setup_state();
        seed_usage(&test_state);
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(
                        "/api/usage/endpoints?start=2024-03-15T00:00:00Z&end=2024-03-16T00:00:00Z",
                    )
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        assert_eq!(payload.as_array().expect("rows").len(), 2);
    }

    #[tokio::test]
    async fn limits_view_merges_config_and_status() {
        let test_state = setup_state();
        seed_limit(&test_state, 2_000);
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/limits")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::OK);
        let payload = body_json(response).await;
        let views = payload.as_array().expect("views");
        assert_eq!(views.len(), 1);
        assert_eq!(views[0]["model_pattern"], "gpt");
        assert_eq!(views[0]["status"]["used_tokens"], 2_000);
    }

    #[tokio::test]
    async fn create_limit_validates_input() {
        let test_state = setup_state();
        let app = build_app(test_state.state.clone());

        let bad = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/limits")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model_pattern":"gpt","window_minutes":0,"reset_strategy":"rolling","token_limit":1000,"request_limit":null}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(bad.status(), HttpStatus::BAD_REQUEST);

        let good = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/limits")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model_pattern":"claude","window_minutes":300,"reset_strategy":"rolling","token_limit":50000,"request_limit":null}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(good.status(), HttpStatus::OK);
        let payload = body_json(good).await;
        assert_eq!(payload["model_pattern"], "claude");
        assert_eq!(payload["reset_strategy"], "rolling");

        let db = Db::open(&test_state.state.db_path).expect("open db");
        assert_eq!(db.list_limit_configs().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn update_limit_returns_404_for_unknown_id() {
        let test_state = setup_state();
        let app = build_app(test_state.state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/limits/42")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model_pattern":"gpt","window_minutes":60,"reset_strategy":"daily","token_limit":null,"request_limit":100}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), HttpStatus::NOT_FOUND);
    }
}
