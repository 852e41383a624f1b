use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use store_sqlite::{QueryOrder, SqliteStore, StatusQuery};
use tracing::{error, info};

pub const MIN_HOURS: i64 = 1;
pub const MAX_HOURS: i64 = 24;
pub const DEFAULT_HOURS: i64 = 3;
pub const MIN_TOKEN_CHARS: usize = 2;
pub const MAX_TOKEN_CHARS: usize = 25;
pub const RESULT_LIMIT: i64 = 100;

pub struct AppState {
    pub db_path: PathBuf,
}

/// Raw request parameters, kept as strings so a malformed value produces
/// our structured error list instead of a framework-level rejection.
#[derive(Debug, Default, Deserialize)]
pub struct ApiParams {
    pub order: Option<String>,
    pub hours: Option<String>,
    pub query: Option<String>,
}

/// Validate request parameters into a storage query, collecting every
/// violation rather than stopping at the first.
pub fn validate_params(params: &ApiParams) -> Result<StatusQuery, Vec<String>> {
    let mut errors = Vec::new();

    let order = match params.order.as_deref().unwrap_or("pop") {
        "pop" => QueryOrder::Popularity,
        "chrono" => QueryOrder::Recency,
        _ => {
            errors.push("Unsupported ?order= value. Use either =pop or =chrono.".to_string());
            QueryOrder::Popularity
        }
    };

    let hours = match params.hours.as_deref() {
        None => DEFAULT_HOURS,
        Some(raw) => match raw.parse::<i64>() {
            Ok(h) if (MIN_HOURS..=MAX_HOURS).contains(&h) => h,
            _ => {
                errors.push(
                    "Unsupported ?hours= value. Use a value between 1 and 24.".to_string(),
                );
                DEFAULT_HOURS
            }
        },
    };

    let token = match params.query.as_deref().unwrap_or("") {
        "" => None,
        raw => {
            let chars = raw.chars().count();
            if (MIN_TOKEN_CHARS..=MAX_TOKEN_CHARS).contains(&chars)
                && raw.chars().all(char::is_alphanumeric)
            {
                Some(raw.to_string())
            } else {
                errors.push(
                    "Unsupported ?query= value. Use a single alphanumeric keyword between 2 \
                     and 25 characters in length, with no spaces or special characters."
                        .to_string(),
                );
                None
            }
        }
    };

    if errors.is_empty() {
        Ok(StatusQuery {
            order,
            hours,
            token,
            limit: RESULT_LIMIT,
        })
    } else {
        Err(errors)
    }
}

async fn api_statuses(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ApiParams>,
) -> Response {
    let query = match validate_params(&params) {
        Ok(query) => query,
        Err(errors) => return (StatusCode::BAD_REQUEST, Json(errors)).into_response(),
    };

    // Each request opens its own read connection; WAL mode lets these
    // proceed while the pipeline is writing.
    let db_path = state.db_path.clone();
    let result = tokio::task::spawn_blocking(move || {
        let store = SqliteStore::open(&db_path)?;
        store.query_statuses(&query, Utc::now())
    })
    .await;

    match result {
        Ok(Ok(statuses)) => Json(statuses).into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "status query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "storage unavailable"})),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "status query task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

async fn index_page() -> Html<&'static str> {
    Html(
        r#"<h1>trendmill</h1>
<p>Query the API at <a href="/api">/api</a>. Parameters: <code>?order=pop|chrono</code>,
<code>?hours=1..24</code>, <code>?query=keyword</code>.</p>
"#,
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", get(api_statuses))
        .route("/", get(index_page))
        .with_state(state)
}

/// Run the query service until the process is stopped. Initializes the
/// schema once so the projection surface exists before the first cycle.
pub async fn serve(db_path: PathBuf, addr: SocketAddr) -> anyhow::Result<()> {
    {
        let store = SqliteStore::open(&db_path)?;
        store.init_schema()?;
    }
    let app = router(Arc::new(AppState { db_path }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "query service listening");
    axum::serve(listener, app).await?;
    Ok(())
}
