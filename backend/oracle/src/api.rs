//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db;
use crate::events::{EventRecord, EventStatus, IssuanceStatus, NftIssuance};

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Pagination {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl Pagination {
    fn bounds(&self) -> Result<(i64, i64), String> {
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if offset < 0 {
            return Err("offset must not be negative".to_string());
        }
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(format!("limit must be between 1 and {MAX_LIMIT}"));
        }
        Ok((offset, limit))
    }
}

// No `#[serde(flatten)]` here: `Query` cannot parse numbers through it.
#[derive(Debug, Default, Deserialize)]
pub struct BoxScheduleQuery {
    pub status: Option<i64>,
    pub owner: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl BoxScheduleQuery {
    fn pagination(&self) -> Pagination {
        Pagination {
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub status: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl EventsQuery {
    fn pagination(&self) -> Pagination {
        Pagination {
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub offset: i64,
    pub limit: i64,
    pub count: usize,
    pub records: Vec<T>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// `0x` followed by exactly 40 hex digits.
pub fn is_address(raw: &str) -> bool {
    raw.len() == 42
        && (raw.starts_with("0x") || raw.starts_with("0X"))
        && raw[2..].chars().all(|c| c.is_ascii_hexdigit())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /api/v1/boxSchedule?status=&owner=&offset=&limit=`
///
/// Lists loot-box issuance records, oldest first.
pub async fn get_box_schedule(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BoxScheduleQuery>,
) -> Response {
    let (offset, limit) = match query.pagination().bounds() {
        Ok(bounds) => bounds,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let status = match query.status.map(IssuanceStatus::from_code) {
        Some(None) => {
            return error_response(StatusCode::BAD_REQUEST, "unknown status".to_string())
        }
        Some(status) => status,
        None => None,
    };
    if let Some(owner) = query.owner.as_deref() {
        if !is_address(owner) {
            return error_response(StatusCode::BAD_REQUEST, "invalid owner".to_string());
        }
    }

    match db::get_issuances(&state.pool, status, query.owner.as_deref(), offset, limit).await {
        Ok(records) => (
            StatusCode::OK,
            Json(ListResponse::<NftIssuance> {
                offset,
                limit,
                count: records.len(),
                records,
            }),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /events?status=&offset=&limit=`
///
/// Returns indexed transfer events, ordered by block.
pub async fn get_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let (offset, limit) = match query.pagination().bounds() {
        Ok(bounds) => bounds,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let status = match query.status.as_deref().map(EventStatus::from_name) {
        Some(None) => {
            return error_response(StatusCode::BAD_REQUEST, "unknown status".to_string())
        }
        Some(status) => status,
        None => None,
    };

    match db::get_events(&state.pool, status, offset, limit).await {
        Ok(records) => (
            StatusCode::OK,
            Json(ListResponse::<EventRecord> {
                offset,
                limit,
                count: records.len(),
                records,
            }),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;

    use crate::db::tests::test_pool;

    #[test]
    fn owner_must_be_a_full_address() {
        assert!(is_address("0x00000000000000000000000000000000000000aB"));
        assert!(!is_address("0x1234"));
        assert!(!is_address("0xzz000000000000000000000000000000000000ab"));
        assert!(!is_address("0000000000000000000000000000000000000000ab"));
    }

    #[test]
    fn pagination_is_bounded() {
        assert_eq!(Pagination::default().bounds().unwrap(), (0, DEFAULT_LIMIT));
        let too_big = Pagination {
            offset: None,
            limit: Some(MAX_LIMIT + 1),
        };
        assert!(too_big.bounds().is_err());
        let negative = Pagination {
            offset: Some(-1),
            limit: None,
        };
        assert!(negative.bounds().is_err());
    }

    #[test]
    fn paging_parameters_parse_from_the_query_string() {
        let uri: Uri = "http://localhost/api/v1/boxSchedule?status=0&limit=10&offset=5"
            .parse()
            .unwrap();
        let Query(query) = Query::<BoxScheduleQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(query.status, Some(0));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.pagination().bounds().unwrap(), (5, 10));

        let uri: Uri = "http://localhost/events?status=new_payment&offset=5"
            .parse()
            .unwrap();
        let Query(query) = Query::<EventsQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(query.status.as_deref(), Some("new_payment"));
        assert_eq!(query.pagination().bounds().unwrap(), (5, DEFAULT_LIMIT));
    }

    #[tokio::test]
    async fn box_schedule_rejects_bad_filters() {
        let state = Arc::new(ApiState {
            pool: test_pool().await,
        });
        let query = BoxScheduleQuery {
            status: Some(7),
            ..Default::default()
        };
        let response = get_box_schedule(State(state.clone()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let query = BoxScheduleQuery {
            owner: Some("bob".to_string()),
            ..Default::default()
        };
        let response = get_box_schedule(State(state.clone()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let query = BoxScheduleQuery {
            limit: Some(MAX_LIMIT + 1),
            ..Default::default()
        };
        let response = get_box_schedule(State(state.clone()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let query = BoxScheduleQuery {
            status: Some(0),
            limit: Some(10),
            offset: Some(5),
            ..Default::default()
        };
        let response = get_box_schedule(State(state), Query(query)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
