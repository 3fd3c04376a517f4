use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bulk::{BulkBatch, BulkOrchestrator};
use crate::db::advice_writer::save_advice;
use crate::error::AppError;
use crate::export::export_batch;
use crate::pipeline::{Services, ValuationRun};
use crate::types::{BulkProgress, BulkRowStatus, Recommendation, ValuationReport};

#[derive(Clone)]
pub struct ApiState {
    pub services: Arc<Services>,
    pub pool: sqlx::SqlitePool,
    pub batches: Arc<DashMap<u64, Arc<BulkBatch>>>,
    pub next_batch_id: Arc<AtomicU64>,
    pub bulk_concurrency: usize,
}

impl ApiState {
    pub fn new(services: Arc<Services>, pool: sqlx::SqlitePool, bulk_concurrency: usize) -> Self {
        Self {
            services,
            pool,
            batches: Arc::new(DashMap::new()),
            next_batch_id: Arc::new(AtomicU64::new(1)),
            bulk_concurrency,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(crate::api::health::health))
        .route("/valuations/:plate", post(post_valuation))
        .route("/batches", post(post_batch))
        .route("/batches/:id", get(get_batch))
        .route("/batches/:id/export", get(get_batch_export))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ValuationQuery {
    pub mileage: Option<u32>,
    /// Persist the advice after the run (the explicit save step).
    pub save: Option<bool>,
}

#[derive(Serialize)]
pub struct BatchCreatedResponse {
    pub id: u64,
    pub total: usize,
}

#[derive(Serialize)]
pub struct BatchRowResponse {
    pub index: usize,
    pub status: BulkRowStatus,
    pub error: Option<String>,
    pub recommendation: Option<Recommendation>,
}

#[derive(Serialize)]
pub struct BatchStatusResponse {
    pub id: u64,
    pub progress: BulkProgress,
    pub done: bool,
    pub rows: Vec<BatchRowResponse>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn post_valuation(
    State(state): State<ApiState>,
    Path(plate): Path<String>,
    Query(params): Query<ValuationQuery>,
) -> Result<Json<ValuationReport>, AppError> {
    let mut run = ValuationRun::new(Arc::clone(&state.services));
    let report = run.run(&plate, params.mileage.unwrap_or(0)).await?;
    if params.save.unwrap_or(false) {
        save_advice(&state.pool, &report).await?;
    }
    Ok(Json(report))
}

async fn post_batch(
    State(state): State<ApiState>,
    Json(descriptions): Json<Vec<String>>,
) -> Result<Json<BatchCreatedResponse>, AppError> {
    let descriptions: Vec<String> = descriptions
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    if descriptions.is_empty() {
        return Err(AppError::Config("batch has no usable rows".into()));
    }

    let orchestrator =
        BulkOrchestrator::new(Arc::clone(&state.services), state.bulk_concurrency);
    let batch = orchestrator.ingest(descriptions);
    let id = state.next_batch_id.fetch_add(1, Ordering::SeqCst);
    let total = batch.progress().total;
    state.batches.insert(id, Arc::clone(&batch));

    tokio::spawn(async move {
        orchestrator.process(&batch).await;
    });

    info!(batch = id, rows = total, "bulk batch accepted");
    Ok(Json(BatchCreatedResponse { id, total }))
}

async fn get_batch(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<BatchStatusResponse>, AppError> {
    let batch = state
        .batches
        .get(&id)
        .map(|b| Arc::clone(b.value()))
        .ok_or_else(|| AppError::NotFound(format!("batch {id}")))?;

    let rows = batch
        .rows()
        .into_iter()
        .map(|row| BatchRowResponse {
            index: row.index,
            status: row.status,
            error: row.error,
            recommendation: row.report.map(|r| r.advice.recommendation),
        })
        .collect();

    Ok(Json(BatchStatusResponse {
        id,
        progress: batch.progress(),
        done: batch.is_done(),
        rows,
    }))
}

async fn get_batch_export(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state
        .batches
        .get(&id)
        .map(|b| Arc::clone(b.value()))
        .ok_or_else(|| AppError::NotFound(format!("batch {id}")))?;

    if !batch.is_done() {
        return Ok((
            StatusCode::CONFLICT,
            "batch is still processing".to_string(),
        )
            .into_response());
    }

    let bytes = export_batch(&batch.rows())?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"valuations.xlsx\"",
            ),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipeline::test_support::{
        eight_listing_reply, golf_attrs, golf_index, mock_services, MockIndex, MockRegistry,
    };

    /// State over mock services that know plate AB-123-C.
    pub async fn mock_state() -> ApiState {
        let services = mock_services(
            MockRegistry::with(vec![("AB-123-C", golf_attrs())]),
            MockIndex {
                result: Some(golf_index()),
                fail: false,
            },
            vec![eight_listing_reply(), "use the baseline".into()],
            true,
        )
        .await;
        let pool = crate::db::connect_memory().await.unwrap();
        ApiState::new(services, pool, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::mock_state;
    use super::*;

    #[tokio::test]
    async fn valuation_endpoint_runs_and_saves() {
        let state = mock_state().await;
        let Json(report) = post_valuation(
            State(state.clone()),
            Path("AB-123-C".into()),
            Query(ValuationQuery {
                mileage: Some(60_000),
                save: Some(true),
            }),
        )
        .await
        .unwrap();

        assert_eq!(report.advice.recommendation, Recommendation::Buy);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM advice")
            .fetch_one(&state.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn unknown_plate_is_not_found() {
        let state = mock_state().await;
        let result = post_valuation(
            State(state),
            Path("ZZ-999-Z".into()),
            Query(ValuationQuery {
                mileage: None,
                save: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_lifecycle_reaches_export() {
        let state = mock_state().await;
        let Json(created) = post_batch(
            State(state.clone()),
            Json(vec![
                "Toyota Yaris 2018 Hybride".to_string(),
                "  ".to_string(), // dropped
                "Ford Focus 2016 Diesel".to_string(),
            ]),
        )
        .await
        .unwrap();
        assert_eq!(created.total, 2);

        // processing runs in a spawned task; poll briefly
        let mut done = false;
        for _ in 0..100 {
            let Json(status) = get_batch(State(state.clone()), Path(created.id)).await.unwrap();
            if status.done {
                assert_eq!(status.progress.processed, 2);
                assert_eq!(status.rows.len(), 2);
                done = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(done, "batch never finished");

        let response = get_batch_export(State(state), Path(created.id)).await.unwrap();
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_batch_is_not_found() {
        let state = mock_state().await;
        assert!(matches!(
            get_batch(State(state.clone()), Path(42)).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            get_batch_export(State(state), Path(42)).await.map(|_| ()),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let state = mock_state().await;
        let result = post_batch(State(state), Json(vec!["  ".to_string()])).await;
        assert!(result.is_err());
    }
}
