use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::routes::ApiState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db: &'static str,
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let db = match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => "ok",
        Err(_) => "unavailable",
    };
    Json(HealthResponse { status: "ok", db })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support::mock_state;

    #[tokio::test]
    async fn health_reports_db_ok() {
        let state = mock_state().await;
        let Json(response) = health(State(state)).await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.db, "ok");
    }
}
