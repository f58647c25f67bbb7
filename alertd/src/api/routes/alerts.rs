//! Alert ingest route.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};
use serde::Serialize;
use serde_json::Value;

use crate::alert::Alert;
use crate::api::AppState;
use crate::api::error::ApiResult;

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    /// Number of recipients the alert was queued for.
    pub recipients: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(post_alert))
}

/// Accept one alert. Delivery happens asynchronously.
async fn post_alert(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let Json(body) = body?;
    let alert = Alert::from_value(body)?;
    let recipients = state.alerter.deliver(alert).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            recipients,
        }),
    ))
}
