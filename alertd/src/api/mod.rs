//! HTTP ingest API.
//!
//! - `POST /alerts`: queue one alert (JSON object), answers `202 Accepted`
//! - `GET /health`: liveness plus per-channel queue state

pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Router, extract::Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::Result;
use crate::alerter::Alerter;

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub alerter: Arc<Alerter>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(alerter: Arc<Alerter>) -> Self {
        Self {
            alerter,
            start_time: Instant::now(),
        }
    }
}

/// Build the router with all middleware and routes.
pub fn build_router(state: AppState) -> Router {
    routes::create_router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if req.uri().path().starts_with("/health") {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            ),
    )
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("API server shutting down...");
        })
        .await?;

    Ok(())
}
