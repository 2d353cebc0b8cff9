/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::openapp::logger::{log_error, log_info};
use crate::openapp::observability::health::{liveness_report, HealthRegistry};
use crate::openapp::observability::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::error::Error;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "observability";

/// Builds the router serving `/metrics`, `/healthz`, `/readyz` and `/livez`.
pub fn router(health: HealthRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(readiness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/livez", get(liveness_handler))
        .with_state(health)
}

async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            let error_text = err.to_string();
            log_error(
                COMPONENT,
                "Failed to encode metrics",
                &[("error", error_text.as_str())],
            );
            (StatusCode::INTERNAL_SERVER_ERROR, error_text).into_response()
        }
    }
}

async fn readiness_handler(State(health): State<HealthRegistry>) -> Response {
    let report = health.readiness_report();
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn liveness_handler() -> Response {
    (StatusCode::OK, Json(liveness_report())).into_response()
}

/// Serves the observability endpoints until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    health: HealthRegistry,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bind = addr.to_string();
    log_info(
        COMPONENT,
        "Serving metrics and health endpoints",
        &[("addr", bind.as_str())],
    );
    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
