//! Request metrics, recorded into `AppState` for `/api/v1/metrics`.
//! Request logging itself is done by `tracing_actix_web::TracingLogger`.

use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

/// Use with `actix_web::middleware::from_fn(record_metrics)`.
///
/// Endpoints are keyed by route pattern (`GET /api/v1/config`) so that
/// arbitrary request paths cannot grow the table without bound.
pub async fn record_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let method = req.method().to_string();
    let state = req.app_data::<web::Data<AppState>>().cloned();

    let result = next.call(req).await;

    if let Some(state) = state {
        let duration_ms = start_time.elapsed().as_millis() as u64;
        let (pattern, is_error) = match &result {
            Ok(response) => (
                response
                    .request()
                    .match_pattern()
                    .unwrap_or_else(|| "unmatched".to_string()),
                response.status().is_client_error() || response.status().is_server_error(),
            ),
            Err(_) => ("unmatched".to_string(), true),
        };
        state.record_endpoint_request(&format!("{} {}", method, pattern), duration_ms, is_error);
    }

    result
}
