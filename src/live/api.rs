use crate::live::service::LiveValidator;
use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared state behind the validation API.
#[derive(Clone)]
pub struct ApiState {
    pub live: Arc<LiveValidator>,
    pub metrics: Metrics,
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    json_response(status, &serde_json::json!({"error": message}))
}

/// The live-validation read API. All GET endpoints serve snapshots of the
/// last stored value; `POST /validation/trigger` schedules an immediate
/// pass and returns right away.
pub fn handle_api(
    req: Request<Incoming>,
    state: ApiState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path();

    let response = match (req.method(), path) {
        (&Method::GET, "/health") => match state.live.health() {
            Some(health) => {
                let status = if health.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json_response(status, &health)
            }
            None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no health check yet"),
        },

        (&Method::GET, "/validation") => match state.live.last_validation() {
            Some(result) => json_response(StatusCode::OK, &result),
            None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no validation yet"),
        },

        (&Method::GET, "/validation/status") => {
            json_response(StatusCode::OK, &state.live.status_summary())
        }

        (&Method::GET, "/validation/history") => {
            json_response(StatusCode::OK, &state.live.history())
        }

        (&Method::POST, "/validation/trigger") => {
            state.live.trigger();
            json_response(
                StatusCode::ACCEPTED,
                &serde_json::json!({
                    "status": "triggered",
                    "message": "validation scheduled",
                }),
            )
        }

        (&Method::GET, "/clusters") => json_response(StatusCode::OK, &state.live.clusters_health()),

        (&Method::GET, _) if path.starts_with("/clusters/") => {
            let name = &path["/clusters/".len()..];
            match state.live.cluster_result(name) {
                Some(result) => json_response(StatusCode::OK, &result),
                None => error_response(StatusCode::NOT_FOUND, "unknown cluster"),
            }
        }

        (&Method::GET, "/metrics") => json_response(StatusCode::OK, &state.live.service_metrics()),

        (&Method::GET, "/metrics/prometheus") => {
            let body = state.metrics.render();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap()
        }

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
