use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::{ConfigError, GatewayError, Result};
use crate::state::AppState;

pub mod api;
pub mod openai;

#[cfg(test)]
mod api_tests;

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_address();
    tracing::info!("Starting pipeline gateway on {}", addr);

    let addr: std::net::SocketAddr = addr.parse().map_err(|e| {
        GatewayError::Config(ConfigError::Parse(format!("Invalid bind address: {}", e)))
    })?;

    let routes = create_routes(state.clone());

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.recv().await;
        })
        .map_err(|e| {
            GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                e.to_string(),
            ))
        })?;

    tracing::info!("Listening on http://{}", bound);
    server.await;

    tracing::info!("Pipeline gateway stopped");
    Ok(())
}

/// Every route, mounted both at the root and under `/v1`
pub fn create_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let auth = api_key_auth(state.config.auth.api_key.clone());

    let api = api::routes(state.clone(), auth)
        .or(openai::routes(state))
        .boxed();

    warp::path("v1")
        .and(api.clone())
        .or(api)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT", "DELETE"])
                .allow_headers(vec!["Content-Type", "Authorization"]),
        )
        .with(warp::trace::request())
        .recover(handle_rejection)
}

/// Bearer-token check. Without a configured key every request passes.
fn api_key_auth(api_key: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |auth_header: Option<String>| {
            let api_key = api_key.clone();
            async move {
                let Some(api_key) = api_key else {
                    return Ok(());
                };
                match auth_header {
                    Some(header) if header == format!("Bearer {}", api_key) => Ok(()),
                    _ => Err(warp::reject::custom(GatewayError::Unauthorized)),
                }
            }
        })
        .untuple_one()
}

pub(crate) fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub(crate) fn reject(err: impl Into<GatewayError>) -> Rejection {
    warp::reject::custom(err.into())
}

/// Turn every rejection into a `{"detail": ...}` body
async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (status, detail) = if let Some(e) = err.find::<GatewayError>() {
        let status = e.status_code();
        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        }
        (status, e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else {
        tracing::warn!(rejection = ?err, "Unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "detail": detail })),
        status,
    ))
}
