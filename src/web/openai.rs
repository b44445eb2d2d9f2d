//! OpenAI-compatible chat completion endpoint

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use warp::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use warp::hyper::Body;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_state};
use crate::dispatch::Dispatched;
use crate::error::GatewayError;
use crate::plugin::CompletionRequest;
use crate::state::AppState;

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("chat" / "completions")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(chat_completion)
}

async fn chat_completion(body: Value, state: Arc<AppState>) -> Result<Response, Rejection> {
    let request = CompletionRequest::from_body(body)
        .map_err(|e| reject(GatewayError::InvalidRequest(e.to_string())))?;
    tracing::debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Chat completion request"
    );

    match state.dispatcher.dispatch(request).await.map_err(reject)? {
        Dispatched::Json(value) => Ok(warp::reply::json(&value).into_response()),
        Dispatched::Stream(frames) => {
            let frames = frames.inspect(|frame| {
                if let Err(e) = frame {
                    tracing::warn!(error = %e, "Completion stream aborted");
                }
            });
            let mut response = Response::new(Body::wrap_stream(frames));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            Ok(response)
        }
    }
}
