//! Request dispatcher
//!
//! Resolves the requested model through the registry and runs the owning
//! plugin's `pipe` entry point in the worker pool. Streaming completions are
//! pulled inside the same pool slot and handed to the HTTP layer through a
//! bounded channel.

pub mod pool;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info_span, warn};

use crate::error::{GatewayError, Result};
use crate::plugin::schema::{CompletionRequest, PipeCall, PluginError};
use crate::registry::Registry;
use crate::state::metrics::{DispatchTimer, Metrics};
use crate::stream::{Normalized, Normalizer};

pub use pool::WorkerPool;

pub type FrameStream = BoxStream<'static, std::result::Result<Bytes, PluginError>>;

/// What the HTTP layer sends back
pub enum Dispatched {
    Json(Value),
    Stream(FrameStream),
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatched::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Dispatched::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// First signal from the worker: either the whole answer or "frames follow"
enum Ready {
    Json(Value),
    Streaming,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    call_timeout: Option<Duration>,
    stream_buffer: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
        call_timeout: Option<Duration>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            registry,
            pool,
            metrics,
            call_timeout,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn dispatch(&self, request: CompletionRequest) -> Result<Dispatched> {
        let descriptor = self
            .registry
            .resolve(&request.model)
            .filter(|descriptor| descriptor.is_completion())
            .ok_or_else(|| GatewayError::NotFound(request.model.clone()))?;

        let cancel = CancellationToken::new();
        let module = descriptor.module.clone();
        let stream = request.stream;
        let normalizer = Normalizer::new(request.model.clone());
        let call = PipeCall {
            user_message: request.last_user_message().unwrap_or_default(),
            model_id: descriptor.model_id().to_string(),
            messages: request.messages,
            body: request.body,
            valves: module.valves.current(),
            cancel: cancel.clone(),
        };

        let span = info_span!(
            "pipeline_dispatch",
            model = %request.model,
            module = %module.id,
            stream,
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = mpsc::channel(self.stream_buffer);
        let worker_cancel = cancel.clone();

        let job = move || {
            let _entered = span.enter();
            let normalized = module
                .pipeline()
                .pipe(call)
                .and_then(|outcome| normalizer.normalize(outcome, stream));

            let frames = match normalized {
                Ok(Normalized::Json(value)) => {
                    let _ = ready_tx.send(Ok(Ready::Json(value)));
                    return;
                }
                Ok(Normalized::Events(frames)) => frames,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if ready_tx.send(Ok(Ready::Streaming)).is_err() {
                worker_cancel.cancel();
                return;
            }
            for frame in frames {
                let failed = frame.is_err();
                if frame_tx.blocking_send(frame).is_err() {
                    debug!("Client went away, cancelling plugin stream");
                    worker_cancel.cancel();
                    return;
                }
                if failed {
                    return;
                }
            }
        };

        let timer = DispatchTimer::new(self.metrics.clone());
        let waiting = async {
            self.pool.spawn(job).await?;
            ready_rx
                .await
                .map_err(|_| PluginError::runtime("Plugin task ended without a result"))?
                .map_err(GatewayError::from)
        };

        let ready = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(ready) => ready,
                Err(_) => {
                    cancel.cancel();
                    self.metrics.record_dispatch_timeout();
                    warn!(model = %request.model, timeout_ms = limit.as_millis() as u64, "Plugin call timed out");
                    Err(timeout_error(limit))
                }
            },
            None => waiting.await,
        };

        match ready {
            Ok(Ready::Json(value)) => {
                timer.finish();
                Ok(Dispatched::Json(value))
            }
            Ok(Ready::Streaming) => {
                timer.finish();
                Ok(Dispatched::Stream(frame_stream(
                    frame_rx,
                    cancel,
                    self.call_timeout,
                    self.metrics.clone(),
                )))
            }
            Err(e) => {
                timer.fail();
                Err(e)
            }
        }
    }
}

fn timeout_error(limit: Duration) -> GatewayError {
    GatewayError::Plugin(PluginError::Timeout {
        timeout_ms: limit.as_millis() as u64,
    })
}

/// Receiving side of a streamed completion. Dropping it cancels the call.
struct FrameSource {
    frames: mpsc::Receiver<std::result::Result<Bytes, PluginError>>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    gap_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
    finished: bool,
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.metrics.stream_finished();
    }
}

fn frame_stream(
    frames: mpsc::Receiver<std::result::Result<Bytes, PluginError>>,
    cancel: CancellationToken,
    gap_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
) -> FrameStream {
    metrics.stream_started();
    let source = FrameSource {
        frames,
        _cancel_on_drop: cancel.clone().drop_guard(),
        cancel,
        gap_timeout,
        metrics,
        finished: false,
    };

    stream::unfold(source, |mut source| async move {
        if source.finished {
            return None;
        }

        let next = match source.gap_timeout {
            Some(limit) => match tokio::time::timeout(limit, source.frames.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    source.cancel.cancel();
                    source.metrics.record_dispatch_timeout();
                    source.finished = true;
                    warn!(timeout_ms = limit.as_millis() as u64, "Plugin stream stalled");
                    return Some((
                        Err(PluginError::Timeout {
                            timeout_ms: limit.as_millis() as u64,
                        }),
                        source,
                    ));
                }
            },
            None => source.frames.recv().await,
        };

        match next {
            Some(Ok(frame)) => Some((Ok(frame), source)),
            Some(Err(e)) => {
                source.finished = true;
                Some((Err(e), source))
            }
            None => None,
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::schema::SubModel;
    use crate::test_utils::{module_from, Reply, ScriptedFilter, ScriptedManifold, ScriptedPipe};
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn dispatcher(registry: Arc<Registry>, timeout: Option<Duration>) -> Dispatcher {
        Dispatcher::new(
            registry,
            Arc::new(WorkerPool::new(4)),
            Arc::new(Metrics::new()),
            timeout,
            8,
        )
    }

    fn request(model: &str, stream: bool) -> CompletionRequest {
        CompletionRequest::from_body(json!({
            "model": model,
            "stream": stream,
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        }))
        .unwrap()
    }

    async fn collect(stream: FrameStream) -> String {
        let frames: Vec<Bytes> = stream.try_collect().await.unwrap();
        frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_and_filter_ids_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(dir.path(), "guard", ScriptedFilter::new(&["*"], 0)))
            .unwrap();
        let dispatcher = dispatcher(registry, None);

        let err = dispatcher.dispatch(request("missing", false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));

        let err = dispatcher.dispatch(request("guard", false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_manifold_receives_submodel_id() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(
                dir.path(),
                "multi",
                ScriptedManifold::new(vec![SubModel::new("a", "A")]),
            ))
            .unwrap();

        let Dispatched::Json(value) = dispatcher(registry, None)
            .dispatch(request("multi.a", false))
            .await
            .unwrap()
        else {
            panic!("expected JSON");
        };
        assert_eq!(value["choices"][0]["message"]["content"], "a:second");
        assert_eq!(value["model"], "multi.a");
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(dir.path(), "echo", ScriptedPipe::fragments(&["he", "llo"])))
            .unwrap();

        let Dispatched::Stream(stream) = dispatcher(registry, None)
            .dispatch(request("echo", true))
            .await
            .unwrap()
        else {
            panic!("expected stream");
        };
        let body = collect(stream).await;
        assert!(body.contains(r#""content":"he""#));
        assert!(body.contains(r#""content":"llo""#));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_plugin_error_surfaces_message() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(dir.path(), "bad", ScriptedPipe::fail("upstream down")))
            .unwrap();

        let err = dispatcher(registry, None)
            .dispatch(request("bad", false))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "upstream down");
        assert_eq!(err.status_code(), warp::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_hung_plugin_times_out_and_is_cancelled() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(
                dir.path(),
                "slow",
                ScriptedPipe::new(Reply::Hang(Duration::from_secs(5))),
            ))
            .unwrap();

        let pool = Arc::new(WorkerPool::new(1));
        let dispatcher = Dispatcher::new(
            registry,
            pool.clone(),
            Arc::new(Metrics::new()),
            Some(Duration::from_millis(50)),
            8,
        );
        let err = dispatcher.dispatch(request("slow", false)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Plugin(PluginError::Timeout { timeout_ms: 50 })
        ));

        // the cancelled plugin gives its slot back
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.available() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(
                dir.path(),
                "slow",
                ScriptedPipe::new(Reply::SlowFragments(
                    vec!["a".into(), "b".into()],
                    Duration::from_millis(200),
                )),
            ))
            .unwrap();

        // the first fragment arrives before the outcome is ready, so only the
        // gap between fragments is bounded here
        let result = dispatcher(registry, Some(Duration::from_millis(100)))
            .dispatch(request("slow", true))
            .await;
        match result {
            Ok(Dispatched::Stream(stream)) => {
                let collected: std::result::Result<Vec<Bytes>, PluginError> =
                    stream.try_collect().await;
                assert!(matches!(collected, Err(PluginError::Timeout { .. })));
            }
            Err(GatewayError::Plugin(PluginError::Timeout { .. })) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_mid_stream() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .insert(module_from(
                dir.path(),
                "flaky",
                ScriptedPipe::new(Reply::BreakOff(vec!["a".into()], "lost upstream".into())),
            ))
            .unwrap();

        let Dispatched::Stream(mut stream) = dispatcher(registry, None)
            .dispatch(request("flaky", true))
            .await
            .unwrap()
        else {
            panic!("expected stream");
        };
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "lost upstream");
        assert!(stream.next().await.is_none());
    }
}
