use bytes::Buf;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_state};
use crate::error::GatewayError;
use crate::plugin::PipelineKind;
use crate::state::AppState;

/// Largest accepted plugin upload
const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct AddPipelineRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePipelineRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub body: Value,
    #[serde(default)]
    pub user: Option<Value>,
}

/// Management, valves, filter and catalog routes. `auth` guards the
/// mutating ones.
pub fn routes<A>(
    state: Arc<AppState>,
    auth: A,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
    A: Filter<Extract = (), Error = Rejection> + Clone + Send + Sync + 'static,
{
    status_routes(state.clone())
        .or(pipelines_routes(state.clone(), auth.clone()))
        .or(valves_routes(state.clone(), auth))
        .or(filter_routes(state))
}

fn status_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let root = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "status": true })));

    let health = warp::path!("health").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "status": "healthy",
            "service": "pipeline-gateway"
        }))
    });

    let models = warp::path!("models")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_models);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics);

    root.or(health).or(models).or(metrics)
}

fn pipelines_routes<A>(
    state: Arc<AppState>,
    auth: A,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
    A: Filter<Extract = (), Error = Rejection> + Clone + Send + Sync + 'static,
{
    let list = warp::path!("pipelines")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_pipelines);

    let add = warp::path!("pipelines" / "add")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(add_pipeline);

    let upload = warp::path!("pipelines" / "upload")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and(with_state(state.clone()))
        .and_then(upload_pipeline);

    let delete = warp::path!("pipelines" / "delete")
        .and(warp::delete())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(delete_pipeline);

    let reload = warp::path!("pipelines" / "reload")
        .and(warp::post())
        .and(auth)
        .and(with_state(state))
        .and_then(reload_pipelines);

    list.or(add).or(upload).or(delete).or(reload)
}

fn valves_routes<A>(
    state: Arc<AppState>,
    auth: A,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
    A: Filter<Extract = (), Error = Rejection> + Clone + Send + Sync + 'static,
{
    let get = warp::path!(String / "valves")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_valves);

    let spec = warp::path!(String / "valves" / "spec")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_valves_spec);

    let update = warp::path!(String / "valves" / "update")
        .and(warp::post())
        .and(auth)
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(update_valves);

    get.or(spec).or(update)
}

fn filter_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let inlet = warp::path!(String / "filter" / "inlet")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(filter_inlet);

    let outlet = warp::path!(String / "filter" / "outlet")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(filter_outlet);

    inlet.or(outlet)
}

async fn list_models(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .snapshot()
        .iter()
        .map(|descriptor| {
            let has_valves = !descriptor.valves().schema().is_empty();
            let pipeline = match &descriptor.filter {
                Some(filter) => json!({
                    "type": PipelineKind::Filter,
                    "pipelines": filter.pipelines,
                    "priority": filter.priority,
                    "valves": has_valves,
                }),
                None => json!({
                    "type": descriptor.kind,
                    "valves": has_valves,
                }),
            };
            json!({
                "id": descriptor.id,
                "name": descriptor.name,
                "object": "model",
                "created": created,
                "owned_by": "pipeline-gateway",
                "pipeline": pipeline,
            })
        })
        .collect();

    Ok(warp::reply::json(&json!({
        "data": data,
        "object": "list",
        "pipelines": true,
    })))
}

async fn list_pipelines(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let data: Vec<Value> = state
        .registry
        .snapshot()
        .iter()
        .map(|descriptor| {
            json!({
                "id": descriptor.id,
                "name": descriptor.name,
                "type": descriptor.kind,
                "module": descriptor.module_id(),
                "file": descriptor.module.file_name(),
                "valves": !descriptor.valves().schema().is_empty(),
            })
        })
        .collect();

    Ok(warp::reply::json(&json!({
        "data": data,
        "failed": state.manager.quarantined(),
    })))
}

async fn get_metrics(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::with_header(
        state.metrics.render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

async fn add_pipeline(
    request: AddPipelineRequest,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let file = state
        .manager
        .install_from_url(&request.url)
        .await
        .map_err(reject)?;

    Ok(warp::reply::json(&json!({
        "status": true,
        "detail": format!("Pipeline added successfully from {}", request.url),
        "file": file,
    })))
}

async fn upload_pipeline(form: FormData, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let mut form = form;
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| reject(GatewayError::InvalidRequest(e.to_string())))?
    {
        if part.name() != "file" {
            continue;
        }
        let file_name = part
            .filename()
            .map(str::to_string)
            .ok_or_else(|| reject(GatewayError::InvalidRequest("Upload has no file name".into())))?;
        let content = part
            .stream()
            .try_fold(Vec::new(), |mut content, chunk| async move {
                content.extend_from_slice(chunk.chunk());
                Ok(content)
            })
            .await
            .map_err(|e| reject(GatewayError::InvalidRequest(e.to_string())))?;

        let file = state
            .manager
            .install_file(&file_name, &content)
            .await
            .map_err(reject)?;

        return Ok(warp::reply::json(&json!({
            "status": true,
            "detail": format!("Pipeline uploaded successfully to {file}"),
            "file": file,
        })));
    }

    Err(reject(GatewayError::InvalidRequest(
        "Multipart field 'file' is missing".into(),
    )))
}

async fn delete_pipeline(
    request: DeletePipelineRequest,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    state.manager.delete(&request.id).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "status": true,
        "detail": format!("Pipeline {} deleted successfully", request.id),
    })))
}

async fn reload_pipelines(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let report = state.manager.reload().await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "status": true,
        "detail": "Pipelines reloaded successfully",
        "loaded": report.loaded,
        "failed": report.quarantined,
    })))
}

async fn get_valves(id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let valves = state.manager.valves(&id).map_err(reject)?;
    Ok(warp::reply::json(valves.as_ref()))
}

async fn get_valves_spec(id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let spec = state.manager.valves_spec(&id).map_err(reject)?;
    Ok(warp::reply::json(&spec))
}

async fn update_valves(
    id: String,
    record: Value,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let valves = state
        .manager
        .update_valves(&id, &record)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(valves.as_ref()))
}

async fn filter_inlet(
    id: String,
    request: FilterRequest,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let body = state
        .filters
        .apply_inlet(&id, request.body, request.user)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&body))
}

async fn filter_outlet(
    id: String,
    request: FilterRequest,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let body = state
        .filters
        .apply_outlet(&id, request.body, request.user)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&body))
}
