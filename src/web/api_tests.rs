use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use warp::http::StatusCode;
use warp::test::request;

use super::create_routes;
use crate::config::{Config, PluginsConfig};
use crate::plugin::NativeCatalog;
use crate::state::AppState;

async fn setup(api_key: Option<&str>) -> (TempDir, Arc<AppState>) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("echo.toml"), "factory = \"echo\"\n").unwrap();
    std::fs::write(dir.path().join("multi.toml"), "factory = \"multi_echo\"\n").unwrap();
    std::fs::write(dir.path().join("limit.toml"), "factory = \"turn_limit\"\n").unwrap();

    let mut config = Config {
        plugins: PluginsConfig::with_dir(dir.path()),
        ..Config::default()
    };
    config.plugins.worker_pool_size = 4;
    config.auth.api_key = api_key.map(str::to_string);

    let (state, _shutdown_rx) = AppState::with_catalog(config, NativeCatalog::with_builtins());
    state.manager.discover_plugins().await.unwrap();
    (dir, state)
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_status_and_health() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request().method("GET").path("/").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body()), json!({ "status": true }));

    let resp = request().method("GET").path("/v1/health").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body())["status"], "healthy");
}

#[tokio::test]
async fn test_models_lists_pipes_submodels_and_filters() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request().method("GET").path("/models").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp.body());
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|model| model["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["echo", "limit", "multi.alpha", "multi.beta"]);

    let limit = &body["data"][1];
    assert_eq!(limit["pipeline"]["type"], "filter");
    assert_eq!(limit["pipeline"]["pipelines"], json!(["*"]));
    assert_eq!(limit["pipeline"]["priority"], 0);
    assert_eq!(body["data"][2]["name"], "Multi Echo: alpha");
}

#[tokio::test]
async fn test_chat_completion_json() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/v1/chat/completions")
        .json(&json!({
            "model": "echo",
            "messages": [{"role": "user", "content": "x"}]
        }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp.body());
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "echo");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "x");
}

#[tokio::test]
async fn test_chat_completion_stream() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({
            "model": "echo",
            "stream": true,
            "messages": [{"role": "user", "content": "hello world"}]
        }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let text = String::from_utf8(resp.body().to_vec()).unwrap();
    let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 4);
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    let contents: Vec<Value> = frames[..2]
        .iter()
        .map(|frame| {
            let chunk: Value = serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap();
            chunk["choices"][0]["delta"]["content"].clone()
        })
        .collect();
    assert_eq!(contents, vec![json!("hello "), json!("world")]);

    let finish: Value = serde_json::from_str(frames[2].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_chat_completion_errors() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({ "model": "missing", "messages": [] }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(json_body(resp.body())["detail"]
        .as_str()
        .unwrap()
        .contains("missing"));

    // filters are not completion targets
    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({ "model": "limit", "messages": [] }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({ "messages": [] }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_valves_round_trip() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request().method("GET").path("/echo/valves").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body())["prefix"], "");

    let resp = request()
        .method("GET")
        .path("/echo/valves/spec")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body())["title"], "EchoValves");

    let resp = request()
        .method("POST")
        .path("/echo/valves/update")
        .json(&json!({ "prefix": "> " }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body())["prefix"], "> ");

    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({
            "model": "echo",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .reply(&routes)
        .await;
    assert_eq!(json_body(resp.body())["choices"][0]["message"]["content"], "> hi");

    let resp = request()
        .method("POST")
        .path("/echo/valves/update")
        .json(&json!({ "prefix": 3 }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = request().method("GET").path("/nope/valves").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifold_submodels_follow_valves() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/multi.alpha/valves/update")
        .json(&json!({ "models": ["gamma"] }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = request().method("GET").path("/models").reply(&routes).await;
    let body = json_body(resp.body());
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|model| model["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["echo", "limit", "multi.gamma"]);
}

#[tokio::test]
async fn test_filter_inlet_and_outlet() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let body = json!({ "model": "echo", "messages": [{"role": "user", "content": "hi"}] });
    let resp = request()
        .method("POST")
        .path("/limit/filter/inlet")
        .json(&json!({ "body": body, "user": {"role": "user"} }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body()), body);

    // turn_limit has no outlet, the body passes through
    let resp = request()
        .method("POST")
        .path("/limit/filter/outlet")
        .json(&json!({ "body": body }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body()), body);

    let long: Vec<Value> = (0..9)
        .map(|_| json!({"role": "user", "content": "again"}))
        .collect();
    let resp = request()
        .method("POST")
        .path("/limit/filter/inlet")
        .json(&json!({ "body": { "messages": long } }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(resp.body())["detail"]
        .as_str()
        .unwrap()
        .contains("Conversation turn limit exceeded"));

    let resp = request()
        .method("POST")
        .path("/ghost/filter/inlet")
        .json(&json!({ "body": {} }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pipelines_listing_and_delete() {
    let (dir, state) = setup(None).await;
    std::fs::write(dir.path().join("broken.toml"), "factory = \"nope\"\n").unwrap();
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/pipelines/reload")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = request().method("GET").path("/pipelines").reply(&routes).await;
    let body = json_body(resp.body());
    assert_eq!(body["data"].as_array().unwrap().len(), 4);
    assert_eq!(body["failed"][0]["file"], "broken.toml");
    assert!(!dir.path().join("broken.toml").exists());

    let resp = request()
        .method("DELETE")
        .path("/pipelines/delete")
        .json(&json!({ "id": "echo" }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!dir.path().join("echo.toml").exists());

    let resp = request()
        .method("DELETE")
        .path("/pipelines/delete")
        .json(&json!({ "id": "echo" }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_pipeline() {
    let (dir, state) = setup(None).await;
    let routes = create_routes(state);

    let boundary = "gateway-boundary";
    let payload = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"second.toml\"\r\n\
         Content-Type: application/toml\r\n\r\n\
         factory = \"echo\"\n\r\n\
         --{boundary}--\r\n"
    );
    let resp = request()
        .method("POST")
        .path("/pipelines/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(payload)
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.body())["file"], "second.toml");
    assert!(dir.path().join("second.toml").exists());

    let resp = request()
        .method("POST")
        .path("/chat/completions")
        .json(&json!({
            "model": "second",
            "messages": [{"role": "user", "content": "up"}]
        }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_api_key_guards_mutating_routes() {
    let (_dir, state) = setup(Some("secret")).await;
    let routes = create_routes(state);

    let resp = request()
        .method("POST")
        .path("/pipelines/reload")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp.body())["detail"], "Unauthorized");

    let resp = request()
        .method("POST")
        .path("/echo/valves/update")
        .header("authorization", "Bearer wrong")
        .json(&json!({ "prefix": "x" }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = request()
        .method("POST")
        .path("/pipelines/reload")
        .header("authorization", "Bearer secret")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // reads stay open
    let resp = request().method("GET").path("/models").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_and_unknown_route() {
    let (_dir, state) = setup(None).await;
    let routes = create_routes(state);

    let resp = request().method("GET").path("/metrics").reply(&routes).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(resp.body().to_vec()).unwrap();
    assert!(text.contains("pipeline_gateway_loaded_modules"));

    let resp = request()
        .method("GET")
        .path("/a/b/c/d")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp.body())["detail"], "Not Found");
}
