use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;
use wdog::builder::{Link, Toolchain};
use wdog::config::{InstanceMode, Lang, WdogConfig};
use wdog::sandbox::Sandbox;
use wdog::server::{AppState, router};

const TOKEN: &str = "secret";

fn config(mode: InstanceMode) -> WdogConfig {
    WdogConfig {
        pod_ip: "127.0.0.1".to_owned(),
        port: 0,
        mode,
        fn_timeout: Duration::from_secs(5),
        runner: PathBuf::from(env!("CARGO_BIN_EXE_test_runner")),
    }
}

fn run_instance() -> AppState {
    let sandbox = Sandbox::start(config(InstanceMode::Run {
        token: TOKEN.to_owned(),
        lang: Lang::Python,
        cresponder: None,
    }))
    .unwrap();
    AppState::new(sandbox)
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, bytes) = send(app, Method::POST, uri, Body::from(body.to_string())).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn runner_state(state: &AppState) -> (Option<u32>, u64) {
    let runner = state.sandbox.runner().unwrap().lock().await;
    (runner.pid(), runner.generation())
}

#[tokio::test]
async fn ping_answers() {
    let (status, _) = send(router(run_instance()), Method::GET, "/v1/ping", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn run_returns_the_envelope() {
    let state = run_instance();
    let (status, body) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": TOKEN, "args": {"out": "hello\n", "err": "warn\n", "ret": "42"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Code"], 200);
    assert_eq!(body["Return"], "42");
    assert_eq!(body["Stdout"], "hello\n");
    assert_eq!(body["Stderr"], "warn\n");
}

#[tokio::test]
async fn bad_requests_leave_the_runner_alone() {
    let state = run_instance();
    let before = runner_state(&state).await;

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"args": {"mode": "exit"}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": "guess", "args": {"mode": "exit"}}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        router(state.clone()),
        Method::POST,
        "/v1/run",
        Body::from("{\"podtoken\": "),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(runner_state(&state).await, before);
}

#[tokio::test]
async fn concurrent_requests_see_only_their_own_output() {
    let app = router(run_instance());
    let requests: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let id = i.to_string();
                let (status, body) = post_json(
                    app,
                    "/v1/run",
                    json!({"podtoken": TOKEN, "args": {"mode": "marker", "id": &id, "ms": "20"}}),
                )
                .await;
                (id, status, body)
            })
        })
        .collect();

    for request in requests {
        let (id, status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Stdout"], format!("begin {id}\nend {id}\n"));
        assert_eq!(body["Return"], id);
    }
}

#[tokio::test]
async fn crash_is_an_envelope_not_an_http_error() {
    let state = run_instance();
    let (_, generation) = runner_state(&state).await;
    let (status, body) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": TOKEN, "args": {"mode": "exit"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Code"], 500);
    assert_eq!(body["Return"], "exited");
    assert_eq!(runner_state(&state).await.1, generation + 1);
}

#[tokio::test]
async fn try_runs_the_variant_on_its_own_runner() {
    let state = run_instance();
    let before = runner_state(&state).await;
    let (status, body) = post_json(
        router(state.clone()),
        "/v1/run/-v2",
        json!({"podtoken": TOKEN, "args": {"mode": "suffix"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Return"], "-v2");
    assert_eq!(runner_state(&state).await, before);
}

fn build_instance(dir: &std::path::Path) -> AppState {
    let work = dir.join("work");
    std::fs::create_dir_all(&work).unwrap();
    let toolchain = Toolchain {
        root: dir.join("functions"),
        program: "sh".to_owned(),
        args: vec!["script.sh".to_owned()],
        workdir: Some(work.clone()),
        link: Some(Link {
            from: "{root}/{sources}/script{suff}.sh".to_owned(),
            to: work.join("script.sh"),
        }),
        output: None,
        packages_env: None,
    };
    let sandbox = Sandbox::with_toolchain(
        config(InstanceMode::Build {
            instance: "build-1".to_owned(),
            token: TOKEN.to_owned(),
            lang: Lang::Golang,
        }),
        toolchain,
    )
    .unwrap();
    AppState::new(sandbox)
}

#[tokio::test]
async fn broken_source_reports_compiler_output() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("functions/fn1");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("script.sh"),
        "echo 'script.go:3: undefined: Main' >&2\nexit 2\n",
    )
    .unwrap();
    let state = build_instance(dir.path());

    let (status, body) = post_json(
        router(state.clone()),
        "/v1/build",
        json!({"podtoken": TOKEN, "args": {"sources": "fn1"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Code"], 2);
    assert!(body["Stderr"].as_str().unwrap().contains("undefined: Main"));
    assert!(body.get("Return").is_none());

    // The watchdog is still serving.
    let (status, _) = send(router(state), Method::GET, "/v1/ping", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn build_needs_sources() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_instance(dir.path());
    let (status, _) = post_json(
        router(state.clone()),
        "/v1/build",
        json!({"podtoken": TOKEN, "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        router(state),
        "/v1/build",
        json!({"podtoken": TOKEN, "args": {"sources": "../../etc"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn build_instance_has_no_run_route() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _) = post_json(
        router(build_instance(dir.path())),
        "/v1/run",
        json!({"podtoken": TOKEN, "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn proxy_instance(dir: &std::path::Path) -> AppState {
    let sandbox = Sandbox::start(config(InstanceMode::Proxy {
        cresponder: dir.to_path_buf(),
    }))
    .unwrap();
    AppState::new(sandbox)
}

#[tokio::test]
async fn proxy_rejects_requests_it_cannot_place() {
    let dir = tempfile::tempdir().unwrap();
    let state = proxy_instance(dir.path());

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podaddr": "10.0.0.7", "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": "", "podaddr": "10.0.0.7", "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": TOKEN, "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": TOKEN, "podaddr": "../..", "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(state.sandbox.cache().unwrap().is_empty());
}

#[tokio::test]
async fn proxy_without_owner_is_a_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let state = proxy_instance(dir.path());
    let (status, _) = post_json(
        router(state.clone()),
        "/v1/run",
        json!({"podtoken": TOKEN, "podaddr": "10.0.0.7", "args": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(state.sandbox.cache().unwrap().is_empty());
}
