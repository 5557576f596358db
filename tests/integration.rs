use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use jtest::{
    JTestSuite, ReqwestTransport, Runtime, Step, SuiteResult, SuiteRunner, TestRunner,
    VariableContext,
};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(
                "/orders",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({"id": "abc", "qty": body["qty"]}))
                }),
            )
            .route(
                "/orders/:id",
                get(|UrlPath(id): UrlPath<String>| async move {
                    if id == "missing" {
                        (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
                    } else {
                        (StatusCode::OK, Json(json!({"id": id, "status": "open"})))
                    }
                }),
            )
            .route(
                "/search",
                get(|Query(params): Query<Vec<(String, String)>>| async move {
                    let tags: Vec<&str> = params
                        .iter()
                        .filter(|(k, _)| k == "tag")
                        .map(|(_, v)| v.as_str())
                        .collect();
                    Json(json!({"tags": tags, "count": tags.len()}))
                }),
            )
            .route(
                "/status",
                get(move || {
                    let polls = Arc::clone(&polls);
                    async move {
                        let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(json!({"ready": n >= 3, "polls": n}))
                    }
                }),
            )
            .route("/text", get(|| async move { "Hello runner world" }));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn transport() -> Arc<ReqwestTransport> {
    Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap())
}

fn runner(base_url: &str) -> SuiteRunner {
    let mut env = Map::new();
    env.insert("baseUrl".into(), Value::String(base_url.to_string()));
    SuiteRunner::new(transport()).with_env_defaults(env)
}

fn write_json(dir: &Path, name: &str, doc: &Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
    path
}

async fn run_suite(base_url: &str, doc: Value) -> SuiteResult {
    let suite = JTestSuite::from_json(&doc.to_string()).expect("suite should parse");
    runner(base_url)
        .run(&suite, Path::new("."))
        .await
        .expect("suite should run")
}

#[tokio::test]
async fn http_step_saves_response_values() {
    let server = TestServer::spawn().await;
    let step: Step = serde_json::from_value(json!({
        "type": "http",
        "method": "POST",
        "url": "{{$.env.baseUrl}}/orders",
        "body": {"qty": 2},
        "save": {"orderId": "{{$.this.body.id}}"},
        "assert": [{"type": "equals", "actualValue": "{{$.this.status}}", "expectedValue": 200}]
    }))
    .unwrap();

    let rt = Runtime::new(transport());
    let mut ctx =
        VariableContext::with_env(Arc::new(json!({"baseUrl": server.base_url.clone()})));
    let result = step.execute(&rt, &mut ctx).await.unwrap();

    assert!(result.success, "step should pass: {:?}", result.error);
    assert_eq!(ctx.root("ctx").unwrap()["orderId"], json!("abc"));
    assert_eq!(ctx.root("this").unwrap()["body"]["qty"], json!(2));
    assert_eq!(
        ctx.root("this").unwrap()["headers"]["content-type"],
        json!("application/json")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn suite_carries_saved_values_between_steps() {
    let server = TestServer::spawn().await;
    let result = run_suite(
        &server.base_url,
        json!({
            "info": {"name": "orders"},
            "tests": [{
                "name": "create and fetch",
                "steps": [
                    {
                        "type": "http",
                        "name": "create",
                        "method": "POST",
                        "url": "{{$.env.baseUrl}}/orders",
                        "body": {"qty": 1},
                        "save": {"orderId": "{{$.this.body.id}}"},
                        "assert": [{"type": "equals", "actualValue": "{{$.this.status}}", "expectedValue": 200}]
                    },
                    {
                        "type": "http",
                        "name": "fetch",
                        "url": "{{$.env.baseUrl}}/orders/{{$.ctx.orderId}}",
                        "assert": [
                            {"type": "equals", "actualValue": "{{$.this.body.id}}", "expectedValue": "abc"},
                            {"type": "in", "actualValue": ["open", "closed"], "expectedValue": "{{$.this.body.status}}"}
                        ]
                    }
                ]
            }]
        }),
    )
    .await;

    assert!(result.success, "suite should pass: {result:#?}");
    let case = &result.cases[0];
    assert_eq!(case.steps.len(), 2);
    assert_eq!(case.steps[0].changes.added, vec!["$.ctx.orderId"]);
    assert_eq!(case.steps[1].assertions[0].actual, json!("abc"));

    server.shutdown().await;
}

#[tokio::test]
async fn datasets_drive_requests_in_isolation() {
    let server = TestServer::spawn().await;
    let result = run_suite(
        &server.base_url,
        json!({
            "tests": [{
                "name": "fetch order",
                "steps": [
                    {
                        "type": "assert",
                        "assert": [{"type": "notexists", "actualValue": "{{$.ctx.lastStatus}}"}]
                    },
                    {
                        "type": "http",
                        "url": "{{$.env.baseUrl}}/orders/{{$.case.id}}",
                        "save": {
                            "lastStatus": "{{$.this.status}}",
                            "$.globals.fetched[{{$.case.slot}}]": "{{$.case.id}}"
                        },
                        "assert": [
                            {"type": "equals", "actualValue": "{{$.this.status}}", "expectedValue": "{{$.case.status}}"}
                        ]
                    }
                ],
                "datasets": [
                    {"name": "existing", "case": {"id": "o-1", "status": 200, "slot": 0}},
                    {"name": "missing", "case": {"id": "missing", "status": 404, "slot": 1}}
                ]
            }, {
                "name": "globals survive",
                "steps": [{
                    "type": "assert",
                    "assert": [{"type": "length", "actualValue": "{{$.globals.fetched}}", "expectedValue": 2}]
                }]
            }]
        }),
    )
    .await;

    assert!(result.success, "suite should pass: {result:#?}");
    assert_eq!(result.cases.len(), 3);
    assert_eq!(result.cases[0].dataset.as_deref(), Some("existing"));
    assert_eq!(result.cases[1].dataset.as_deref(), Some("missing"));

    server.shutdown().await;
}

#[tokio::test]
async fn query_arrays_and_text_bodies() {
    let server = TestServer::spawn().await;
    let result = run_suite(
        &server.base_url,
        json!({
            "tests": [{
                "name": "query",
                "steps": [
                    {
                        "type": "http",
                        "url": "{{$.env.baseUrl}}/search",
                        "query": {"tag": ["a", "b", "c"]},
                        "assert": [
                            {"type": "equals", "actualValue": "{{$.this.body.count}}", "expectedValue": 3},
                            {"type": "contains", "actualValue": "{{$.this.body.tags}}", "expectedValue": "B"}
                        ]
                    },
                    {
                        "type": "http",
                        "url": "{{$.env.baseUrl}}/text",
                        "assert": [
                            {"type": "type", "actualValue": "{{$.this.body}}", "expectedValue": "string"},
                            {"type": "startswith", "actualValue": "{{$.this.body}}", "expectedValue": "hello"}
                        ]
                    }
                ]
            }]
        }),
    )
    .await;

    assert!(result.success, "suite should pass: {result:#?}");
    server.shutdown().await;
}

#[tokio::test]
async fn template_defaults_and_outputs() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    write_json(
        dir.path(),
        "templates.json",
        &json!({
            "version": "1.0",
            "components": {"templates": [
                {
                    "name": "pause",
                    "params": {"waitTime": {"type": "number", "required": false, "default": 10}},
                    "steps": [{"type": "wait", "ms": "{{$.ctx.waitTime}}"}],
                    "output": {"waited": "{{$.ctx.waitTime}}"}
                },
                {
                    "name": "createOrder",
                    "params": {"qty": {"type": "integer", "required": true}},
                    "steps": [{
                        "type": "http",
                        "method": "POST",
                        "url": "{{$.env.baseUrl}}/orders",
                        "body": {"qty": "{{$.ctx.qty}}"},
                        "save": {"created": "{{$.this.body}}"}
                    }],
                    "output": {"order": "{{$.ctx.created}}"}
                }
            ]}
        }),
    );
    let suite = write_json(
        dir.path(),
        "suite.json",
        &json!({
            "using": ["templates.json"],
            "tests": [{
                "name": "templates",
                "steps": [
                    {"type": "use", "template": "pause", "with": {}},
                    {
                        "type": "use",
                        "template": "createOrder",
                        "with": {"qty": "5"},
                        "assert": [
                            {"type": "equals", "actualValue": "{{$.ctx.order.id}}", "expectedValue": "abc"},
                            {"type": "equals", "actualValue": "{{$.this.order.qty}}", "expectedValue": 5}
                        ]
                    },
                    {
                        "type": "assert",
                        "assert": [
                            {"type": "equals", "actualValue": "{{$.ctx.waited}}", "expectedValue": 10},
                            {"type": "notexists", "actualValue": "{{$.ctx.created}}"}
                        ]
                    }
                ]
            }]
        }),
    );

    let result = runner(&server.base_url).run_file(&suite).await;
    assert!(result.success, "suite should pass: {result:#?}");

    let pause = &result.cases[0].steps[0];
    assert_eq!(pause.inner[0].details, Some(json!({"ms": 10})));

    server.shutdown().await;
}

#[tokio::test]
async fn while_polls_until_ready_and_times_out() {
    let server = TestServer::spawn().await;
    let result = run_suite(
        &server.base_url,
        json!({
            "tests": [
                {
                    "name": "poll",
                    "steps": [{
                        "type": "while",
                        "condition": {"type": "notequals", "actualValue": "{{$.this.body.ready}}", "expectedValue": true},
                        "timeoutMs": 5000,
                        "steps": [{"type": "http", "url": "{{$.env.baseUrl}}/status"}],
                        "assert": [{"type": "greaterorequal", "actualValue": "{{$.this.body.polls}}", "expectedValue": 3}]
                    }]
                },
                {
                    "name": "never ready",
                    "steps": [
                        {
                            "type": "while",
                            "condition": {"type": "exists", "actualValue": "always"},
                            "timeoutMs": 50,
                            "steps": [{"type": "wait", "ms": 5}]
                        },
                        {"type": "wait", "ms": 0}
                    ]
                }
            ]
        }),
    )
    .await;

    assert!(!result.success);
    assert!(result.cases[0].success, "polling should pass: {:#?}", result.cases[0]);
    let timed_out = &result.cases[1];
    assert!(!timed_out.success);
    assert!(timed_out.error.is_none(), "timeout is a failure, not a fault");
    assert_eq!(timed_out.steps.len(), 2);
    assert!(timed_out.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("condition still true"));

    server.shutdown().await;
}

#[tokio::test]
async fn between_assertions() {
    let result = run_suite(
        "http://unused",
        json!({
            "tests": [
                {"name": "in range", "steps": [{
                    "type": "assert",
                    "assert": [{"type": "between", "actualValue": 5, "expectedValue": [1, 10]}]
                }]},
                {"name": "bad range", "steps": [{
                    "type": "assert",
                    "assert": [{"type": "between", "actualValue": 5, "expectedValue": [1, "x"]}]
                }]}
            ]
        }),
    )
    .await;

    assert!(result.cases[0].success);
    let failed = &result.cases[1].steps[0].assertions[0];
    assert!(!failed.success);
    assert!(failed.message.as_deref().unwrap().contains("requires [min,max]"));
}

#[tokio::test]
async fn faults_skip_rest_of_case_but_not_suite() {
    let server = TestServer::spawn().await;
    let result = run_suite(
        &server.base_url,
        json!({
            "tests": [
                {"name": "broken", "steps": [
                    {"type": "use", "template": "doesNotExist"},
                    {"type": "wait", "ms": 0}
                ]},
                {"name": "healthy", "steps": [{"type": "http", "url": "{{$.env.baseUrl}}/text"}]}
            ]
        }),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.cases[0].skipped, 1);
    assert!(result.cases[0]
        .error
        .as_deref()
        .unwrap()
        .contains("template 'doesNotExist' not found"));
    assert!(result.cases[1].success);

    server.shutdown().await;
}

#[tokio::test]
async fn run_files_in_parallel() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for i in 0..4 {
        paths.push(write_json(
            dir.path(),
            &format!("suite{i}.json"),
            &json!({
                "info": {"name": format!("suite {i}")},
                "tests": [{"name": "ping", "steps": [{
                    "type": "http",
                    "url": "{{$.env.baseUrl}}/orders/o-{{$.env.index}}",
                    "assert": [{"type": "endswith", "actualValue": "{{$.this.body.id}}", "expectedValue": format!("-{i}")}]
                }]}],
                "env": {"index": i}
            }),
        ));
    }
    paths.push(dir.path().join("absent.json"));

    let results = Arc::new(runner(&server.base_url)).run_files(paths, 2).await;
    assert_eq!(results.len(), 5);
    assert_eq!(results.iter().filter(|r| r.success).count(), 4);
    let missing = results.iter().find(|r| !r.success).unwrap();
    assert!(missing.error.as_deref().unwrap().contains("absent.json"));

    server.shutdown().await;
}
