mod common;

use std::error::Error;
use std::fs;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use watchrun::config::load_orchestrator_config;
use watchrun::orchestrator::{api, Orchestrator};

type TestResult = Result<(), Box<dyn Error>>;

/// Build an orchestrator over a temp workspace with one idle target.
fn fixture() -> Result<(tempfile::TempDir, Arc<Orchestrator>), Box<dyn Error>> {
    let dir = tempdir()?;
    fs::create_dir_all(dir.path().join("svc"))?;
    fs::write(
        dir.path().join("svc/run.yaml"),
        "watch: ['**/*.txt']\nbuild: ['true']\nexec: ['sleep 30']\n",
    )?;
    fs::write(
        dir.path().join("watchrun.yaml"),
        concat!(
            "api:\n",
            "  port: 9100\n",
            "logs_dir: logs\n",
            "targets:\n",
            "  svc:\n",
            "    config: svc/run.yaml\n",
            "    links:\n",
            "      - name: dashboard\n",
            "        url: http://localhost:3000\n",
        ),
    )?;

    let loaded = load_orchestrator_config(&dir.path().join("watchrun.yaml"))?;
    let orch = Arc::new(Orchestrator::new(loaded, CancellationToken::new())?);
    Ok((dir, orch))
}

async fn get(orch: Arc<Orchestrator>, path: &str) -> (StatusCode, serde_json::Value) {
    let router = api::routes(orch);
    let response = router
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post(orch: Arc<Orchestrator>, path: &str) -> (StatusCode, serde_json::Value) {
    let router = api::routes(orch);
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() -> TestResult {
    common::init_tracing();
    let (_dir, orch) = fixture()?;

    let (status, body) = get(orch, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn targets_list_carries_full_status_objects() -> TestResult {
    common::init_tracing();
    let (_dir, orch) = fixture()?;

    let (status, body) = get(orch, "/targets").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().expect("array of statuses");
    assert_eq!(list.len(), 1);

    let svc = &list[0];
    assert_eq!(svc["name"], "svc");
    assert_eq!(svc["state"], "idle");
    assert_eq!(svc["enabled"], true);
    assert_eq!(svc["build_count"], 0);
    assert_eq!(svc["restart_count"], 0);
    assert_eq!(svc["links"][0]["name"], "dashboard");
    assert_eq!(svc["links"][0]["resolved_url"], "http://localhost:3000");
    Ok(())
}

#[tokio::test]
async fn unknown_target_is_a_404_with_json_error() -> TestResult {
    common::init_tracing();
    let (_dir, orch) = fixture()?;

    let (status, body) = get(orch.clone(), "/targets/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    for action in ["build", "start", "stop", "restart", "enable", "disable"] {
        let (status, _) = post(orch.clone(), &format!("/targets/nope/{action}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "POST {action}");
    }
    Ok(())
}

#[tokio::test]
async fn control_posts_acknowledge_immediately() -> TestResult {
    common::init_tracing();
    let (_dir, orch) = fixture()?;

    let (status, body) = post(orch.clone(), "/targets/svc/build").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "building");

    let (status, body) = post(orch.clone(), "/targets/svc/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (status, body) = post(orch.clone(), "/targets/svc/restart").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "restarting");

    let (status, body) = post(orch.clone(), "/targets/svc/disable").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "disabled");
    assert_eq!(orch.target_status("svc")?.enabled, false);
    Ok(())
}

#[tokio::test]
async fn logs_endpoint_validates_stage_and_reads_ranges() -> TestResult {
    common::init_tracing();
    let (dir, orch) = fixture()?;

    let (status, body) = get(orch.clone(), "/targets/svc/logs?stage=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("stage"));

    // Seed the run log and read a line range.
    let log_path = dir.path().join("logs/svc.run.log");
    fs::create_dir_all(log_path.parent().unwrap())?;
    fs::write(&log_path, "l0\nl1\nl2\nl3\n")?;

    let (status, body) =
        get(orch.clone(), "/targets/svc/logs?stage=run&offset=1&limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalLines"], 4);
    assert_eq!(body["offset"], 1);
    assert_eq!(body["lines"][0], "l1");
    assert_eq!(body["lines"][1], "l2");

    // Legacy tail mode.
    let (status, body) = get(orch, "/targets/svc/logs?stage=run&lines=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lines"][0], "l2");
    assert_eq!(body["lines"][1], "l3");
    Ok(())
}
