use std::time::Duration;

use cubeflow_infra::config::EngineConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(EngineConfig::default()).await
    }

    async fn spawn_with(config: EngineConfig) -> Self {
        let config = EngineConfig {
            poll_interval: Duration::from_millis(5),
            ..config
        };
        // Build app (same router as prod), but bind to an ephemeral port.
        let app = cubeflow_api::app::build_app(config).await.expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn job_spec(tiles: &[&str]) -> Value {
    json!({
        "cube": "S2_10_1M_MED",
        "tiles": tiles,
        "periods": ["2020-01-01_2020-01-31", "2020-02-01_2020-02-29"],
        "collections": ["S2_MSI"],
    })
}

async fn submit(client: &reqwest::Client, srv: &TestServer, spec: &Value) -> Value {
    let res = client.post(srv.url("/jobs")).json(spec).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    res.json().await.unwrap()
}

/// Background workers drive the job; poll until the stored status is final.
async fn wait_for_final_status(client: &reqwest::Client, srv: &TestServer, job_id: &str) -> Value {
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/jobs/{job_id}"))).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let report: Value = res.json().await.unwrap();
        if report["finalized"] == json!(true) {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {job_id} did not finish within timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_backend_and_workers() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
    assert_eq!(body["channel"], "queue");
    assert_eq!(body["workers"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn submitted_job_runs_to_done_and_publishes_metadata() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let submitted = submit(&client, &srv, &job_spec(&["001", "002"])).await;
    assert_eq!(submitted["created"], true);
    let job_id = submitted["jobId"].as_str().unwrap().to_string();

    let report = wait_for_final_status(&client, &srv, &job_id).await;
    assert_eq!(report["status"], "done");
    assert_eq!(report["unitsTotal"], 4);
    assert_eq!(report["unitsDone"], 4);
    assert_eq!(report["failures"].as_array().unwrap().len(), 0);

    let res = client.get(srv.url(&format!("/jobs/{job_id}/metadata"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let metadata: Value = res.json().await.unwrap();
    assert_eq!(metadata["slices"].as_array().unwrap().len(), 4);

    let res = client.get(srv.url(&format!("/jobs/{job_id}/units"))).send().await.unwrap();
    let units: Value = res.json().await.unwrap();
    assert!(units.as_array().unwrap().iter().all(|u| u["status"] == "done"));

    let res = client.get(srv.url("/jobs?status=done")).send().await.unwrap();
    let jobs: Value = res.json().await.unwrap();
    assert!(jobs.as_array().unwrap().iter().any(|j| j["jobId"] == job_id.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_submission_returns_same_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let first = submit(&client, &srv, &job_spec(&["003"])).await;
    let second = submit(&client, &srv, &job_spec(&["003"])).await;

    assert_eq!(first["created"], true);
    assert_eq!(second["created"], false);
    assert_eq!(first["jobId"], second["jobId"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_get_structured_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut spec = job_spec(&["001"]);
    spec["cube"] = json!("not-a-cube");
    let res = client.post(srv.url("/jobs")).json(&spec).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_spec");
    assert!(body["message"].as_str().is_some());

    let mut spec = job_spec(&["001"]);
    spec["collections"] = json!(["MODIS"]);
    let res = client.post(srv.url("/jobs")).json(&spec).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(srv.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let unknown = "0190f0a0-0000-7000-8000-000000000000";
    let res = client.get(srv.url(&format!("/jobs/{unknown}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url(&format!("/dead-letters/{unknown}/redrive")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url("/jobs?status=sideways")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn continuation_for_unknown_unit_is_skipped() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let body = json!({
        "messages": [{
            "jobId": "0190f0a0-0000-7000-8000-000000000001",
            "unitId": "0190f0a0-0000-7000-8000-000000000002",
            "tileId": "001",
            "periodId": "2020-01-01_2020-01-31",
            "attempt": 1,
        }]
    });
    let res = client.post(srv.url("/continuations")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["skipped"], 1);
    assert_eq!(report["completed"], 0);
    assert_eq!(report["outcomes"][0]["outcome"], "skipped");
    assert_eq!(report["outcomes"][0]["detail"], "unknown unit");

    let res = client
        .post(srv.url("/continuations"))
        .json(&json!({ "messages": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

async fn wait_for_dead_letters(client: &reqwest::Client, srv: &TestServer, job_id: &str, count: usize) -> Vec<Value> {
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/dead-letters?jobId={job_id}"))).send().await.unwrap();
        let entries: Vec<Value> = res.json().await.unwrap();
        if entries.len() >= count {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {job_id} never reached {count} dead letters");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_continuation_is_dead_lettered_once_per_attempt() {
    let srv = TestServer::spawn_with(EngineConfig {
        failing_tiles: vec!["009".parse().unwrap()],
        ..EngineConfig::default()
    })
    .await;
    let client = reqwest::Client::new();

    let submitted = submit(&client, &srv, &job_spec(&["009"])).await;
    let job_id = submitted["jobId"].as_str().unwrap().to_string();
    let report = wait_for_final_status(&client, &srv, &job_id).await;
    assert_eq!(report["status"], "failed");
    wait_for_dead_letters(&client, &srv, &job_id, 2).await;

    let res = client.get(srv.url(&format!("/jobs/{job_id}/units"))).send().await.unwrap();
    let units: Vec<Value> = res.json().await.unwrap();
    let messages: Vec<Value> = units
        .iter()
        .map(|u| {
            json!({
                "jobId": job_id,
                "unitId": u["unitId"],
                "tileId": u["tileId"],
                "periodId": u["periodId"],
                "attempt": u["attemptCount"],
            })
        })
        .collect();

    // A consumer re-running the failed attempts reports them failed again.
    let res = client
        .post(srv.url("/continuations"))
        .json(&json!({ "messages": messages }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let batch: Value = res.json().await.unwrap();
    assert_eq!(batch["failed"], 2);
    assert_eq!(batch["deadLettered"], 2);
    assert!(batch["outcomes"][0]["detail"].as_str().unwrap().contains("not processable"));

    // The re-sent records land on the existing ledger entries.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries = wait_for_dead_letters(&client, &srv, &job_id, 2).await;
    assert_eq!(entries.len(), 2);

    let res = client.get(srv.url(&format!("/jobs/{job_id}/metadata"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_letter_ledger_starts_empty() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/dead-letters")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let entries: Value = res.json().await.unwrap();
    assert!(entries.as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_and_resume_answer_for_existing_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let submitted = submit(&client, &srv, &job_spec(&["004", "005"])).await;
    let job_id = submitted["jobId"].as_str().unwrap().to_string();

    let res = client.post(srv.url(&format!("/jobs/{job_id}/cancel"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cancelled: Value = res.json().await.unwrap();
    // Workers may have finished some or all units first.
    let status = cancelled["status"].as_str().unwrap();
    assert!(["cancelled", "done", "running"].contains(&status), "unexpected status {status}");

    let report = wait_for_final_status(&client, &srv, &job_id).await;
    assert!(["cancelled", "done"].contains(&report["status"].as_str().unwrap()));

    let res = client.post(srv.url(&format!("/jobs/{job_id}/resume"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let resumed: Value = res.json().await.unwrap();
    assert_eq!(resumed["emitted"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_pushes_job_notification() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut res = client.get(srv.url("/stream")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let submitted = submit(&client, &srv, &job_spec(&["006"])).await;
    let job_id = submitted["jobId"].as_str().unwrap().to_string();

    let mut seen = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = res.chunk().await.unwrap() {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains(&job_id) {
                break;
            }
        }
    })
    .await;

    assert!(read.is_ok(), "no notification received");
    assert!(seen.contains("event: job.finalized"));
    assert!(seen.contains("\"status\":\"done\""));
}
