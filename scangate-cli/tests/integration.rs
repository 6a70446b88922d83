use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scangate() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_scangate"));
    cmd.env_remove("SCANGATE_CONFIG")
        .env_remove("SCANGATE_USERNAME")
        .env_remove("SCANGATE_PASSWORD")
        .env_remove("RUST_LOG");
    cmd
}

/// A workspace with a config pointing at `server` and a small source tree.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(server: &MockServer, vendor: &str, extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = format!(
            "vendor: {vendor}\n\
             username: svc-scanner\n\
             password: hunter2\n\
             tenant: acme\n\
             auth_url: {uri}/identity/connect/token\n\
             api_url: {uri}\n\
             web_url: https://portal.example.com\n\
             poll_interval_secs: 0\n\
             poll_max_attempts: 5\n\
             {extra}",
            uri = server.uri()
        );
        std::fs::write(dir.path().join("scangate.yaml"), config).unwrap();

        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("app.py"), "print('hello')\n").unwrap();
        std::fs::write(src.join("requirements.txt"), "flask==3.0.0\n").unwrap();
        Self { dir }
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("scangate.yaml")
    }

    fn source(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        scangate()
            .arg("--config")
            .arg(self.config())
            .args(args)
            .output()
            .expect("failed to execute")
    }

    fn scan(&self, extra: &[&str]) -> Output {
        let source = self.source();
        let mut args = vec!["scan", source.to_str().unwrap(), "payments"];
        args.extend_from_slice(extra);
        self.run(&args)
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/identity/connect/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
        .mount(server)
        .await;
}

async fn mount_sast_scan(server: &MockServer, high: u64) {
    mount_token(server).await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 12, "name": "payments"}])),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sast/scanWithSettings"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1001})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sast/scans/1001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": {"name": "Finished"},
            "dateAndTime": {"startedOn": "2024-05-01T08:30:00"}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sast/scans/1001/resultsStatistics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "highSeverity": high,
            "mediumSeverity": 3
        })))
        .mount(server)
        .await;
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[tokio::test]
async fn scan_under_threshold_passes() {
    let server = MockServer::start().await;
    mount_sast_scan(&server, 2).await;
    let ws = Workspace::new(&server, "sast", "");

    let output = ws.scan(&["--threshold", "5"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("payments (SAST)"));
    assert!(out.contains("verdict: pass"));
    assert!(out.contains("high: 2 (threshold 5)"));
    assert!(out.contains(
        "results: https://portal.example.com/CxWebClient/ViewerMain.aspx?scanid=1001&projectid=12"
    ));
}

#[tokio::test]
async fn scan_over_threshold_fails_with_exit_code_2() {
    let server = MockServer::start().await;
    mount_sast_scan(&server, 1).await;
    let ws = Workspace::new(&server, "sast", "high_threshold: 0\n");

    let output = ws.scan(&[]);

    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("verdict: fail"));
}

#[tokio::test]
async fn rejected_credentials_are_inconclusive() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/identity/connect/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sast", "");

    let output = ws.scan(&["--threshold", "0"]);

    assert_eq!(output.status.code(), Some(1));
    let out = stdout(&output);
    assert!(out.contains("verdict: inconclusive"));
    assert!(out.contains("authentication failed"));
}

#[tokio::test]
async fn negative_threshold_submits_without_waiting() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 12, "name": "payments"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sast/scanWithSettings"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1001})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sast/scans/1001"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": {"name": "Queued"}})),
        )
        .expect(0)
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sast", "");

    let output = ws.scan(&["--threshold", "-1"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("state: submitted"));
}

#[tokio::test]
async fn json_summary_is_machine_readable() {
    let server = MockServer::start().await;
    mount_sast_scan(&server, 0).await;
    let ws = Workspace::new(&server, "sast", "high_threshold: 0\n");

    let output = ws.scan(&["--json"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let summary: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(summary["verdict"], "pass");
    assert_eq!(summary["scan_id"], "1001");
    assert_eq!(summary["medium"], 3);
}

#[tokio::test]
async fn sca_scan_uploads_manifests_and_gates() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/risk-management/projects"))
        .and(query_param("name", "payments"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/risk-management/projects"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "p-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/uploads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("{}/blob/u-1", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/blob/u-1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/scans/uploaded-zip"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"scanId": "s-1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/scans/s-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Done"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/risk-management/risk-reports/s-1/export"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "RiskReportSummary": {
                "ProjectId": "p-1",
                "HighVulnerabilityCount": 4,
                "MediumVulnerabilityCount": 0
            }
        })))
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sca", "high_threshold: 3\n");

    let output = ws.scan(&[]);

    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("payments (SCA)"));
    assert!(out.contains("results: https://portal.example.com/#/projects/p-1"));
}

#[tokio::test]
async fn report_command_saves_latest_report() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 12, "name": "payments"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sast/scans"))
        .and(query_param("projectId", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 990, "dateAndTime": {"startedOn": "2024-05-01T08:30:00"}}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reports/sastScan"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"reportId": 4})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reports/sastScan/4/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": {"id": 2}})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reports/sastScan/4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<report/>".to_vec()))
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sast", "");
    let out_dir = ws.path().join("reports");

    let output = ws.run(&[
        "report",
        "payments",
        "--format",
        "xml",
        "--output-dir",
        out_dir.to_str().unwrap(),
        "--since",
        "2024-04-01",
    ]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let saved = out_dir.join("payments_SAST_report.xml");
    assert_eq!(std::fs::read(&saved).unwrap(), b"<report/>");
    assert!(stdout(&output).contains("payments_SAST_report.xml"));
}

#[tokio::test]
async fn report_outside_window_is_skipped() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 12, "name": "payments"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sast/scans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 990, "dateAndTime": {"startedOn": "2024-05-01T08:30:00"}}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reports/sastScan"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"reportId": 4})))
        .expect(0)
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sast", "");

    let output = ws.run(&["report", "payments", "--since", "2024-06-01"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("no scan of payments"));
}

async fn mount_sca_latest(server: &MockServer, project: &str, scan: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/risk-management/projects/{project}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": project, "latestScanId": scan})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/scans/{scan}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"scanId": scan, "createdOn": "2024-06-10T12:00:00Z"})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/risk-management/risk-reports/{scan}/export")))
        .and(query_param("format", "csv"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(format!("zip of {scan}").into_bytes()),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn report_without_project_covers_first_listed_projects() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/risk-management/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "p-1", "name": "web"},
            {"id": "p-2", "name": "mobile"},
            {"id": "p-3", "name": "legacy"}
        ])))
        .mount(&server)
        .await;
    mount_sca_latest(&server, "p-1", "s-1").await;
    mount_sca_latest(&server, "p-2", "s-2").await;
    Mock::given(method("GET"))
        .and(path("/risk-management/projects/p-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p-3"})))
        .expect(0)
        .mount(&server)
        .await;
    let ws = Workspace::new(&server, "sca", "");
    let out_dir = ws.path().join("reports");

    let output = ws.run(&[
        "report",
        "--max",
        "2",
        "--format",
        "csv",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(std::fs::read(out_dir.join("web_SCA_report.zip")).unwrap(), b"zip of s-1");
    assert_eq!(std::fs::read(out_dir.join("mobile_SCA_report.zip")).unwrap(), b"zip of s-2");
    assert!(!out_dir.join("legacy_SCA_report.zip").exists());
}

#[tokio::test]
async fn report_batch_reports_projects_without_scans() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/risk-management/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "p-1", "name": "web"},
            {"id": "p-2", "name": "fresh"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/risk-management/projects/p-2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "p-2", "latestScanId": null})),
        )
        .mount(&server)
        .await;
    mount_sca_latest(&server, "p-1", "s-1").await;
    let ws = Workspace::new(&server, "sca", "");
    let out_dir = ws.path().join("reports");

    let output = ws.run(&["report", "--format", "csv", "--output-dir", out_dir.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    assert!(out_dir.join("web_SCA_report.zip").exists());
    assert!(stderr(&output).contains("error: fresh: not found"));
}

#[tokio::test]
async fn password_can_come_from_environment() {
    let server = MockServer::start().await;
    mount_sast_scan(&server, 0).await;
    let ws = Workspace::new(&server, "sast", "");
    let config = ws.config();
    let text = std::fs::read_to_string(&config).unwrap().replace("password: hunter2\n", "");
    std::fs::write(&config, text).unwrap();

    let source = ws.source();
    let output = scangate()
        .env("SCANGATE_PASSWORD", "from-env")
        .arg("--config")
        .arg(&config)
        .args(["scan", source.to_str().unwrap(), "payments", "--threshold", "0"])
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
}

#[test]
fn missing_config_exits_with_error() {
    let output = scangate()
        .args(["--config", "/nonexistent/scangate.yaml", "report", "payments"])
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("failed to read configuration"));
}

#[test]
fn no_subcommand_exits_with_error() {
    let output = scangate().output().expect("failed to execute");
    assert!(!output.status.success());
}
