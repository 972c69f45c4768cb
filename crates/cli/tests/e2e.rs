//! End-to-end functional tests for the testloom CLI.
//!
//! These tests invoke the `testloom` binary as a subprocess against a mock
//! OpenAI-compatible chat-completions server, exercising the full chain:
//!   CLI binary → config loading → catalog → client → provider (mock) →
//!   generation → shell build → refinement → history.jsonl on disk
//!
//! No real API keys are needed.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Mock chat-completions server
// ---------------------------------------------------------------------------

const DRAFT: &str = "```cpp\n#include <gtest/gtest.h>\n\nTEST(Draft, Compiles) {\n  EXPECT_EQ(1, 1);\n}\n```";
const FIXED: &str = "```cpp\n#include <gtest/gtest.h>\n\nTEST(Fixed, Compiles) {\n  EXPECT_TRUE(true);\n}\n```";

/// Start a mock server that handles any number of requests.
///
/// Refinement requests (their prompt mentions a failed build) get `FIXED`;
/// everything else gets `DRAFT`.
async fn start_mock_openai() -> (tokio::task::JoinHandle<()>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let body = read_request(&mut stream).await;
                let content = if body.contains("failed to build") {
                    FIXED
                } else {
                    DRAFT
                };

                let api_body = serde_json::json!({
                    "id": "chatcmpl-e2e",
                    "model": "mock/e2e-model",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": content},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 120, "completion_tokens": 40, "total_tokens": 160}
                })
                .to_string();

                let resp = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\
                     \r\n\
                     {}",
                    api_body.len(),
                    api_body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (handle, port)
}

/// Read the full HTTP request from the stream (headers + body), return the body.
async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::with_capacity(65536);
    let mut tmp = [0u8; 16384];

    loop {
        let n = stream.read(&mut tmp).await.unwrap_or(0);
        if n == 0 {
            return String::new();
        }
        buf.extend_from_slice(&tmp[..n]);

        if let Some(header_end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            let content_length = headers
                .lines()
                .find(|l| l.to_lowercase().starts_with("content-length:"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            let body_start = header_end + 4;
            let body_received = buf.len().saturating_sub(body_start);
            let remaining = content_length.saturating_sub(body_received);

            if remaining > 0 {
                let mut body_buf = vec![0u8; remaining];
                let mut read = 0;
                while read < remaining {
                    let n = stream.read(&mut body_buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                buf.extend_from_slice(&body_buf[..read]);
            }
            return String::from_utf8_lossy(&buf[body_start..]).to_string();
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn testloom_bin() -> String {
    env!("CARGO_BIN_EXE_testloom").to_string()
}

/// A small C++ project: two units, one without a header.
fn init_project(dir: &Path) {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("Auth.h"), "class Auth { public: bool login(); };\n").unwrap();
    std::fs::write(src.join("Auth.cc"), "#include \"Auth.h\"\nbool Auth::login() { return true; }\n").unwrap();
    std::fs::write(src.join("Jobs.cc"), "int jobs() { return 3; }\n").unwrap();
}

/// Base command with the test's environment and none of the caller's.
fn testloom(port: Option<u16>) -> Command {
    let mut cmd = Command::new(testloom_bin());
    for var in [
        "OPENROUTER_API_KEY",
        "TESTLOOM_MODEL",
        "TESTLOOM_ENDPOINT",
        "TESTLOOM_SOURCE_DIR",
        "TESTLOOM_OUTPUT_DIR",
        "TESTLOOM_BUILD_COMMAND",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    if let Some(port) = port {
        cmd.env("OPENROUTER_API_KEY", "test-key-e2e")
            .env(
                "TESTLOOM_ENDPOINT",
                format!("http://127.0.0.1:{port}/v1/chat/completions"),
            )
            .env("TESTLOOM_MODEL", "mock/e2e-model")
            .env("TESTLOOM_SOURCE_DIR", "src");
    }
    cmd
}

fn history_entries(dir: &Path) -> Vec<serde_json::Value> {
    let history_file = dir.join(".testloom/logs/history.jsonl");
    assert!(history_file.exists(), "history.jsonl should exist after a run");
    std::fs::read_to_string(&history_file)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Clean first build: one artifact per unit, fences stripped, history written.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_run_generates_and_records_history() {
    let (server_handle, port) = start_mock_openai().await;
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    let output = testloom(Some(port))
        .args([
            "run",
            "--project",
            dir.path().to_str().unwrap(),
            "--build-command",
            "echo build ok",
        ])
        .output()
        .await
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "testloom run failed (exit {:?}):\n{stderr}",
        output.status.code()
    );
    assert!(stderr.contains("Run Result"), "should print run result:\n{stderr}");

    for name in ["Auth", "Jobs"] {
        let path = dir.path().join(format!("test/{name}_test.cc"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#include <gtest/gtest.h>"), "{content}");
        assert!(!content.contains("```"), "fences not stripped: {content}");
    }

    let entries = history_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["status"], "done");
    assert_eq!(entries[0]["build_invocations"], 1);
    assert_eq!(entries[0]["refinement_passes"], 0);
    assert_eq!(entries[0]["artifacts"], 2);

    // `testloom history` shows the recorded run.
    let hist = testloom(None)
        .args(["history", "--project", dir.path().to_str().unwrap(), "--count", "1"])
        .output()
        .await
        .unwrap();
    assert!(hist.status.success());
    let hist_stdout = String::from_utf8_lossy(&hist.stdout);
    assert!(hist_stdout.contains("done"), "history output: {hist_stdout}");

    server_handle.abort();
}

/// First build reports a diagnostic, refinement fixes every artifact, the
/// second build is clean.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_refines_until_clean() {
    let (server_handle, port) = start_mock_openai().await;
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    let build = "if grep -q Draft test/*_test.cc; then echo 'test/Auth_test.cc:3:1: error: boom'; else echo linked; fi";
    let output = testloom(Some(port))
        .args([
            "run",
            "--project",
            dir.path().to_str().unwrap(),
            "--build-command",
            build,
        ])
        .output()
        .await
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "run failed:\n{stderr}");

    for name in ["Auth", "Jobs"] {
        let content =
            std::fs::read_to_string(dir.path().join(format!("test/{name}_test.cc"))).unwrap();
        assert!(content.contains("TEST(Fixed, Compiles)"), "{content}");
    }

    let entries = history_entries(dir.path());
    assert_eq!(entries[0]["status"], "done");
    assert_eq!(entries[0]["build_invocations"], 2);
    assert_eq!(entries[0]["refinement_passes"], 1);

    server_handle.abort();
}

/// A build that never comes clean exhausts the budget and exits non-zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_budget_exhausted_exits_nonzero() {
    let (server_handle, port) = start_mock_openai().await;
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    let output = testloom(Some(port))
        .args([
            "run",
            "--project",
            dir.path().to_str().unwrap(),
            "--build-command",
            "echo 'main.cc:1:1: error: always broken'",
            "--max-passes",
            "2",
        ])
        .output()
        .await
        .unwrap();

    assert!(!output.status.success(), "expected failure, got success");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("budget_exhausted"), "stderr:\n{stderr}");

    let entries = history_entries(dir.path());
    assert_eq!(entries[0]["status"], "budget_exhausted");
    assert_eq!(entries[0]["build_invocations"], 3);
    assert_eq!(entries[0]["refinement_passes"], 2);

    server_handle.abort();
}

/// Missing credential fails before any request or file write.
#[tokio::test]
async fn cli_missing_credential_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    let output = testloom(None)
        .args([
            "run",
            "--project",
            dir.path().to_str().unwrap(),
            "--model",
            "m",
            "--build-command",
            "true",
        ])
        .env("TESTLOOM_SOURCE_DIR", "src")
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("OPENROUTER_API_KEY"), "stderr:\n{stderr}");
    assert!(!dir.path().join("test").exists());
}

/// Dry run lists units and their artifact paths without contacting a server.
#[tokio::test]
async fn cli_dry_run_lists_units() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    let output = testloom(None)
        .args(["run", "--project", dir.path().to_str().unwrap(), "--dry-run"])
        .env("TESTLOOM_SOURCE_DIR", "src")
        .output()
        .await
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "dry run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("units:  2"), "stdout:\n{stdout}");
    assert!(stdout.contains("Auth_test.cc"));
    assert!(stdout.contains("Jobs_test.cc"));
    assert!(!dir.path().join("test").exists());
}

/// `init` writes a template once and refuses to overwrite it.
#[tokio::test]
async fn cli_init_refuses_overwrite() {
    let dir = tempfile::tempdir().unwrap();

    let first = testloom(None)
        .args(["init", dir.path().to_str().unwrap()])
        .output()
        .await
        .unwrap();
    assert!(first.status.success());
    assert!(dir.path().join(".testloom/config.yaml").exists());

    let second = testloom(None)
        .args(["init", dir.path().to_str().unwrap()])
        .output()
        .await
        .unwrap();
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("already exists"));
}

/// Test the version subcommand.
#[tokio::test]
async fn cli_version_command() {
    let output = testloom(None).args(["version"]).output().await.unwrap();

    assert!(
        output.status.success(),
        "version command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let expected = format!("testloom {} (", env!("CARGO_PKG_VERSION"));
    assert!(
        stdout.trim().starts_with(&expected),
        "expected '{expected}...', got: '{}'",
        stdout.trim()
    );
}
