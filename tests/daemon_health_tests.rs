//! Integration tests for timelinesd health endpoints, readiness/liveness, safe startup checks,
//! and graceful shutdown.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

const HEALTH_PORT: u16 = 19599;
const STARTUP_WAIT_MS: u64 = 800;
const SHUTDOWN_WAIT_MS: u64 = 5000;

/// Run timelinesd in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_timelinesd(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_timelinesd");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run timelinesd");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

/// Start timelinesd in the background; returns the child process. Caller must kill it.
fn start_timelinesd_background(args: &[&str], env_extra: &[(&str, &str)]) -> Child {
    let exe = env!("CARGO_BIN_EXE_timelinesd");
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .envs(env_extra.iter().copied())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn().expect("spawn timelinesd")
}

/// GET /path on host:port, return (status_line, body).
fn http_get(host: &str, port: u16, path: &str) -> Option<(String, String)> {
    let mut stream = TcpStream::connect((host, port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok()?;
    stream
        .write_all(format!("GET {} HTTP/1.0\r\nHost: {}\r\n\r\n", path, host).as_bytes())
        .ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok()?;
    let s = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = s.lines();
    let status = lines.next()?.to_string();
    let body = lines
        .skip_while(|l| !l.is_empty())
        .skip(1)
        .collect::<Vec<_>>()
        .join("\n");
    Some((status, body))
}

fn start_on_port(data_dir: &std::path::Path, port: u16) -> Child {
    let bind = format!("127.0.0.1:{}", port);
    start_timelinesd_background(
        &[
            "--no-config",
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--http-bind",
            &bind,
        ],
        &[],
    )
}

/// Sends SIGTERM (kill elsewhere) and waits up to `SHUTDOWN_WAIT_MS`. Returns (exit code, stderr).
fn terminate(mut child: Child) -> (Option<i32>, String) {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }
    #[cfg(not(unix))]
    let _ = child.kill();

    let pid = child.id();
    let stderr_handle = child.stderr.take();
    let (tx, rx) = std::sync::mpsc::channel();
    let _ = thread::spawn(move || {
        let code = child.wait().ok().and_then(|s| s.code());
        let mut s = String::new();
        if let Some(mut h) = stderr_handle {
            let _ = h.read_to_string(&mut s);
        }
        let _ = tx.send((code, s));
    });
    rx.recv_timeout(Duration::from_millis(SHUTDOWN_WAIT_MS))
        .unwrap_or_else(|_| {
            #[cfg(unix)]
            let _ = Command::new("kill").args(["-9", &pid.to_string()]).status();
            #[cfg(not(unix))]
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .status();
            rx.recv().unwrap_or((None, String::new()))
        })
}

// ---------- Safe startup ----------

#[test]
fn test_data_dir_that_is_a_file_fails_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let not_a_dir = dir.path().join("plain_file");
    std::fs::write(&not_a_dir, b"x").expect("write file");
    let (ok, _stdout, stderr) = run_timelinesd(
        &[
            "--no-config",
            "--data-dir",
            not_a_dir.to_str().unwrap(),
            "--http-bind",
            &format!("127.0.0.1:{}", HEALTH_PORT + 20),
        ],
        &[],
    );
    assert!(!ok, "startup must fail when data_dir is not a directory");
    assert!(
        stderr.contains("cannot be created") || stderr.contains("not writable"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_invalid_http_bind_fails_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ok, _stdout, stderr) = run_timelinesd(
        &[
            "--no-config",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--http-bind",
            "999.0.0.1:80",
        ],
        &[],
    );
    assert!(!ok);
    assert!(
        stderr.contains("http_bind") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

// ---------- Endpoints ----------

#[test]
fn test_healthz_returns_200_when_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = start_on_port(&dir.path().join("data"), HEALTH_PORT);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let result = http_get("127.0.0.1", HEALTH_PORT, "/healthz");
    let _ = child.kill();
    let _ = child.wait();
    let (status, body) = result.expect("could not connect to health endpoint");
    assert!(status.contains("200"), "expected 200 OK, got: {}", status);
    assert_eq!(body.trim(), "ok");
}

#[test]
fn test_readyz_returns_200_after_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = start_on_port(&dir.path().join("data"), HEALTH_PORT + 1);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let result = http_get("127.0.0.1", HEALTH_PORT + 1, "/readyz");
    let _ = child.kill();
    let _ = child.wait();
    let (status, _) = result.expect("could not connect to readyz");
    assert!(status.contains("200"), "expected 200 OK, got: {}", status);
}

#[test]
fn test_stats_lists_counters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = start_on_port(&dir.path().join("data"), HEALTH_PORT + 2);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let result = http_get("127.0.0.1", HEALTH_PORT + 2, "/stats");
    let _ = child.kill();
    let _ = child.wait();
    let (status, body) = result.expect("could not connect to stats");
    assert!(status.contains("200"), "got: {}", status);
    assert!(body.contains("ready true"), "body: {}", body);
    assert!(body.contains("events_handled 0"), "body: {}", body);
    assert!(body.contains("writer_last_error none"), "body: {}", body);
    assert!(body.contains("aggregation_passes "), "body: {}", body);
}

#[test]
fn test_unknown_path_returns_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = start_on_port(&dir.path().join("data"), HEALTH_PORT + 3);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let result = http_get("127.0.0.1", HEALTH_PORT + 3, "/nonexistent");
    let _ = child.kill();
    let _ = child.wait();
    let (status, _) = result.expect("could not connect");
    assert!(status.contains("404"), "expected 404, got: {}", status);
}

// ---------- Graceful shutdown ----------

#[test]
fn test_graceful_shutdown_logs_completion_and_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let child = start_on_port(&dir.path().join("data"), HEALTH_PORT + 4);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let _ = http_get("127.0.0.1", HEALTH_PORT + 4, "/healthz");

    let (exit_code, stderr) = terminate(child);
    assert!(
        stderr.contains("shutdown complete") || stderr.contains("shutting down"),
        "stderr should mention shutdown: {}",
        stderr
    );
    #[cfg(unix)]
    if let Some(code) = exit_code {
        assert_eq!(code, 0, "graceful SIGTERM should exit 0; stderr: {}", stderr);
    }
}

/// After a graceful SIGTERM a second start on the same data_dir must replay and become ready.
#[test]
fn test_graceful_shutdown_then_restart_is_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().join("data");

    let child = start_on_port(&data_dir, HEALTH_PORT + 10);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let (status1, _) =
        http_get("127.0.0.1", HEALTH_PORT + 10, "/readyz").expect("first run: readyz reachable");
    assert!(status1.contains("200"), "first run: {}", status1);
    let _ = terminate(child);

    assert!(data_dir.join("blog").is_dir(), "backing log dir should exist");
    assert!(data_dir.join("catalog").is_dir(), "catalog dir should exist");

    // Different port so the first process has certainly released its socket.
    let mut child2 = start_on_port(&data_dir, HEALTH_PORT + 11);
    thread::sleep(Duration::from_millis(STARTUP_WAIT_MS));
    let second = http_get("127.0.0.1", HEALTH_PORT + 11, "/readyz");
    let _ = child2.kill();
    let _ = child2.wait();
    let (status2, _) = second.expect("second run must be reachable");
    assert!(status2.contains("200"), "second run: {}", status2);
}
