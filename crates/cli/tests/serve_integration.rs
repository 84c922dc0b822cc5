//! Integration tests for the `nextmove serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port,
//! makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Atomic port counter to avoid port conflicts between parallel tests.
/// The base port is derived from the process ID so separate test binaries
/// don't collide on the same range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Kills the server when the test ends, pass or fail.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// Start `nextmove serve` on the given port with extra environment.
fn start_server(port: u16, env: &[(&str, &str)]) -> Server {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nextmove"));
    cmd.args(["--quiet", "serve", "--port", &port.to_string()]);
    cmd.env_remove("NEXTMOVE_API_KEY");
    cmd.env_remove("NEXTMOVE_RATE_LIMIT");
    cmd.env_remove("RUST_LOG");
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd.spawn().expect("failed to start nextmove serve");
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server(child)
}

/// Send one request and return (status, headers, body).
fn request(
    port: u16,
    method: &str,
    path: &str,
    body: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> (u16, String, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n",
        method, path, port
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        head.push_str("Content-Type: application/json\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    std::io::Write::write_all(&mut stream, head.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

fn get(port: u16, path: &str) -> (u16, serde_json::Value) {
    let (status, _, body) = request(port, "GET", path, None, &[]);
    (status, parse_json(&body))
}

fn post(port: u16, path: &str, body: &str) -> (u16, serde_json::Value) {
    let (status, _, body) = request(port, "POST", path, Some(body), &[]);
    (status, parse_json(&body))
}

fn put(port: u16, path: &str, body: &str) -> (u16, serde_json::Value) {
    let (status, _, body) = request(port, "PUT", path, Some(body), &[]);
    (status, parse_json(&body))
}

fn parse_json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or(serde_json::Value::Null)
}

/// Parse an HTTP response into (status_code, headers_string, body).
fn parse_http_response(response: &str) -> (u16, String, String) {
    let (headers, body) = response.split_once("\r\n\r\n").unwrap_or((response, ""));
    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let body = if headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked")
    {
        decode_chunked(body)
    } else {
        body.to_string()
    };
    (status, headers.to_string(), body)
}

fn decode_chunked(mut data: &str) -> String {
    let mut result = String::new();
    while let Some(line_end) = data.find("\r\n") {
        let size = match usize::from_str_radix(data[..line_end].trim(), 16) {
            Ok(0) | Err(_) => break,
            Ok(size) => size,
        };
        let start = line_end + 2;
        let end = (start + size).min(data.len());
        result.push_str(&data[start..end]);
        data = data.get(end + 2..).unwrap_or("");
    }
    result
}

/// Register a merchant with a plan, credits, readiness and one opportunity.
fn seed_merchant(port: u16, merchant: &str, plan: &str, credits: u32, risk: &str) {
    let (status, _) = put(
        port,
        &format!("/merchants/{}/plan", merchant),
        &format!(r#"{{"plan": "{}"}}"#, plan),
    );
    assert_eq!(status, 200);
    let (status, _) = post(
        port,
        &format!("/merchants/{}/credits", merchant),
        &format!(r#"{{"monthly_limit": {}}}"#, credits),
    );
    assert_eq!(status, 201);
    let (status, _) = put(
        port,
        &format!("/merchants/{}/readiness", merchant),
        r#"{"readiness": "ready"}"#,
    );
    assert_eq!(status, 200);
    let feed = format!(
        r#"[{{
            "id": "opp-seo-42",
            "action_type": "seo_rewrite",
            "target": "product-42",
            "rationale": "Title misses the highest-volume search term",
            "expected_monthly_revenue": "900.00",
            "confidence": 78,
            "risk": "{}",
            "credit_cost": 15,
            "rank": 1,
            "created_at": "2026-10-01T08:00:00Z",
            "payload": {{"title": "Organic Cotton Crew Tee"}}
        }}]"#,
        risk
    );
    let (status, body) = put(port, &format!("/merchants/{}/opportunities", merchant), &feed);
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["opportunities"], 1);
}

// ──────────────────────────────────────────────
// Basics
// ──────────────────────────────────────────────

#[test]
fn health_returns_200_with_version() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (status, json) = get(port, "/health");
    assert_eq!(status, 200);
    assert_eq!(json["status"], "ok");
    assert!(json.get("version").is_some(), "version field must be present");
}

#[test]
fn unknown_route_returns_json_404() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (status, json) = get(port, "/does-not-exist");
    assert_eq!(status, 404);
    assert_eq!(json["error"], "not found");
}

#[test]
fn unknown_merchant_returns_404() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (status, json) = get(port, "/merchants/ghost/next-move");
    assert_eq!(status, 404);
    assert_eq!(json["error"], "unknown merchant: ghost");
}

#[test]
fn unknown_next_move_returns_404() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (status, _) = post(port, "/next-moves/nm-missing/approve", "");
    assert_eq!(status, 404);
}

// ──────────────────────────────────────────────
// Next-move lifecycle
// ──────────────────────────────────────────────

#[test]
fn store_not_ready_is_reported_instead_of_a_move() {
    let port = next_port();
    let _server = start_server(port, &[]);
    seed_merchant(port, "m1", "pro", 100, "low");
    put(port, "/merchants/m1/readiness", r#"{"readiness": "warming_up"}"#);

    let (status, json) = get(port, "/merchants/m1/next-move");
    assert_eq!(status, 200);
    assert_eq!(json["kind"], "store_not_ready");
    assert_eq!(json["readiness"], "warming_up");
}

#[test]
fn execute_then_rollback_over_http() {
    let port = next_port();
    let _server = start_server(port, &[]);
    seed_merchant(port, "m1", "pro", 100, "low");

    let (status, view) = get(port, "/merchants/m1/next-move");
    assert_eq!(status, 200);
    assert_eq!(view["kind"], "active");
    let next_move = &view["next_move"];
    assert_eq!(next_move["status"], "ready");
    let ratio: f64 = next_move["credit_value_ratio"]
        .as_str()
        .and_then(|r| r.parse().ok())
        .expect("decimal ratio");
    assert_eq!(ratio, 60.0);
    let id = next_move["id"].as_str().expect("next move id").to_string();

    let (status, executed) = post(port, &format!("/next-moves/{}/execute", id), "");
    assert_eq!(status, 200, "{}", executed);
    assert_eq!(executed["status"], "monitoring");
    assert_eq!(executed["rollback_available"], true);

    let (_, credits) = get(port, "/merchants/m1/credits");
    assert_eq!(credits["remaining"], 85);

    let (status, outcome) = post(port, &format!("/next-moves/{}/rollback", id), "");
    assert_eq!(status, 200);
    assert_eq!(outcome["outcome"], "reverted");
    assert_eq!(outcome["next_move"]["status"], "rolled_back");
    assert_eq!(outcome["next_move"]["trigger"], "manual");

    let (_, again) = post(port, &format!("/next-moves/{}/rollback", id), "");
    assert_eq!(again["outcome"], "already_reverted");
}

#[test]
fn approval_flow_and_illegal_transition() {
    let port = next_port();
    let _server = start_server(port, &[]);
    seed_merchant(port, "m1", "starter", 100, "low");

    let (_, view) = get(port, "/merchants/m1/next-move");
    assert_eq!(view["next_move"]["status"], "awaiting_approval");
    let id = view["next_move"]["id"].as_str().unwrap().to_string();

    let (status, declined) = post(port, &format!("/next-moves/{}/decline", id), "");
    assert_eq!(status, 200);
    assert_eq!(declined["status"], "declined");

    let (status, json) = post(port, &format!("/next-moves/{}/approve", id), "");
    assert_eq!(status, 409);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("not allowed from declined"));

    let (_, history) = get(port, "/merchants/m1/history");
    assert_eq!(history["next_moves"].as_array().unwrap().len(), 1);
    let (_, credits) = get(port, "/merchants/m1/credits");
    assert_eq!(credits["remaining"], 100);
}

#[test]
fn regression_signal_reverts_on_observe() {
    let port = next_port();
    let _server = start_server(port, &[]);
    seed_merchant(port, "m1", "pro", 100, "low");

    let (_, view) = get(port, "/merchants/m1/next-move");
    let id = view["next_move"]["id"].as_str().unwrap().to_string();
    post(port, &format!("/next-moves/{}/execute", id), "");

    let (status, _) = post(
        port,
        &format!("/next-moves/{}/signal", id),
        r#"{"observation": "regressed", "reason": "conversion down 18%"}"#,
    );
    assert_eq!(status, 200);

    let (status, observed) = post(port, &format!("/next-moves/{}/observe", id), "");
    assert_eq!(status, 200);
    assert_eq!(observed["status"], "rolled_back");
    assert_eq!(observed["trigger"], "regression");
}

#[test]
fn signals_for_finished_moves_are_refused() {
    let port = next_port();
    let _server = start_server(port, &[]);
    seed_merchant(port, "m1", "starter", 100, "low");

    let (_, view) = get(port, "/merchants/m1/next-move");
    let id = view["next_move"]["id"].as_str().unwrap().to_string();
    post(port, &format!("/next-moves/{}/decline", id), "");

    let (status, json) = post(
        port,
        &format!("/next-moves/{}/signal", id),
        r#"{"observation": "stable"}"#,
    );
    assert_eq!(status, 409);
    assert!(json["error"].as_str().unwrap().contains("declined"));
}

#[test]
fn opening_a_ledger_twice_conflicts() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (status, _) = post(port, "/merchants/m1/credits", r#"{"monthly_limit": 10}"#);
    assert_eq!(status, 201);
    let (status, _) = post(port, "/merchants/m1/credits", r#"{"monthly_limit": 10}"#);
    assert_eq!(status, 409);
}

// ──────────────────────────────────────────────
// Security
// ──────────────────────────────────────────────

#[test]
fn api_key_is_required_when_configured() {
    let port = next_port();
    let _server = start_server(port, &[("NEXTMOVE_API_KEY", "s3cret")]);

    let (status, _, _) = request(port, "GET", "/health", None, &[]);
    assert_eq!(status, 200, "/health is exempt");

    let (status, _, _) = request(port, "GET", "/merchants/m1/credits", None, &[]);
    assert_eq!(status, 401);

    let (status, _, _) = request(
        port,
        "GET",
        "/merchants/m1/credits",
        None,
        &[("Authorization", "Bearer wrong")],
    );
    assert_eq!(status, 403);

    let (status, _, _) = request(
        port,
        "GET",
        "/merchants/m1/credits",
        None,
        &[("X-API-Key", "s3cret")],
    );
    assert_eq!(status, 404, "authenticated; merchant has no ledger");
}

#[test]
fn rate_limit_returns_429() {
    let port = next_port();
    let _server = start_server(port, &[("NEXTMOVE_RATE_LIMIT", "3")]);

    for _ in 0..3 {
        let (status, _) = get(port, "/health");
        assert_eq!(status, 200);
    }
    let (status, json) = get(port, "/health");
    assert_eq!(status, 429);
    assert_eq!(json["error"], "rate limit exceeded");
}

#[test]
fn cors_headers_present() {
    let port = next_port();
    let _server = start_server(port, &[]);

    let (_, headers, _) = request(
        port,
        "GET",
        "/health",
        None,
        &[("Origin", "http://localhost:3000")],
    );
    assert!(headers
        .to_ascii_lowercase()
        .contains("access-control-allow-origin"));
}
