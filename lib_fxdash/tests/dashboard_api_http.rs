//! # Dashboard API over a Stub Backend
//!
//! Runs `DashboardApi` against a scripted HTTP server on a random local port
//! and checks paths, bodies, auth, status mapping and queue integration.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use lib_fxdash::core::{RequestQueue, RequestQueueConfig};
use lib_fxdash::retrieve::dashboard_api::coerce_f64;
use lib_fxdash::retrieve::{ApiClient, ApiError, DashboardApi};

/// One request as the stub saw it.
#[derive(Debug, Clone)]
struct Recorded {
    line: String,
    authorization: Option<String>,
    body: String,
}

/// Serves one scripted `(status, body)` per connection, in order, then exits.
fn stub_backend(script: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<Recorded>>>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&recorded);

    let handle = thread::spawn(move || {
        for (status, body) in script {
            let Ok((mut stream, _)) = listener.accept() else { return };
            let request = read_request(&mut stream);
            log.lock().unwrap().push(request);

            let reason = match status {
                200 => "OK",
                204 => "No Content",
                404 => "Not Found",
                503 => "Service Unavailable",
                _ => "Status",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        }
    });

    (base_url, recorded, handle)
}

fn read_request(stream: &mut std::net::TcpStream) -> Recorded {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break raw.len();
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let line = lines.next().unwrap_or_default().to_string();
    let mut content_length = 0;
    let mut authorization = None;
    for header in lines {
        if let Some((name, value)) = header.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    while raw.len() < header_end + content_length {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let body = String::from_utf8_lossy(&raw[header_end..]).to_string();

    Recorded {
        line,
        authorization,
        body,
    }
}

fn api(base_url: &str, token: Option<&str>) -> DashboardApi {
    let client = ApiClient::new(base_url, token.map(str::to_string), Duration::from_secs(5)).unwrap();
    DashboardApi::new(client)
}

#[tokio::test]
async fn endpoints_hit_the_expected_paths() {
    let (base_url, recorded, handle) = stub_backend(vec![
        (200, r#"[{"id":"t1","pair":"EUR_USD","units":"1000","unrealized_pl":"12.5"}]"#),
        (200, r#"{"ok":true}"#),
        (204, ""),
        (200, r#"{"running":true}"#),
    ]);
    let api = api(&base_url, Some("secret"));

    let positions = api.positions().await.unwrap();
    assert_eq!(coerce_f64(&positions[0]["unrealized_pl"]), Some(12.5));

    let updated = api.update_trade("t1", &json!({ "notes": "scaled out" })).await.unwrap();
    assert_eq!(updated, json!({ "ok": true }));

    assert_eq!(api.delete_trade("t1").await.unwrap(), Value::Null);
    assert_eq!(api.start_bot().await.unwrap()["running"], json!(true));

    handle.join().unwrap();
    let recorded = recorded.lock().unwrap();
    let lines: Vec<&str> = recorded.iter().map(|r| r.line.as_str()).collect();
    assert_eq!(
        lines,
        vec![
            "GET /api/positions HTTP/1.1",
            "PUT /api/trades/t1 HTTP/1.1",
            "DELETE /api/trades/t1 HTTP/1.1",
            "POST /api/bot/start HTTP/1.1",
        ]
    );
    assert!(recorded.iter().all(|r| r.authorization.as_deref() == Some("Bearer secret")));
    let sent: Value = serde_json::from_str(&recorded[1].body).unwrap();
    assert_eq!(sent, json!({ "notes": "scaled out" }));
}

#[tokio::test]
async fn service_unavailable_is_reported_not_retried() {
    let (base_url, recorded, handle) = stub_backend(vec![
        (503, r#"{"detail":"warming up"}"#),
        (404, r#"{"detail":"not found"}"#),
    ]);
    let api = api(&base_url, None);

    let err = api.stats().await.unwrap_err();
    assert!(matches!(&err, ApiError::ServiceUnavailable { body } if body.contains("warming up")));
    assert!(err.is_transient());

    // The next scripted response goes to the next call, so the 503 was not retried.
    let err = api.trades(Some(50)).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));

    handle.join().unwrap();
    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].line, "GET /api/stats HTTP/1.1");
    assert_eq!(recorded[1].line, "GET /api/trades?limit=50 HTTP/1.1");
    assert_eq!(recorded[0].authorization, None);
}

#[tokio::test]
async fn calls_flow_through_the_request_queue() {
    let (base_url, _recorded, handle) = stub_backend(vec![
        (200, r#"{"balance":"10250.75","open_trades":2}"#),
        (200, r#"{"running":false}"#),
    ]);
    let api = api(&base_url, None);
    let queue = RequestQueue::new(RequestQueueConfig {
        max_concurrent: 1,
        dispatch_delay: Duration::from_millis(1),
        ..RequestQueueConfig::default()
    });

    let stats_api = api.clone();
    let stats = queue.submit(Some("stats"), move || async move { stats_api.stats().await });
    let status_api = api.clone();
    let status = queue.submit(Some("bot-status"), move || async move { status_api.bot_status().await });

    let stats: Value = stats.await.unwrap();
    assert_eq!(coerce_f64(&stats["balance"]), Some(10250.75));
    let status: Result<Value, ApiError> = status.await;
    assert_eq!(status.unwrap()["running"], json!(false));

    handle.join().unwrap();
    assert_eq!(queue.status().waiting, 0);
}
