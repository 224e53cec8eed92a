// End-to-end pipeline test: a real HTTP LLM client against a scripted
// backend, driven through the orchestrator's submit/result surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use analysis_pipeline::{
    AnalysisOrchestrator, AnalysisProfile, AnalysisStatus, AnalystConfig, Severity, Transaction,
    HEADER_MASK,
};

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serves one canned JSON reply and records the raw request bytes.
async fn one_shot_backend(reply_body: String) -> (String, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    tokio::spawn(async move {
        let (mut sock, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut buf = Vec::new();
        let mut tmp = [0u8; 2048];
        loop {
            let n = match sock.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() - (pos + 4) >= content_length {
                    break;
                }
            }
        }
        *sink.lock().unwrap() = buf;

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reply_body.len(),
            reply_body
        );
        let _ = sock.write_all(response.as_bytes()).await;
        let _ = sock.shutdown().await;
    });

    (format!("http://{}/", addr), captured)
}

fn transaction_with_credentials() -> Transaction {
    Transaction {
        method: "POST".to_string(),
        url: "https://shop.example.com/api/login".to_string(),
        request_headers: vec![
            ("Host".to_string(), "shop.example.com".to_string()),
            ("Authorization".to_string(), "Bearer abc123".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ],
        request_body: br#"{"user":"alice"}"#.to_vec(),
        request_body_truncated: false,
        status: 200,
        response_headers: vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Set-Cookie".to_string(),
                "session=s3cr3t; Path=/".to_string(),
            ),
        ],
        response_body: br#"{"ok":true}"#.to_vec(),
        response_body_truncated: false,
    }
}

#[tokio::test]
async fn full_pipeline_produces_findings_and_redacts_credentials() {
    let reply = serde_json::json!({
        "message": {
            "role": "assistant",
            "content": "## Medium: Missing Secure flag\nCookie lacks Secure attribute.\nConfidence: 0.9"
        },
        "done": true
    })
    .to_string();
    let (endpoint_url, captured) = one_shot_backend(reply).await;

    let config = AnalystConfig {
        endpoint_url,
        model: "test-model".to_string(),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        workers: 2,
        ..AnalystConfig::default()
    };
    let orchestrator = AnalysisOrchestrator::with_http_backend(config).expect("valid config");

    let mut handle = orchestrator
        .submit(transaction_with_credentials(), AnalysisProfile::GeneralSecurity)
        .expect("admitted");
    let result = orchestrator.result(&mut handle).await;

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert_eq!(finding.severity, Severity::Medium);
    assert_eq!(finding.title, "Missing Secure flag");
    assert_eq!(finding.confidence, Some(0.9));
    assert!(finding
        .explanation_html
        .contains("Cookie lacks Secure attribute."));

    // The wire payload carries the mask, never the credentials.
    let wire = String::from_utf8_lossy(&captured.lock().unwrap()).into_owned();
    assert!(!wire.is_empty(), "backend never saw a request");
    assert!(!wire.contains("abc123"), "Authorization value leaked into the prompt");
    assert!(!wire.contains("s3cr3t"), "Set-Cookie value leaked into the prompt");
    assert!(wire.contains(HEADER_MASK));
}

#[tokio::test]
async fn repeat_submission_is_served_from_cache() {
    let reply = serde_json::json!({
        "message": {"role": "assistant", "content": "No issues found."},
        "done": true
    })
    .to_string();
    // The backend serves exactly one connection; a second network request
    // would fail the test by failing the analysis.
    let (endpoint_url, _captured) = one_shot_backend(reply).await;

    let config = AnalystConfig {
        endpoint_url,
        model: "test-model".to_string(),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        workers: 1,
        ..AnalystConfig::default()
    };
    let orchestrator = AnalysisOrchestrator::with_http_backend(config).expect("valid config");

    let mut first = orchestrator
        .submit(transaction_with_credentials(), AnalysisProfile::GeneralSecurity)
        .expect("admitted");
    let first_result = orchestrator.result(&mut first).await;
    assert_eq!(first_result.status, AnalysisStatus::Succeeded);
    assert!(first_result.no_issues_found);

    let mut second = orchestrator
        .submit(transaction_with_credentials(), AnalysisProfile::GeneralSecurity)
        .expect("admitted");
    let second_result = orchestrator.result(&mut second).await;
    assert_eq!(second_result.status, AnalysisStatus::Succeeded);
    assert!(second_result.no_issues_found);

    orchestrator.shutdown().await;
}
