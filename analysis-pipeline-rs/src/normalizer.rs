// analysis-pipeline-rs/src/normalizer.rs
//
// Reduces a Transaction to a bounded, redacted textual representation for
// prompting. Pure: same transaction and limits always produce the same text;
// no network or I/O.

use crate::transaction::Transaction;

/// Fixed-length mask replacing every redacted header value. Redaction is
/// unconditional; credentials must never reach the LLM prompt.
pub const HEADER_MASK: &str = "********";

/// Headers whose values are always masked, matched case-insensitively.
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// Content-type prefixes treated as binary without inspecting bytes.
const BINARY_CONTENT_TYPES: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-protobuf",
];

/// How many body bytes the printable-ratio heuristic inspects.
const SNIFF_WINDOW: usize = 1024;

pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

#[derive(Debug, Clone)]
pub struct NormalizeLimits {
    /// Byte budget per body side.
    pub max_body_bytes: usize,
    /// Bodies whose printable fraction falls below this are treated as binary.
    pub min_printable_ratio: f64,
}

impl Default for NormalizeLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 8 * 1024,
            min_printable_ratio: 0.80,
        }
    }
}

/// Result of normalization. Skipped bodies are not an error; the placeholder
/// stands in and processing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    pub text: String,
    pub request_body_skipped: bool,
    pub response_body_skipped: bool,
}

pub fn normalize(tx: &Transaction, limits: &NormalizeLimits) -> NormalizedText {
    let mut out = String::new();
    out.push_str("--- REQUEST ---\n");
    out.push_str(&tx.method.to_uppercase());
    out.push(' ');
    out.push_str(&tx.url);
    out.push('\n');
    write_headers(&mut out, &tx.request_headers);
    out.push('\n');
    let request_body_skipped = write_body(
        &mut out,
        &tx.request_body,
        tx.request_header("content-type"),
        tx.request_body_truncated,
        limits,
    );

    out.push_str("\n--- RESPONSE ---\n");
    out.push_str(&format!("Status: {}\n", tx.status));
    write_headers(&mut out, &tx.response_headers);
    out.push('\n');
    let response_body_skipped = write_body(
        &mut out,
        &tx.response_body,
        tx.response_header("content-type"),
        tx.response_body_truncated,
        limits,
    );

    NormalizedText {
        text: out,
        request_body_skipped,
        response_body_skipped,
    }
}

fn write_headers(out: &mut String, headers: &[(String, String)]) {
    for (name, value) in headers {
        let shown = if is_redacted_header(name) {
            HEADER_MASK
        } else {
            value.as_str()
        };
        out.push_str(name);
        out.push_str(": ");
        out.push_str(shown);
        out.push('\n');
    }
}

fn is_redacted_header(name: &str) -> bool {
    REDACTED_HEADERS
        .iter()
        .any(|candidate| name.eq_ignore_ascii_case(candidate))
}

/// Appends the body (or a placeholder) to the output. Returns true when the
/// body was skipped as non-text.
fn write_body(
    out: &mut String,
    body: &[u8],
    content_type: Option<&str>,
    already_truncated: bool,
    limits: &NormalizeLimits,
) -> bool {
    if body.is_empty() {
        out.push_str("(empty body)\n");
        return false;
    }

    if !looks_textual(body, content_type, limits.min_printable_ratio) {
        let declared = content_type.unwrap_or("unknown content type");
        out.push_str(&format!(
            "[binary content omitted: {}, {} bytes]\n",
            declared,
            body.len()
        ));
        return true;
    }

    let capped = &body[..body.len().min(limits.max_body_bytes)];
    let text = String::from_utf8_lossy(capped);
    let truncated = capped.len() < body.len() || already_truncated;
    // A byte-budget cut can land mid-codepoint; drop the dangling replacement
    // character instead of showing it to the model.
    out.push_str(text.trim_end_matches('\u{fffd}'));
    if truncated {
        out.push('\n');
        out.push_str(TRUNCATION_MARKER);
    }
    out.push('\n');
    false
}

fn looks_textual(body: &[u8], content_type: Option<&str>, min_printable_ratio: f64) -> bool {
    if let Some(declared) = content_type {
        let declared = declared.trim().to_ascii_lowercase();
        if BINARY_CONTENT_TYPES
            .iter()
            .any(|prefix| declared.starts_with(prefix))
        {
            return false;
        }
    }
    let window = &body[..body.len().min(SNIFF_WINDOW)];
    if window.is_empty() {
        return true;
    }
    let printable = window
        .iter()
        .filter(|&&b| {
            matches!(b, 0x09 | 0x0a | 0x0d) || (0x20..0x7f).contains(&b) || b >= 0x80
        })
        .count();
    (printable as f64 / window.len() as f64) >= min_printable_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::test_support::sample_transaction;

    #[test]
    fn redacted_headers_never_leak_values() {
        let mut tx = sample_transaction();
        tx.request_headers.push((
            "Authorization".to_string(),
            "Bearer abc123".to_string(),
        ));
        tx.request_headers
            .push(("Cookie".to_string(), "session=deadbeef".to_string()));
        tx.response_headers.push((
            "Set-Cookie".to_string(),
            "session=cafebabe; HttpOnly".to_string(),
        ));

        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(!normalized.text.contains("abc123"));
        assert!(!normalized.text.contains("deadbeef"));
        assert!(!normalized.text.contains("cafebabe"));
        assert!(normalized.text.contains(&format!("Authorization: {}", HEADER_MASK)));
        assert!(normalized.text.contains(&format!("Cookie: {}", HEADER_MASK)));
        assert!(normalized.text.contains(&format!("Set-Cookie: {}", HEADER_MASK)));
    }

    #[test]
    fn redaction_is_case_insensitive() {
        let mut tx = sample_transaction();
        tx.request_headers
            .push(("AUTHORIZATION".to_string(), "Basic czNjcjN0".to_string()));
        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(!normalized.text.contains("czNjcjN0"));
    }

    #[test]
    fn oversized_bodies_are_truncated_with_marker() {
        let mut tx = sample_transaction();
        tx.response_body = vec![b'a'; 10_000];
        let limits = NormalizeLimits {
            max_body_bytes: 100,
            ..NormalizeLimits::default()
        };
        let normalized = normalize(&tx, &limits);
        assert!(normalized.text.contains(TRUNCATION_MARKER));
        // Budget plus surrounding structure, never the full body.
        assert!(normalized.text.len() < 1_500);
    }

    #[test]
    fn binary_bodies_become_placeholders() {
        let mut tx = sample_transaction();
        tx.response_headers = vec![("Content-Type".to_string(), "image/png".to_string())];
        tx.response_body = vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0x01, 0x02];
        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(normalized.response_body_skipped);
        assert!(normalized.text.contains("[binary content omitted: image/png, 7 bytes]"));
        assert!(!normalized.text.contains('\u{fffd}'));
    }

    #[test]
    fn undeclared_binary_detected_by_printable_ratio() {
        let mut tx = sample_transaction();
        tx.response_headers.clear();
        tx.response_body = (0u8..32u8).cycle().take(600).collect();
        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(normalized.response_body_skipped);
        assert!(normalized.text.contains("binary content omitted"));
    }

    #[test]
    fn output_is_deterministic() {
        let tx = sample_transaction();
        let limits = NormalizeLimits::default();
        assert_eq!(normalize(&tx, &limits), normalize(&tx, &limits));
    }

    #[test]
    fn empty_bodies_are_marked() {
        let tx = sample_transaction();
        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(normalized.text.contains("(empty body)"));
        assert!(!normalized.request_body_skipped);
    }

    #[test]
    fn capture_layer_truncation_is_surfaced() {
        let mut tx = sample_transaction();
        tx.response_body_truncated = true;
        let normalized = normalize(&tx, &NormalizeLimits::default());
        assert!(normalized.text.contains(TRUNCATION_MARKER));
    }
}
