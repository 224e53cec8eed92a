// analysis-pipeline-rs/src/parser.rs
//
// Parses the model's Markdown reply into structured findings per the
// contract fixed by the prompt builder: one `## <Severity>: <Title>` heading
// per finding, explanation body below it. Pure and deterministic.

use once_cell::sync::Lazy;
use regex::Regex;

use llm_client::ModelReply;

use crate::finding::{Finding, Severity};

static FINDING_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^##\s+([A-Za-z]+)\s*:\s*(.+?)\s*$").expect("static regex"));

static EVIDENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^evidence:\s*"?(.*?)"?\s*$"#).expect("static regex"));

static CONFIDENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^confidence:\s*([0-9]*\.?[0-9]+)\s*$").expect("static regex"));

/// Contract violations in the model reply. Retrying the same reply is
/// pointless, so these are terminal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("malformed finding heading: {0:?}")]
    MalformedHeading(String),

    #[error("unrecognized severity token {0:?}")]
    UnknownSeverity(String),
}

/// Parsed reply. Zero sections is not an error: the reply is tagged as a
/// clean result, distinct from a parse failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub findings: Vec<Finding>,
    pub no_issues_found: bool,
}

pub fn parse(reply: &ModelReply) -> Result<ParsedReply, ParseError> {
    let mut findings = Vec::new();
    let mut current: Option<(Severity, String, Vec<String>)> = None;
    let mut in_code_fence = false;

    for line in reply.text.lines() {
        if line.trim_start().starts_with("```") {
            in_code_fence = !in_code_fence;
        }

        let is_heading = !in_code_fence && line.starts_with("## ") && !line.starts_with("###");
        if is_heading {
            let captures = FINDING_HEADING_RE
                .captures(line)
                .ok_or_else(|| ParseError::MalformedHeading(line.to_string()))?;
            let token = &captures[1];
            let severity = Severity::parse(token)
                .ok_or_else(|| ParseError::UnknownSeverity(token.to_string()))?;
            if let Some(section) = current.take() {
                findings.push(close_section(section));
            }
            current = Some((severity, captures[2].to_string(), Vec::new()));
            continue;
        }

        if let Some((_, _, body)) = current.as_mut() {
            body.push(line.to_string());
        }
        // Text before the first heading (preamble, "No issues found.") is
        // intentionally dropped; it is preserved in the raw reply.
    }

    if let Some(section) = current.take() {
        findings.push(close_section(section));
    }

    let no_issues_found = findings.is_empty();
    Ok(ParsedReply {
        findings,
        no_issues_found,
    })
}

/// Finalizes one section: pull out the Evidence/Confidence metadata lines and
/// render the rest of the body to sanitized HTML.
fn close_section((severity, title, body_lines): (Severity, String, Vec<String>)) -> Finding {
    let mut evidence = None;
    let mut confidence = None;
    let mut body = Vec::with_capacity(body_lines.len());

    for line in body_lines {
        if evidence.is_none() {
            if let Some(captures) = EVIDENCE_RE.captures(line.trim()) {
                let quoted = captures[1].trim().to_string();
                if !quoted.is_empty() {
                    evidence = Some(quoted);
                    continue;
                }
            }
        }
        if confidence.is_none() {
            if let Some(captures) = CONFIDENCE_RE.captures(line.trim()) {
                if let Ok(value) = captures[1].parse::<f32>() {
                    confidence = Some(value.clamp(0.0, 1.0));
                    continue;
                }
            }
        }
        body.push(line);
    }

    Finding {
        severity,
        title,
        explanation_html: render_explanation(body.join("\n").trim()),
        evidence,
        confidence,
    }
}

/// Markdown → HTML → sanitized HTML against a fixed allow-list: inline and
/// structural tags only, no scripts, no event handlers, no remote resource
/// loads.
fn render_explanation(markdown: &str) -> String {
    let parser = pulldown_cmark::Parser::new(markdown);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    sanitize_html(&html)
}

fn sanitize_html(html: &str) -> String {
    ammonia::Builder::default()
        .tags(
            [
                "p", "br", "ul", "ol", "li", "strong", "em", "b", "i", "code", "pre",
                "blockquote", "h3", "h4", "a", "table", "thead", "tbody", "tr", "th", "td",
            ]
            .into_iter()
            .collect(),
        )
        .url_schemes(["http", "https"].into_iter().collect())
        .link_rel(Some("noopener noreferrer"))
        .clean(html)
        .to_string()
}
