// analysis-pipeline-rs/src/finding.rs
// Structured output of one analysis: findings extracted from the model reply
// and the terminal result delivered to every waiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::Fingerprint;

/// Severity tokens the model is instructed to emit, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parses a severity token, case-insensitive. Unknown tokens are a
    /// contract violation handled by the parser.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation extracted from the model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub title: String,
    /// Sanitized, display-safe HTML rendering of the explanation body.
    pub explanation_html: String,
    /// Direct quote from the transaction the model cited as evidence.
    pub evidence: Option<String>,
    /// Model-stated confidence in [0.0, 1.0], when present.
    pub confidence: Option<f32>,
}

/// Lifecycle of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal result delivered to every waiter for a fingerprint. Immutable
/// once the status leaves `Pending`; shared behind `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub fingerprint: Fingerprint,
    pub status: AnalysisStatus,
    pub findings: Vec<Finding>,
    /// Unparsed model reply, kept for operator inspection.
    pub raw_text: String,
    /// Human-readable failure cause when status is `Failed`.
    pub cause: Option<String>,
    /// True when the model replied without any finding sections.
    pub no_issues_found: bool,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn succeeded(
        fingerprint: Fingerprint,
        findings: Vec<Finding>,
        raw_text: String,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let no_issues_found = findings.is_empty();
        Self {
            fingerprint,
            status: AnalysisStatus::Succeeded,
            findings,
            raw_text,
            cause: None,
            no_issues_found,
            submitted_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        fingerprint: Fingerprint,
        cause: String,
        raw_text: String,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint,
            status: AnalysisStatus::Failed,
            findings: Vec::new(),
            raw_text,
            cause: Some(cause),
            no_issues_found: false,
            submitted_at,
            completed_at: Utc::now(),
        }
    }

    pub fn cancelled(fingerprint: Fingerprint, submitted_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            status: AnalysisStatus::Cancelled,
            findings: Vec::new(),
            raw_text: String::new(),
            cause: None,
            no_issues_found: false,
            submitted_at,
            completed_at: Utc::now(),
        }
    }

    /// Compact one-line summary used for session memory and logs: the top
    /// finding, the failure cause, or the clean verdict.
    pub fn summary(&self) -> String {
        const MAX_SUMMARY: usize = 150;
        let line = match self.status {
            AnalysisStatus::Succeeded => match self.findings.iter().max_by_key(|f| f.severity) {
                Some(top) => {
                    format!("{}: {} ({} total)", top.severity, top.title, self.findings.len())
                }
                None => "no issues found".to_string(),
            },
            AnalysisStatus::Failed => format!(
                "analysis failed: {}",
                self.cause.as_deref().unwrap_or("unknown cause")
            ),
            AnalysisStatus::Cancelled => "analysis cancelled".to_string(),
            AnalysisStatus::Pending => "analysis pending".to_string(),
        };
        let line = line.replace(['\r', '\n'], " ").trim().to_string();
        if line.len() > MAX_SUMMARY {
            let mut end = MAX_SUMMARY;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &line[..end])
        } else {
            line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::test_support::sample_transaction;

    fn finding(severity: Severity, title: &str) -> Finding {
        Finding {
            severity,
            title: title.to_string(),
            explanation_html: "<p>details</p>".to_string(),
            evidence: None,
            confidence: None,
        }
    }

    #[test]
    fn severity_tokens_parse_case_insensitively() {
        assert_eq!(Severity::parse("medium"), Some(Severity::Medium));
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse(" Info "), Some(Severity::Info));
        assert_eq!(Severity::parse("urgent"), None);
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn summary_reports_top_finding() {
        let fp = sample_transaction().fingerprint();
        let result = AnalysisResult::succeeded(
            fp,
            vec![
                finding(Severity::Low, "Verbose server banner"),
                finding(Severity::High, "Token leaked in URL"),
            ],
            "raw".to_string(),
            Utc::now(),
        );
        let summary = result.summary();
        assert!(summary.contains("High: Token leaked in URL"));
        assert!(summary.contains("2 total"));
        assert!(!result.no_issues_found);
    }

    #[test]
    fn summary_is_single_line_and_bounded() {
        let fp = sample_transaction().fingerprint();
        let long_title = "x".repeat(400);
        let result = AnalysisResult::succeeded(
            fp,
            vec![finding(Severity::Medium, &long_title)],
            "raw".to_string(),
            Utc::now(),
        );
        let summary = result.summary();
        assert!(summary.len() <= 153);
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn empty_findings_mean_no_issues() {
        let fp = sample_transaction().fingerprint();
        let result = AnalysisResult::succeeded(fp, Vec::new(), "All clear.".to_string(), Utc::now());
        assert!(result.no_issues_found);
        assert_eq!(result.summary(), "no issues found");
    }

    #[test]
    fn failed_result_carries_cause() {
        let fp = sample_transaction().fingerprint();
        let result = AnalysisResult::failed(
            fp,
            "LLM backend returned HTTP 500".to_string(),
            String::new(),
            Utc::now(),
        );
        assert_eq!(result.status, AnalysisStatus::Failed);
        assert!(result.summary().contains("HTTP 500"));
    }
}
