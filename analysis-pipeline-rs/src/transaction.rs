// analysis-pipeline-rs/src/transaction.rs
// Immutable snapshot of one captured HTTP exchange, plus the content
// fingerprint used to deduplicate analysis work.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How many body bytes participate in the fingerprint digest. Bodies larger
/// than this hash the same when their prefixes match, which is the intended
/// equivalence for analysis purposes.
const FINGERPRINT_BODY_CAP: usize = 4096;

/// One captured HTTP request/response pair. Owned by the caller; the
/// pipeline never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub method: String,
    pub url: String,
    /// Ordered request headers; name matching is case-insensitive.
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    /// Set when the capture layer already truncated the request body.
    pub request_body_truncated: bool,
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub response_body_truncated: bool,
}

impl Transaction {
    /// First value of the named request header, case-insensitive.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        Self::header_value(&self.request_headers, name)
    }

    /// First value of the named response header, case-insensitive.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        Self::header_value(&self.response_headers, name)
    }

    fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Deterministic content hash over a normalized projection: method, URL
    /// and size-capped digests of both bodies.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.to_uppercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.url.as_bytes());
        hasher.update([0u8]);
        hasher.update(body_digest(&self.request_body));
        hasher.update(body_digest(&self.response_body));
        hasher.update(self.status.to_be_bytes());
        Fingerprint(hasher.finalize().into())
    }
}

fn body_digest(body: &[u8]) -> [u8; 32] {
    let capped = &body[..body.len().min(FINGERPRINT_BODY_CAP)];
    let mut hasher = Sha256::new();
    hasher.update((body.len() as u64).to_be_bytes());
    hasher.update(capped);
    hasher.finalize().into()
}

/// Cache key identifying equivalent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for logs and handles.
    pub fn short_hex(&self) -> String {
        self.0[..6].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
