//! Deterministic fingerprinting of a job's class and arguments.
//!
//! The digest is the deduplication key: identical class + arguments always
//! yield the same fingerprint, and the uniqueness/conflict strategies only
//! ever compare records sharing one.

use std::fmt::Write as _;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Hash backend behind the generator. Swappable by operators.
pub trait DigestBackend: Send + Sync {
    fn hexdigest(&self, input: &str) -> String;
}

/// Default backend: SHA-256.
#[derive(Debug, Default)]
pub struct Sha256Backend;

impl DigestBackend for Sha256Backend {
    fn hexdigest(&self, input: &str) -> String {
        let hash = Sha256::digest(input.as_bytes());
        let mut out = String::with_capacity(hash.len() * 2);
        for byte in hash {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// Pure fingerprinting function. No side effects.
pub struct DigestGenerator {
    backend: Arc<dyn DigestBackend>,
}

impl DigestGenerator {
    pub fn new(backend: Arc<dyn DigestBackend>) -> Self {
        Self { backend }
    }

    /// Fingerprint `job_class` plus its ordered arguments, joined by a
    /// fixed separator so any difference in either changes the input.
    pub fn generate(&self, job_class: &str, arguments: &[serde_json::Value]) -> String {
        let args = arguments
            .iter()
            .map(stringify)
            .collect::<Vec<_>>()
            .join("-");
        self.backend.hexdigest(&format!("{job_class}-{args}"))
    }
}

impl Default for DigestGenerator {
    fn default() -> Self {
        Self::new(Arc::new(Sha256Backend))
    }
}

/// Strings contribute their raw text; everything else its canonical JSON.
fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
