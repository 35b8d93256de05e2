//! Session identifiers for capture and upload workflows.

use crate::model::Session;
use rand::RngCore;

/// Generate a random session id (16 hex chars).
fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Hands out a `Session` per workflow instance. A fixed id (e.g. one taken from
/// a shared link) is reused on every retry; otherwise each retry gets a new id.
#[derive(Debug, Clone, Default)]
pub struct SessionSource {
    fixed: Option<String>,
}

impl SessionSource {
    pub fn new(fixed: Option<String>) -> Self {
        let fixed = fixed
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self { fixed }
    }

    pub fn next(&self) -> Session {
        Session {
            id: self.fixed.clone().unwrap_or_else(gen_session_id),
        }
    }
}
