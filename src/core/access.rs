//! Access-control plug-in hooks.
//!
//! The connection state machine calls into an [`AccessModule`] at two
//! points: when entering the AUTH phase it presents this side's
//! credential, and on a peer's AUTH it verifies the received credential,
//! yielding the authenticated subject enforced later by per-endpoint
//! access sets. The policy itself is external to the core; the default
//! module accepts everyone and uses the peer's declared subject.

use serde_json::{Value, json};

/// Hooks the state machine exposes to an access-control plug-in.
pub trait AccessModule: Send + Sync {
    /// Module name for logs and `load_acc_module`.
    fn name(&self) -> &str;

    /// Credential presented to peers in AUTH.
    fn credential(&self) -> Value;

    /// Verifies a peer credential, returning the authenticated subject
    /// when accepted.
    fn verify(&self, credential: &Value) -> Option<String>;

    /// Called when an authenticated connection goes away.
    fn on_disconnect(&self, _subject: Option<&str>) {}
}

/// Default module: accepts every peer and takes the subject the peer
/// declares in its credential.
pub struct OpenAccess {
    subject: String,
}

impl OpenAccess {
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

impl AccessModule for OpenAccess {
    fn name(&self) -> &str {
        "open"
    }

    fn credential(&self) -> Value {
        json!({ "subject": self.subject })
    }

    fn verify(&self, credential: &Value) -> Option<String> {
        Some(
            credential
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or("anonymous")
                .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_access_accepts_declared_subject() {
        let access = OpenAccess::new("sender_cpt");
        assert_eq!(access.credential(), json!({"subject": "sender_cpt"}));
        assert_eq!(
            access.verify(&json!({"subject": "receiver_cpt"})),
            Some("receiver_cpt".to_string())
        );
    }

    #[test]
    fn open_access_defaults_missing_subject() {
        let access = OpenAccess::new("x");
        assert_eq!(access.verify(&json!({})), Some("anonymous".to_string()));
    }
}
