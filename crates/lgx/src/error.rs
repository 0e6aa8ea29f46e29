//! 🚨 The indexing layer's error taxonomy.
//!
//! 💀 Everything else in the crate is happy with `anyhow`, but the retry loop
//! needs to know *which* kind of bad day it is having: a 413 is a diet plan,
//! a 403 is a permissions problem, a 503 is the engine taking a nap, and a
//! response that does not line up with the request is a hard stop.

use thiserror::Error;

/// 🏷️ What went wrong talking to the search engine.
#[derive(Debug, Error)]
pub enum IndexError {
    /// 🍔 The engine said the payload was too big. The batch size has already been shrunk;
    /// re-batch with `new_batch_size` records and resubmit.
    #[error("📦 payload too large for '{index}', batch size is now {new_batch_size}; re-batch and resubmit")]
    Oversize { index: String, new_batch_size: usize },

    /// 🔒 403 / 409 on a call. Remediation (role mapping) may fix it.
    #[error("🔒 {operation} was refused with status {status}: {body}")]
    Permission {
        operation: String,
        status: u16,
        body: String,
    },

    /// 🔄 Any other non-success status. Worth another go.
    #[error("🔄 {operation} answered with status {status}: {body}")]
    Transient {
        operation: String,
        status: u16,
        body: String,
    },

    /// 📡 The request never got an answer at all.
    #[error("📡 {operation} never reached the engine")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    /// ⏳ Ran out of attempts.
    #[error("💀 {operation} gave up after {attempts} attempts, last error: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    /// 🧩 The bulk response items cannot be matched to the records we sent.
    #[error("💀 bulk response for '{index}' does not line up with the request: {detail}")]
    CorrelationMismatch { index: String, detail: String },

    /// 💀 Not retryable, not remediable, not fixable from here.
    #[error("💀 {operation} failed: {reason}")]
    Fatal { operation: String, reason: String },
}

impl IndexError {
    /// 🔄 Should the retry loop take another swing at this one?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexError::Transient { .. } | IndexError::Network { .. } | IndexError::Permission { .. }
        )
    }

    /// 🧱 A 413: the engine asking for smaller batches, which the sink worker handles.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, IndexError::Oversize { .. })
    }

    /// 🔒 Is this the kind of refusal that role mapping can fix?
    pub fn wants_remediation(&self) -> bool {
        matches!(self, IndexError::Permission { .. })
    }

    /// 📊 The HTTP status behind the error, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            IndexError::Permission { status, .. } | IndexError::Transient { status, .. } => Some(*status),
            IndexError::Oversize { .. } => Some(413),
            _ => None,
        }
    }

    /// 🏷️ Sort a non-success status into the right bucket for `operation`.
    /// 413 is deliberately not handled here, the bulk path owns that one.
    pub fn from_status(operation: &str, status: u16, body: String) -> Self {
        match status {
            403 | 409 => IndexError::Permission {
                operation: operation.to_string(),
                status,
                body,
            },
            _ => IndexError::Transient {
                operation: operation.to_string(),
                status,
                body,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_forbidden_and_conflict_go_to_the_permissions_desk() {
        let forbidden = IndexError::from_status("ism put", 403, "nope".into());
        let conflict = IndexError::from_status("ism put", 409, "version conflict".into());
        assert!(forbidden.wants_remediation());
        assert!(conflict.wants_remediation());
        assert!(forbidden.is_retryable());
        assert_eq!(conflict.status(), Some(409));
    }

    #[test]
    fn the_one_where_a_503_is_just_a_nap() {
        let napping = IndexError::from_status("bulk", 503, "busy".into());
        assert!(napping.is_retryable());
        assert!(!napping.wants_remediation());
    }

    #[test]
    fn the_one_where_oversize_and_mismatch_are_not_worth_a_retry() {
        let chonky = IndexError::Oversize {
            index: "logs".into(),
            new_batch_size: 8000,
        };
        let confused = IndexError::CorrelationMismatch {
            index: "logs".into(),
            detail: "2 items for 3 records".into(),
        };
        assert!(!chonky.is_retryable());
        assert!(!confused.is_retryable());
        assert_eq!(chonky.status(), Some(413));
        assert!(chonky.to_string().contains("8000"));
    }

    #[test]
    fn the_one_where_a_413_is_backpressure_not_a_tragedy() {
        let chonky = IndexError::Oversize {
            index: "logs".into(),
            new_batch_size: 2000,
        };
        let doomed = IndexError::from_status("bulk", 400, "bad request".into());
        assert!(chonky.is_backpressure());
        assert!(!doomed.is_backpressure());
        assert!(!IndexError::from_status("bulk", 503, "busy".into()).is_backpressure());
    }
}
