//! Transient-fault classification.
//!
//! The classifier labels a fault for logging and strategy selection. It is
//! not a gate: every fault is considered retryable, including unrecognized
//! ones such as authentication failures. The only permanent stop is the
//! explicit "logged out" signal, which is handled before faults get here.

use std::fmt;

use chat_bridge_core::Fault;

/// Socket error codes that indicate temporary network trouble.
pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "EHOSTUNREACH",
    "ENOTFOUND",
    "ENETUNREACH",
];

/// WebSocket close codes that indicate a temporary condition.
pub const TRANSIENT_CLOSE_CODES: &[u16] = &[
    1001, // going away
    1006, // abnormal closure
    1012, // service restart
    1013, // try again later
    1014, // bad gateway
];

const TRANSIENT_MESSAGE_WORDS: &[&str] = &["network", "timeout", "reset", "refused", "unavailable"];

/// Which rule matched a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No fault information at all.
    NoFault,
    NetworkCode(String),
    CloseCode(u16),
    /// The message mentions a network condition.
    Message,
    /// Nothing recognized; retried anyway.
    Unrecognized,
}

impl Classification {
    /// Whether a retry is expected to help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        true
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFault => f.write_str("no fault"),
            Self::NetworkCode(code) => write!(f, "network code {code}"),
            Self::CloseCode(code) => write!(f, "close code {code}"),
            Self::Message => f.write_str("network message"),
            Self::Unrecognized => f.write_str("unrecognized"),
        }
    }
}

/// Classify a fault. Rules are checked in order: code, close code, message.
#[must_use]
pub fn classify(fault: Option<&Fault>) -> Classification {
    let Some(fault) = fault else {
        return Classification::NoFault;
    };

    if let Some(code) = fault
        .code
        .as_deref()
        .filter(|code| TRANSIENT_ERROR_CODES.contains(code))
    {
        return Classification::NetworkCode(code.to_string());
    }

    if let Some(close_code) = fault
        .close_code
        .filter(|code| TRANSIENT_CLOSE_CODES.contains(code))
    {
        return Classification::CloseCode(close_code);
    }

    if fault.message.as_deref().is_some_and(mentions_network) {
        return Classification::Message;
    }

    Classification::Unrecognized
}

/// Whether the fault should be retried. Always true; see module docs.
#[must_use]
pub fn is_transient(fault: Option<&Fault>) -> bool {
    classify(fault).is_transient()
}

fn mentions_network(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MESSAGE_WORDS.iter().any(|word| message.contains(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fault_is_transient() {
        assert_eq!(classify(None), Classification::NoFault);
        assert!(is_transient(None));
    }

    #[test]
    fn test_error_codes() {
        let fault = Fault::new().with_code("ECONNRESET");
        assert_eq!(classify(Some(&fault)), Classification::NetworkCode("ECONNRESET".into()));
        assert!(is_transient(Some(&fault)));

        for code in TRANSIENT_ERROR_CODES {
            let fault = Fault::new().with_code(*code);
            assert!(matches!(classify(Some(&fault)), Classification::NetworkCode(_)));
        }
    }

    #[test]
    fn test_close_codes() {
        for code in [1001, 1006, 1012, 1013, 1014] {
            let fault = Fault::new().with_close_code(code);
            assert_eq!(classify(Some(&fault)), Classification::CloseCode(code));
        }
        let normal = Fault::new().with_close_code(1000);
        assert_eq!(classify(Some(&normal)), Classification::Unrecognized);
    }

    #[test]
    fn test_message_is_case_insensitive() {
        for message in ["Network down", "read TIMEOUT", "connection Reset by peer", "Service Unavailable"] {
            let fault = Fault::new().with_message(message);
            assert_eq!(classify(Some(&fault)), Classification::Message, "{message}");
        }
    }

    #[test]
    fn test_unknown_faults_still_retry() {
        let auth = Fault::new().with_message("Authentication failed");
        assert_eq!(classify(Some(&auth)), Classification::Unrecognized);
        assert!(is_transient(Some(&auth)));

        let odd = Fault::new().with_code("EWHATEVER").with_close_code(4000);
        assert!(is_transient(Some(&odd)));
    }

    #[test]
    fn test_unrecognized_code_falls_through_to_message() {
        let fault = Fault::new().with_code("EPROTO").with_message("socket timeout");
        assert_eq!(classify(Some(&fault)), Classification::Message);
    }
}
