//! Connection fault descriptor.

use std::{fmt, io};

use serde::{Deserialize, Serialize};

/// Status code the remote endpoint uses to invalidate a session.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Resolver messages; name lookup failures carry no dedicated error kind.
const DNS_FAILURE_MESSAGES: &[&str] = &[
    "failed to lookup address",
    "Name or service not known",
    "nodename nor servname",
    "No such host is known",
];

/// Why a connection dropped or failed to open.
///
/// All fields are optional: collaborators report whatever they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    /// Low-level error code, e.g. `ECONNRESET`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// WebSocket close code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    /// Protocol-level disconnect status, e.g. 401 for "logged out".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Fault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub const fn with_close_code(mut self, close_code: u16) -> Self {
        self.close_code = Some(close_code);
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The session was invalidated remotely and must not be retried.
    #[must_use]
    pub fn logged_out() -> Self {
        Self::new()
            .with_status(LOGGED_OUT_STATUS)
            .with_message("logged out")
    }

    #[must_use]
    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(LOGGED_OUT_STATUS)
    }

    /// Describe an I/O error using the conventional socket error names.
    #[must_use]
    pub fn from_io_error(err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Some("ECONNRESET"),
            io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
            io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            io::ErrorKind::BrokenPipe => Some("EPIPE"),
            io::ErrorKind::HostUnreachable => Some("EHOSTUNREACH"),
            io::ErrorKind::NetworkUnreachable => Some("ENETUNREACH"),
            _ if is_dns_failure(err) => Some("ENOTFOUND"),
            _ => None,
        };
        Self {
            code: code.map(str::to_string),
            message: Some(err.to_string()),
            ..Self::default()
        }
    }
}

fn is_dns_failure(err: &io::Error) -> bool {
    let message = err.to_string();
    DNS_FAILURE_MESSAGES.iter().any(|m| message.contains(m))
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("unknown error"))?;
        if let Some(code) = &self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(close_code) = self.close_code {
            write!(f, " (close code {close_code})")?;
        }
        if let Some(status) = self.status_code {
            write!(f, " (status {status})")?;
        }
        Ok(())
    }
}

impl From<&io::Error> for Fault {
    fn from(err: &io::Error) -> Self {
        Self::from_io_error(err)
    }
}
