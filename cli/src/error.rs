// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI-level errors for the `schedule` and `work` binaries. These wrap
//! fatal startup failures (spec §6: "non-zero on fatal startup failure
//! (port bind, etc.)"); everything else (operator input, RPC, dashboard
//! requests) is handled inside `scheduler-core` and never reaches here.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors with contextual messages.
#[derive(Debug, Error)]
pub enum CliError {
    /// Failed to bind the dashboard or worker HTTP listener to its port.
    #[error("failed to bind to {addr}: {reason}")]
    PortBindFailed { addr: String, reason: String },

    /// Configuration could not be loaded (malformed file, bad env var).
    #[error("configuration error: {message}")]
    ConfigurationError { message: String, suggestion: String },

    /// A required positional argument or flag was missing or invalid.
    #[error("invalid input: {message}")]
    InvalidInput { message: String, suggestion: String },

    /// Could not determine the local hostname for the default scheduler name.
    #[error("could not determine local hostname: {reason}")]
    HostnameUnavailable { reason: String },
}

impl CliError {
    #[must_use]
    pub fn port_bind_failed(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::PortBindFailed {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn configuration_error(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Print the error with a short suggestion using `eprintln!` and a
    /// colored suggestion line.
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);

        let suggestion = match self {
            Self::ConfigurationError { suggestion, .. } | Self::InvalidInput { suggestion, .. } => {
                Some(suggestion.as_str())
            }
            Self::PortBindFailed { .. } => Some("pick a free port with --dashboard-port/--port, or stop the process already using it"),
            Self::HostnameUnavailable { .. } => Some("pass --name explicitly"),
        };

        if let Some(suggestion) = suggestion.filter(|s| !s.is_empty()) {
            eprintln!("{} {}", "Suggestion:".yellow().bold(), suggestion);
        }
    }
}

/// Exit codes for the `schedule`/`work` binaries (spec §6: "0 on clean
/// stop; non-zero on fatal startup failure").
pub mod exit_codes {
    /// Successful execution / clean stop.
    pub const SUCCESS: i32 = 0;

    /// Fatal startup failure (port bind, bad config, etc.).
    pub const STARTUP_FAILURE: i32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bind_failed_carries_addr_and_reason() {
        let err = CliError::port_bind_failed("0.0.0.0:9200", "address in use");
        match err {
            CliError::PortBindFailed { addr, reason } => {
                assert_eq!(addr, "0.0.0.0:9200");
                assert_eq!(reason, "address in use");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn configuration_error_carries_suggestion() {
        let err = CliError::configuration_error("bad toml", "check your syntax");
        match err {
            CliError::ConfigurationError { message, suggestion } => {
                assert_eq!(message, "bad toml");
                assert_eq!(suggestion, "check your syntax");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
