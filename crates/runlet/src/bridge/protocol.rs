//! Wire protocol types for manager-runner communication.
//!
//! Two unidirectional streams carry one session:
//! - **Command stream** (manager → runner): Call frames only.
//! - **Response stream** (runner → manager): Response, Event and Log frames.

use rmpv::Value;

/// Frame tag bytes. Stable within a build; both ends must agree.
pub const TAG_CALL: u8 = 0x01;
pub const TAG_RESPONSE: u8 = 0x02;
pub const TAG_EVENT: u8 = 0x03;
pub const TAG_LOG: u8 = 0x04;

/// Response status strings as written on the wire.
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Lifecycle method names. `start_async` is invoked fire-and-forget by the
/// runner at startup; `stop_async` terminates the dispatch loop after its
/// response is flushed.
pub const START_METHOD: &str = "start_async";
pub const STOP_METHOD: &str = "stop_async";

/// A self-delimited message on a transport stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Invoke a method on the hosted service. Arguments positionally match
    /// the method's declared parameters.
    Call {
        id: i32,
        method: String,
        args: Vec<Value>,
    },

    /// Outcome of the Call with the same id.
    Response { id: i32, outcome: CallOutcome },

    /// Service-originated event carrying a single payload value.
    Event {
        name: String,
        payload: Option<Value>,
    },

    /// Structured log record from the runner process.
    Log {
        severity: Severity,
        message: String,
    },
}

/// Result of a dispatched call as carried by a Response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// `None` means the method completed without a return value (the wire
    /// carries a zero-length payload blob).
    Success(Option<Value>),
    /// Human-readable root-cause message.
    Error(String),
}

/// Log severities as carried by Log frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
    None,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
            Self::None => "None",
        }
    }

    /// Unknown severity strings degrade to Information.
    pub fn parse(s: &str) -> Self {
        match s {
            "Trace" => Self::Trace,
            "Debug" => Self::Debug,
            "Information" => Self::Information,
            "Warning" => Self::Warning,
            "Error" => Self::Error,
            "Critical" => Self::Critical,
            "None" => Self::None,
            _ => Self::Information,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrips_through_strings() {
        for severity in [
            Severity::Trace,
            Severity::Debug,
            Severity::Information,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
            Severity::None,
        ] {
            assert_eq!(Severity::parse(severity.as_str()), severity);
        }
    }

    #[test]
    fn unknown_severity_degrades_to_information() {
        assert_eq!(Severity::parse("Verbose"), Severity::Information);
        assert_eq!(Severity::parse(""), Severity::Information);
        assert_eq!(Severity::parse("information"), Severity::Information);
    }

    #[test]
    fn tags_are_distinct() {
        let tags = [TAG_CALL, TAG_RESPONSE, TAG_EVENT, TAG_LOG];
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
