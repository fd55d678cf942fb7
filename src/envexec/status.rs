use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Outcome of running one command.
///
/// The string form is part of the wire contract and must stay stable:
/// `Status -> String -> Status` round-trips for every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Not initialized, treated as an error
    #[default]
    Invalid,

    // exit normally
    Accepted,
    WrongAnswer,
    PartiallyCorrect,

    // exit with error
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    FileError,
    NonzeroExitStatus,
    Signalled,
    DangerousSyscall,

    // special judge / interactor error
    JudgementFailed,
    InvalidInteraction,

    /// Engine failure: cgroup setup, container failure, fd preparation...
    InternalError,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid status string: {0}")]
pub struct StatusParseError(pub String);

impl Status {
    pub const ALL: [Status; 14] = [
        Status::Invalid,
        Status::Accepted,
        Status::WrongAnswer,
        Status::PartiallyCorrect,
        Status::MemoryLimitExceeded,
        Status::TimeLimitExceeded,
        Status::OutputLimitExceeded,
        Status::FileError,
        Status::NonzeroExitStatus,
        Status::Signalled,
        Status::DangerousSyscall,
        Status::JudgementFailed,
        Status::InvalidInteraction,
        Status::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Invalid => "Invalid",
            Status::Accepted => "Accepted",
            Status::WrongAnswer => "Wrong Answer",
            Status::PartiallyCorrect => "Partially Correct",
            Status::MemoryLimitExceeded => "Memory Limit Exceeded",
            Status::TimeLimitExceeded => "Time Limit Exceeded",
            Status::OutputLimitExceeded => "Output Limit Exceeded",
            Status::FileError => "File Error",
            Status::NonzeroExitStatus => "Nonzero Exit Status",
            Status::Signalled => "Signalled",
            Status::DangerousSyscall => "Dangerous Syscall",
            Status::JudgementFailed => "Judgement Failed",
            Status::InvalidInteraction => "Invalid Interaction",
            Status::InternalError => "Internal Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Status reported by the container runner before the engine classifies it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerStatus {
    #[default]
    Invalid,
    Normal,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    DisallowedSyscall,
    Signalled,
    NonzeroExitStatus,
    RunnerError,
}

impl From<RunnerStatus> for Status {
    fn from(s: RunnerStatus) -> Self {
        match s {
            RunnerStatus::Normal => Status::Accepted,
            RunnerStatus::Signalled => Status::Signalled,
            RunnerStatus::NonzeroExitStatus => Status::NonzeroExitStatus,
            RunnerStatus::MemoryLimitExceeded => Status::MemoryLimitExceeded,
            RunnerStatus::TimeLimitExceeded => Status::TimeLimitExceeded,
            RunnerStatus::OutputLimitExceeded => Status::OutputLimitExceeded,
            RunnerStatus::DisallowedSyscall => Status::DangerousSyscall,
            RunnerStatus::Invalid | RunnerStatus::RunnerError => Status::InternalError,
        }
    }
}

/// Kind of a per-file failure around copy-in / copy-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileErrorKind {
    CopyInOpenFile,
    CopyInCreateDir,
    CopyInCreateFile,
    CopyInCopyContent,
    CopyOutOpen,
    CopyOutNotRegularFile,
    CopyOutSizeExceeded,
    CopyOutCreateFile,
    CopyOutCopyContent,
    CollectSizeExceeded,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileErrorKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl FileError {
    pub fn new(name: impl Into<String>, kind: FileErrorKind, message: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            kind,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.name, self.kind)?;
        if !self.message.is_empty() {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in Status::ALL {
            let parsed: Status = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_serde_uses_string_form() {
        let json = serde_json::to_string(&Status::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"Time Limit Exceeded\"");
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Status::TimeLimitExceeded);
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        assert_eq!(
            "Runtime Error".parse::<Status>(),
            Err(StatusParseError("Runtime Error".to_string()))
        );
    }

    #[test]
    fn test_runner_status_conversion() {
        assert_eq!(Status::from(RunnerStatus::Normal), Status::Accepted);
        assert_eq!(Status::from(RunnerStatus::DisallowedSyscall), Status::DangerousSyscall);
        assert_eq!(Status::from(RunnerStatus::RunnerError), Status::InternalError);
    }
}
