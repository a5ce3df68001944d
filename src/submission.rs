use std::fmt;
use std::str::FromStr;

use anyhow::{Error, bail};
use serde::{Deserialize, Serialize};

pub type SubmissionId = i64;

/// Coarse lifecycle stage of a submission
///
/// Ordered: a submission only ever moves forward, `Pending -> Running -> Done`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pending,
    Running,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Done
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            other => bail!("Unknown submission status `{other}`"),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of a judged submission
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompileError,
}

impl Verdict {
    /// Short code persisted in the database and returned to pollers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Accepted => "AC",
            Self::WrongAnswer => "WA",
            Self::TimeLimitExceeded => "TLE",
            Self::MemoryLimitExceeded => "MLE",
            Self::RuntimeError => "RE",
            Self::CompileError => "CE",
        }
    }
}

impl FromStr for Verdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AC" => Ok(Self::Accepted),
            "WA" => Ok(Self::WrongAnswer),
            "TLE" => Ok(Self::TimeLimitExceeded),
            "MLE" => Ok(Self::MemoryLimitExceeded),
            "RE" => Ok(Self::RuntimeError),
            "CE" => Ok(Self::CompileError),
            other => bail!("Unknown verdict code `{other}`"),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::CompileError => "Compile Error",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub source_code: String,
    pub language: String,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub status: Status,
    pub verdict: Option<Verdict>,
    pub diagnostic_text: Option<String>,
    pub created_time: String,
}

/// Fields supplied by the submitter; everything else starts at its default
#[derive(Debug, Clone, Copy)]
pub struct NewSubmission<'a> {
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: &'a str,
    pub source_code: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub order_index: i64,
    pub input: String,
    pub expected_output: String,
    pub is_sample: bool,
}

/// Resource limits of a problem
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: Option<u64>,
}

/// Everything the dispatcher needs to judge one claimed submission
#[derive(Debug, Clone)]
pub struct JudgeContext {
    pub submission: Submission,
    pub limits: Limits,
    /// Sorted by ascending `order_index`
    pub test_cases: Vec<TestCase>,
}

/// What a poller gets back for a submission id
///
/// Verdict and diagnostic text are only exposed once the submission is done.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatusView {
    InProgress {
        status: Status,
    },
    Done {
        status: Status,
        verdict: Verdict,
        diagnostic_text: Option<String>,
    },
}

impl StatusView {
    pub fn status(&self) -> Status {
        match self {
            Self::InProgress { status } | Self::Done { status, .. } => *status,
        }
    }
}

impl From<&Submission> for StatusView {
    fn from(submission: &Submission) -> Self {
        match (submission.status, submission.verdict) {
            (Status::Done, Some(verdict)) => Self::Done {
                status: Status::Done,
                verdict,
                diagnostic_text: submission.diagnostic_text.clone(),
            },
            (status, _) => Self::InProgress { status },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn submission(status: Status, verdict: Option<Verdict>) -> Submission {
        Submission {
            id: 7,
            source_code: String::new(),
            language: "python".to_string(),
            problem_id: 1,
            contest_id: None,
            status,
            verdict,
            diagnostic_text: Some("boom".to_string()),
            created_time: crate::create_timestamp(),
        }
    }

    #[test]
    fn status_order_follows_lifecycle() {
        assert!(Status::Pending < Status::Running);
        assert!(Status::Running < Status::Done);
        assert!(Status::Done.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn codes_parse_back() {
        for verdict in [
            Verdict::Accepted,
            Verdict::WrongAnswer,
            Verdict::TimeLimitExceeded,
            Verdict::MemoryLimitExceeded,
            Verdict::RuntimeError,
            Verdict::CompileError,
        ] {
            assert_eq!(verdict.code().parse::<Verdict>().unwrap(), verdict);
        }
        assert!("OK".parse::<Verdict>().is_err());
        assert_eq!("RUNNING".parse::<Status>().unwrap(), Status::Running);
    }

    #[test]
    fn status_view_hides_verdict_until_done() {
        let running = StatusView::from(&submission(Status::Running, None));
        assert_eq!(serde_json::to_value(&running).unwrap(), json!({"status": "RUNNING"}));

        let done = StatusView::from(&submission(Status::Done, Some(Verdict::RuntimeError)));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"status": "DONE", "verdict": "RE", "diagnostic_text": "boom"})
        );
    }
}
