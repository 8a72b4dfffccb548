use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Primary status of an editable subject.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Pending,
    Analyzing,
    Editing,
    Draft,
    Confirmed,
    Active,
    Completed,
    Failed,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Editing => "editing",
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Statuses from which an editing session may be opened.
    pub fn can_start_editing(&self) -> bool {
        matches!(self, Self::Draft | Self::Editing | Self::Completed)
    }
}

impl FromStr for SubjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "editing" => Ok(Self::Editing),
            "draft" => Ok(Self::Draft),
            "confirmed" => Ok(Self::Confirmed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid subject status: {}", s)),
        }
    }
}

impl fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the editing session itself.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditingStatus {
    #[default]
    Idle,
    Active,
    Confirmed,
    Cancelled,
}

impl EditingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for EditingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "active" => Ok(Self::Active),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid editing status: {}", s)),
        }
    }
}

impl fmt::Display for EditingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is being configured: a reusable task or a one-off analysis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[default]
    Task,
    Analysis,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Analysis => "analysis",
        }
    }

    /// Status a subject of this kind holds outside an editing session, and
    /// the one it reverts to on cancel or expiry.
    pub fn resting_status(&self) -> SubjectStatus {
        match self {
            Self::Task => SubjectStatus::Draft,
            Self::Analysis => SubjectStatus::Completed,
        }
    }

    /// Status after a successful confirmation: ready to execute, not yet active.
    pub fn ready_status(&self) -> SubjectStatus {
        match self {
            Self::Task => SubjectStatus::Draft,
            Self::Analysis => SubjectStatus::Confirmed,
        }
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "analysis" => Ok(Self::Analysis),
            _ => Err(format!("Invalid subject kind: {}", s)),
        }
    }
}

/// Phase of a subject whose target page sits behind a login.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoginPhase {
    Login,
    LoginExecuting,
    Target,
}

impl LoginPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::LoginExecuting => "login_executing",
            Self::Target => "target",
        }
    }
}

impl FromStr for LoginPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::Login),
            "login_executing" => Ok(Self::LoginExecuting),
            "target" => Ok(Self::Target),
            _ => Err(format!("Invalid login phase: {}", s)),
        }
    }
}
