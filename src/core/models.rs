use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle of a whole scan run as reported by the backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    // The backend writes INITIALIZING while it is still creating sessions.
    #[serde(alias = "INITIALIZING")]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session status: the run statuses plus `Pending` for an agent with no session yet.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "PENDING",
            AgentStatus::Queued => "QUEUED",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Completed => "COMPLETED",
            AgentStatus::Failed => "FAILED",
            AgentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of scanning agents the backend can deploy.
///
/// Sessions carry the snake-case tag (`sqli`) while events and findings carry
/// the agent class name (`SQLiAgent`); both spellings parse to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentType {
    HeadersTls,
    Exposure,
    AuthAbuse,
    Xss,
    LlmAnalysis,
    Sqli,
    RedTeam,
    Custom,
}

impl AgentType {
    /// Agents shown on the coverage grid, in display order.
    pub const ALL: [AgentType; 7] = [
        AgentType::HeadersTls,
        AgentType::Exposure,
        AgentType::AuthAbuse,
        AgentType::Xss,
        AgentType::LlmAnalysis,
        AgentType::Sqli,
        AgentType::RedTeam,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            AgentType::HeadersTls => "headers_tls",
            AgentType::Exposure => "exposure",
            AgentType::AuthAbuse => "auth_abuse",
            AgentType::Xss => "xss",
            AgentType::LlmAnalysis => "llm_analysis",
            AgentType::Sqli => "sqli",
            AgentType::RedTeam => "red_team",
            AgentType::Custom => "custom",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            AgentType::HeadersTls => "HeadersAgent",
            AgentType::Exposure | AgentType::Custom => "ExposureAgent",
            AgentType::AuthAbuse => "AuthAbuseAgent",
            AgentType::Xss => "XSSAgent",
            AgentType::LlmAnalysis => "LLMAnalysisAgent",
            AgentType::Sqli => "SQLiAgent",
            AgentType::RedTeam => "RedTeamAgent",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgentType::HeadersTls => "Headers / TLS",
            AgentType::Exposure => "Exposure",
            AgentType::AuthAbuse => "Auth Abuse",
            AgentType::Xss => "XSS",
            AgentType::LlmAnalysis => "LLM Analysis",
            AgentType::Sqli => "SQL Injection",
            AgentType::RedTeam => "Red Team",
            AgentType::Custom => "Custom",
        }
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let agent = match s {
            "headers_tls" | "HeadersAgent" => AgentType::HeadersTls,
            "exposure" | "ExposureAgent" => AgentType::Exposure,
            "auth_abuse" | "AuthAbuseAgent" => AgentType::AuthAbuse,
            "xss" | "XSSAgent" => AgentType::Xss,
            "llm_analysis" | "LLMAnalysisAgent" => AgentType::LlmAnalysis,
            "sqli" | "SQLiAgent" => AgentType::Sqli,
            "red_team" | "RedTeamAgent" => AgentType::RedTeam,
            "custom" => AgentType::Custom,
            other => return Err(format!("unknown agent type '{}'", other)),
        };
        Ok(agent)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for AgentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Info,
    Warning,
    Error,
    Success,
    Screenshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Info => "INFO",
            EventType::Warning => "WARNING",
            EventType::Error => "ERROR",
            EventType::Success => "SUCCESS",
            EventType::Screenshot => "SCREENSHOT",
        }
    }
}

/// Finding severity, ordered so that `Critical` is the maximum.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl Severity {
    /// Highest first.
    pub const DESCENDING: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Weight used by both the risk and the security score.
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Info => 1,
            Severity::Low => 3,
            Severity::Medium => 8,
            Severity::High => 15,
            Severity::Critical => 25,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(alias = "target_url")]
    pub target: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque scan configuration, passed through untouched.
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
}

impl Run {
    /// `ended_at` must be present exactly when the status is terminal.
    pub fn end_consistent(&self) -> bool {
        self.status.is_terminal() == self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentSession {
    pub id: String,
    pub run_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub requests_used: u64,
    #[serde(default)]
    pub budget: u64,
}

impl AgentSession {
    pub fn over_budget(&self) -> bool {
        self.requests_used > self.budget
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub run_id: String,
    pub agent_type: AgentType,
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Image reference carried by SCREENSHOT events.
    pub fn image(&self) -> Option<&str> {
        if self.event_type != EventType::Screenshot {
            return None;
        }
        self.data.as_ref()?.get("image")?.as_str()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Highlight {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Screenshot {
    pub url: String,
    pub timestamp: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub highlight: Option<Highlight>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Finding {
    pub id: String,
    pub run_id: String,
    pub agent_type: AgentType,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub screenshots: Vec<Screenshot>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
