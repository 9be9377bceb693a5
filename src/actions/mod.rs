//! Outbound requests to the scanning backend. Their effects are never applied
//! locally: a started or cancelled run shows up through the data sources.

pub mod http;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ActionError;
use crate::core::models::{AgentSession, AgentType, Run};
use crate::sources::SnapshotSource;

pub use http::HttpBackend;

/// Agents deployed when a start request names none.
pub const DEFAULT_AGENTS: [AgentType; 7] = [
    AgentType::Exposure,
    AgentType::HeadersTls,
    AgentType::AuthAbuse,
    AgentType::LlmAnalysis,
    AgentType::Sqli,
    AgentType::Xss,
    AgentType::RedTeam,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Credentials,
    Token,
}

/// How the agents authenticate against the target, plus free-form guidance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfiguration {
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ScanConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self.auth_type {
            AuthType::Credentials if !present(&self.username) => {
                Err("credentials auth requires a username".to_string())
            }
            AuthType::Token if !present(&self.token) => Err("token auth requires a token".to_string()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartRunRequest {
    pub target_url: String,
    pub agents: Vec<AgentType>,
    /// Passed through opaquely; a re-run replays whatever the prior run stored.
    pub configuration: Value,
}

impl StartRunRequest {
    pub fn new(
        target_url: &str,
        agents: Vec<AgentType>,
        configuration: &ScanConfiguration,
    ) -> Result<Self, String> {
        let target_url = target_url.trim();
        let parsed = reqwest::Url::parse(target_url).map_err(|e| format!("invalid target url: {}", e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("target url must be http or https, got {}", parsed.scheme()));
        }
        configuration.validate()?;

        Ok(Self {
            target_url: target_url.to_string(),
            agents: if agents.is_empty() { DEFAULT_AGENTS.to_vec() } else { dedup(agents) },
            configuration: serde_json::to_value(configuration).map_err(|e| e.to_string())?,
        })
    }
}

pub type ReportStream = BoxStream<'static, Result<String, ActionError>>;

#[async_trait]
pub trait BackendActions: Send + Sync {
    /// Returns the id of the new run.
    async fn start_run(&self, request: &StartRunRequest) -> Result<String, ActionError>;
    async fn cancel_run(&self, run_id: &str) -> Result<(), ActionError>;
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Report text in arrival order, chunked arbitrarily.
    async fn stream_report(&self, run_id: &str) -> Result<ReportStream, ActionError>;
}

/// Rebuilds the start request of a prior run from what the snapshot source
/// knows about it: target, stored configuration and the agents it deployed.
pub async fn rerun_request(
    snapshots: &dyn SnapshotSource,
    run_id: &str,
) -> Result<StartRunRequest, ActionError> {
    let snapshot = snapshots.fetch(run_id, 1).await?;
    let run: Run = snapshot
        .run
        .and_then(|raw| serde_json::from_value(raw).ok())
        .ok_or_else(|| ActionError::UnknownRun(run_id.to_string()))?;

    let agents: Vec<AgentType> = snapshot
        .agent_sessions
        .into_iter()
        .filter_map(|raw| serde_json::from_value::<AgentSession>(raw).ok())
        .map(|s| s.agent_type)
        .collect();

    Ok(StartRunRequest {
        target_url: run.target,
        agents: if agents.is_empty() { DEFAULT_AGENTS.to_vec() } else { dedup(agents) },
        configuration: run.configuration.unwrap_or_else(|| Value::Object(Default::default())),
    })
}

pub async fn rerun(
    snapshots: &dyn SnapshotSource,
    backend: &dyn BackendActions,
    run_id: &str,
) -> Result<String, ActionError> {
    let request = rerun_request(snapshots, run_id).await?;
    tracing::info!(previous = run_id, target = %request.target_url, agents = request.agents.len(), "re-running scan");
    backend.start_run(&request).await
}

fn dedup(agents: Vec<AgentType>) -> Vec<AgentType> {
    let mut seen = Vec::with_capacity(agents.len());
    for agent in agents {
        if !seen.contains(&agent) {
            seen.push(agent);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{AgentStatus, RunStatus};
    use crate::core::state::fixtures::*;
    use crate::core::{EntityKind, Notification};
    use crate::sources::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<StartRunRequest>>,
    }

    #[async_trait]
    impl BackendActions for Recorder {
        async fn start_run(&self, request: &StartRunRequest) -> Result<String, ActionError> {
            self.started.lock().unwrap().push(request.clone());
            Ok("run-2".to_string())
        }

        async fn cancel_run(&self, _run_id: &str) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[test]
    fn start_request_serializes_like_the_backend_expects() {
        let config = ScanConfiguration {
            auth_type: AuthType::Token,
            token: Some("t0k".to_string()),
            ..ScanConfiguration::default()
        };
        let request = StartRunRequest::new(
            " https://shop.test ",
            vec![AgentType::Sqli, AgentType::Xss, AgentType::Sqli],
            &config,
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "target_url": "https://shop.test",
                "agents": ["sqli", "xss"],
                "configuration": {"auth_type": "token", "token": "t0k"},
            })
        );
    }

    #[test]
    fn empty_agent_list_deploys_the_default_set() {
        let request = StartRunRequest::new("http://a.test", vec![], &ScanConfiguration::default()).unwrap();
        assert_eq!(request.agents, DEFAULT_AGENTS.to_vec());
    }

    #[test]
    fn invalid_requests_are_refused() {
        let none = ScanConfiguration::default();
        assert!(StartRunRequest::new("not a url", vec![], &none).is_err());
        assert!(StartRunRequest::new("ftp://a.test", vec![], &none).is_err());

        let creds = ScanConfiguration {
            auth_type: AuthType::Credentials,
            ..ScanConfiguration::default()
        };
        assert!(StartRunRequest::new("https://a.test", vec![], &creds).is_err());
    }

    #[tokio::test]
    async fn rerun_reuses_target_configuration_and_agents() {
        let backend = MemoryBackend::new();
        let mut prior = run(RunStatus::Completed);
        prior.configuration = Some(json!({"auth_type": "credentials", "username": "admin"}));
        backend.write(Notification::insert(EntityKind::Run, &prior));
        for (id, agent) in [("s1", AgentType::Sqli), ("s2", AgentType::HeadersTls)] {
            backend.write(Notification::insert(
                EntityKind::AgentSession,
                &session(id, agent, AgentStatus::Completed, 100),
            ));
        }

        let recorder = Recorder::default();
        let new_id = rerun(&backend, &recorder, RUN).await.unwrap();

        assert_eq!(new_id, "run-2");
        let started = recorder.started.lock().unwrap();
        assert_eq!(started[0].target_url, "https://target.test");
        assert_eq!(started[0].agents, vec![AgentType::Sqli, AgentType::HeadersTls]);
        assert_eq!(started[0].configuration["username"], "admin");
    }

    #[tokio::test]
    async fn rerun_of_unknown_run_fails() {
        let backend = MemoryBackend::new();
        let err = rerun_request(&backend, "missing").await.unwrap_err();
        assert!(matches!(err, ActionError::UnknownRun(id) if id == "missing"));
    }
}
