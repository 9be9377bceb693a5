use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::SnapshotSource;
use crate::core::{Snapshot, SourceError};

/// Snapshot source backed by the PostgREST API in front of the scan database.
pub struct RestSnapshotSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestSnapshotSource {
    /// Every request gives up after `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn select(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>, SourceError> {
        let url = self.table_url(table);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        match response.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            other => Err(SourceError::Decode(format!(
                "expected an array of rows from {}, got {}",
                table,
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, run_id: &str, event_limit: usize) -> Result<Snapshot, SourceError> {
        let by_run = format!("eq.{}", run_id);
        let all = || ("select", "*".to_string());
        let runs_query = [all(), ("id", by_run.clone())];
        let sessions_query = [all(), ("run_id", by_run.clone())];
        let events_query = [
            all(),
            ("run_id", by_run.clone()),
            ("order", "created_at.desc".to_string()),
            ("limit", event_limit.to_string()),
        ];
        let findings_query = [all(), ("run_id", by_run), ("order", "created_at.asc".to_string())];

        let (runs, agent_sessions, run_events, findings) = tokio::try_join!(
            self.select("security_runs", &runs_query),
            self.select("agent_sessions", &sessions_query),
            self.select("run_events", &events_query),
            self.select("findings", &findings_query),
        )?;

        tracing::debug!(
            run = run_id,
            sessions = agent_sessions.len(),
            events = run_events.len(),
            findings = findings.len(),
            "snapshot fetched"
        );

        Ok(Snapshot {
            run: runs.into_iter().next(),
            agent_sessions,
            run_events,
            findings,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalised() {
        let source =
            RestSnapshotSource::new("http://localhost:54321/rest/v1/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.table_url("findings"),
            "http://localhost:54321/rest/v1/findings"
        );
    }

    #[test]
    fn describes_unexpected_payloads() {
        assert_eq!(json_kind(&serde_json::json!({"message": "denied"})), "an object");
        assert_eq!(json_kind(&Value::Null), "null");
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let source =
            RestSnapshotSource::new(format!("http://{}/rest/v1", addr), None, Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let err = source.fetch("run-1", 10).await.unwrap_err();

        assert!(matches!(err, SourceError::Http(ref e) if e.is_timeout()), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
