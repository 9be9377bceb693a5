use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;

use super::{BackendActions, ReportSource, ReportStream, StartRunRequest};
use crate::core::ActionError;

#[derive(Debug, Deserialize)]
struct StartRunResponse {
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the scanning backend's HTTP API.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl BackendActions for HttpBackend {
    async fn start_run(&self, request: &StartRunRequest) -> Result<String, ActionError> {
        let response = self
            .client
            .post(self.url("/runs/start"))
            .json(request)
            .send()
            .await?;
        let body: StartRunResponse = accepted(response).await?.json().await?;
        body.run_id
            .filter(|id| !id.is_empty())
            .ok_or(ActionError::MissingRunId)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<(), ActionError> {
        let response = self
            .client
            .post(self.url(&format!("/runs/{}/cancel", run_id)))
            .send()
            .await?;
        accepted(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ReportSource for HttpBackend {
    async fn stream_report(&self, run_id: &str) -> Result<ReportStream, ActionError> {
        let response = self
            .client
            .post(self.url("/reports/generate"))
            .json(&json!({ "run_id": run_id }))
            .send()
            .await?;
        let chunks = accepted(response).await?.bytes_stream().boxed();

        let text = futures::stream::unfold(Some((chunks, Utf8Decoder::default())), |state| async move {
            let Some((mut chunks, mut decoder)) = state else {
                return None;
            };
            loop {
                match chunks.next().await {
                    Some(Ok(bytes)) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            return Some((Ok(text), Some((chunks, decoder))));
                        }
                    }
                    Some(Err(e)) => return Some((Err(ActionError::Http(e)), None)),
                    None => {
                        let rest = decoder.finish();
                        return (!rest.is_empty()).then(|| (Ok(rest), None));
                    }
                }
            }
        });
        Ok(text.boxed())
    }
}

/// Passes successful responses through; turns the rest into `Rejected`.
async fn accepted(response: Response) -> Result<Response, ActionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ActionError::Rejected {
        status: status.as_u16(),
        message: rejection_message(&body, status.canonical_reason().unwrap_or("error")),
    })
}

fn rejection_message(body: &str, fallback: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let body = body.trim();
    if body.is_empty() { fallback.to_string() } else { body.to_string() }
}

/// Decodes a UTF-8 byte stream whose chunk boundaries may split characters.
/// Incomplete trailing bytes are held back until the next chunk; invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
