use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::{ChannelItem, Subscription, UpdateChannel, record_run_id};
use crate::core::{Notification, SourceError};

#[derive(Debug, Clone)]
enum LineSource {
    Stdin,
    File(PathBuf),
}

/// Update channel fed by newline-delimited JSON notifications.
///
/// Each line holds one notification, e.g.
/// `{"table":"findings","type":"INSERT","record":{...}}`. Blank lines and
/// lines starting with `#` are skipped. Notifications for other runs are
/// filtered out before delivery.
#[derive(Debug, Clone)]
pub struct JsonLinesChannel {
    source: LineSource,
}

impl JsonLinesChannel {
    pub fn stdin() -> Self {
        Self { source: LineSource::Stdin }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: LineSource::File(path.into()),
        }
    }

    /// `-` selects stdin, anything else is a file path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" { Self::stdin() } else { Self::file(arg) }
    }
}

#[async_trait]
impl UpdateChannel for JsonLinesChannel {
    async fn subscribe(&self, run_id: &str) -> Result<Subscription, SourceError> {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &self.source {
            LineSource::Stdin => Box::new(BufReader::new(tokio::io::stdin())),
            LineSource::File(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        };

        let (tx, rx) = mpsc::channel(256);
        let pump = tokio::spawn(pump_lines(reader, tx, run_id.to_string()));
        Ok(Subscription::new(rx, Some(pump)))
    }

    fn resumable(&self) -> bool {
        false
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<ChannelItem>, run_id: String)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let item = match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Some(Ok(n)) if record_run_id(&n).is_some_and(|id| id != run_id) => continue,
                Some(item) => item,
                None => continue,
            },
            Ok(None) => break,
            Err(e) => Err(SourceError::Io(e)),
        };
        let broken = matches!(item, Err(SourceError::Io(_)));
        if tx.send(item).await.is_err() || broken {
            break;
        }
    }
    tracing::debug!(run = %run_id, "json-lines feed ended");
}

pub fn parse_line(line: &str) -> Option<ChannelItem> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(
        serde_json::from_str::<Notification>(line)
            .map_err(|e| SourceError::Decode(format!("bad notification line: {}", e))),
    )
}
