use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::errors::RecordError;
use super::models::{AgentSession, AgentType, Event, Finding, Run};

pub const DEFAULT_EVENT_LIMIT: usize = 200;

/// Events and findings are ordered by creation time, ties broken by id so that
/// the order never depends on arrival order.
type OrderKey = (DateTime<Utc>, String);

/// Result of offering an event to the bounded event window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMerge {
    Inserted,
    Duplicate,
    /// Older than everything retained in a full window; dropped on arrival.
    Expired,
}

/// Reconciled, in-memory state of one run. Only the reconciler mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewModel {
    run_id: String,
    run: Option<Run>,
    sessions: Vec<AgentSession>,
    session_index: HashMap<String, usize>,
    events: BTreeMap<OrderKey, Event>,
    event_keys: HashMap<String, DateTime<Utc>>,
    findings: BTreeMap<OrderKey, Finding>,
    finding_ids: HashSet<String>,
    event_limit: usize,
    revision: u64,
}

impl ViewModel {
    pub fn new(run_id: impl Into<String>, event_limit: usize) -> Self {
        Self {
            run_id: run_id.into(),
            run: None,
            sessions: Vec::new(),
            session_index: HashMap::new(),
            events: BTreeMap::new(),
            event_keys: HashMap::new(),
            findings: BTreeMap::new(),
            finding_ids: HashSet::new(),
            event_limit: event_limit.max(1),
            revision: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    /// Sessions in the order they were first seen.
    pub fn sessions(&self) -> &[AgentSession] {
        &self.sessions
    }

    pub fn session_for(&self, agent: AgentType) -> Option<&AgentSession> {
        self.sessions.iter().find(|s| s.agent_type == agent)
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &Event> + ExactSizeIterator {
        self.events.values()
    }

    /// All findings, oldest first.
    pub fn findings(&self) -> impl DoubleEndedIterator<Item = &Finding> + ExactSizeIterator {
        self.findings.values()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }

    pub fn contains_event(&self, id: &str) -> bool {
        self.event_keys.contains_key(id)
    }

    pub fn contains_finding(&self, id: &str) -> bool {
        self.finding_ids.contains(id)
    }

    pub fn event_limit(&self) -> usize {
        self.event_limit
    }

    /// Incremented on every change; two views with equal revisions from the
    /// same reconciler hold the same content.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn bump(&mut self) {
        self.revision += 1;
    }

    /// Last applied wins. Returns whether anything changed.
    pub(crate) fn replace_run(&mut self, run: Run) -> bool {
        if self.run.as_ref() == Some(&run) {
            return false;
        }
        self.run = Some(run);
        true
    }

    /// Appends an unseen session or replaces a known one in place.
    pub(crate) fn upsert_session(&mut self, session: AgentSession) -> Result<bool, RecordError> {
        if let Some(other) = self
            .sessions
            .iter()
            .find(|s| s.agent_type == session.agent_type && s.id != session.id)
        {
            return Err(RecordError::DuplicateAgentSession {
                agent: session.agent_type,
                existing: other.id.clone(),
                incoming: session.id,
            });
        }

        match self.session_index.get(&session.id) {
            Some(&idx) => {
                if self.sessions[idx] == session {
                    return Ok(false);
                }
                self.sessions[idx] = session;
            }
            None => {
                self.session_index.insert(session.id.clone(), self.sessions.len());
                self.sessions.push(session);
            }
        }
        Ok(true)
    }

    /// Inserts an event unless its id is known, then trims the window to the
    /// most recent `event_limit` events.
    pub(crate) fn insert_event(&mut self, event: Event) -> EventMerge {
        if self.event_keys.contains_key(&event.id) {
            return EventMerge::Duplicate;
        }

        let key = (event.created_at, event.id.clone());
        self.event_keys.insert(event.id.clone(), event.created_at);
        self.events.insert(key.clone(), event);

        let mut outcome = EventMerge::Inserted;
        while self.events.len() > self.event_limit {
            if let Some((evicted, _)) = self.events.pop_first() {
                self.event_keys.remove(&evicted.1);
                if evicted == key {
                    outcome = EventMerge::Expired;
                }
            }
        }
        outcome
    }

    pub(crate) fn insert_finding(&mut self, finding: Finding) -> bool {
        if !self.finding_ids.insert(finding.id.clone()) {
            return false;
        }
        self.findings
            .insert((finding.created_at, finding.id.clone()), finding);
        true
    }
}
