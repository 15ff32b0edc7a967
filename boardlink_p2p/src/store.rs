// In-memory match storage owned by the host.
//
// `MatchStore` keeps one `MatchRecord` per match: the initial state, the
// current state (replaced wholesale on every accepted action), the
// append-only delta log and the roster metadata. The host is the only reader
// and writer, and it runs single-threaded, so there is no locking here and
// every read observes the latest write. Authentication reads the roster
// straight from the store on every call (see `auth.rs`).
//
// Nothing is persisted: records live exactly as long as the host.

use std::collections::HashMap;

use boardlink_protocol::message::MatchMetadata;
use boardlink_protocol::types::MatchId;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown match: {0}")]
    UnknownMatch(MatchId),
}

/// Everything stored for one match.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchRecord {
    pub initial_state: Value,
    pub state: Value,
    pub log: Vec<Value>,
    pub metadata: MatchMetadata,
}

/// Options for `MatchStore::create_match`.
#[derive(Clone, Debug)]
pub struct NewMatch {
    pub initial_state: Value,
    pub metadata: MatchMetadata,
}

#[derive(Debug, Default)]
pub struct MatchStore {
    records: HashMap<MatchId, MatchRecord>,
    /// Creation order, for `list_matches`.
    order: Vec<MatchId>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a match. The current state starts as the initial
    /// state and the log starts empty.
    pub fn create_match(&mut self, match_id: MatchId, new_match: NewMatch) {
        let record = MatchRecord {
            state: new_match.initial_state.clone(),
            initial_state: new_match.initial_state,
            log: Vec::new(),
            metadata: new_match.metadata,
        };
        if self.records.insert(match_id.clone(), record).is_none() {
            self.order.push(match_id);
        }
    }

    pub fn fetch(&self, match_id: &MatchId) -> Result<&MatchRecord, StoreError> {
        self.records
            .get(match_id)
            .ok_or_else(|| StoreError::UnknownMatch(match_id.clone()))
    }

    /// Replace the current state and append `deltalog`, if any, to the log.
    pub fn set_state(
        &mut self,
        match_id: &MatchId,
        state: Value,
        deltalog: Option<Vec<Value>>,
    ) -> Result<(), StoreError> {
        let record = self.record_mut(match_id)?;
        record.state = state;
        if let Some(entries) = deltalog {
            record.log.extend(entries);
        }
        Ok(())
    }

    pub fn set_metadata(
        &mut self,
        match_id: &MatchId,
        metadata: MatchMetadata,
    ) -> Result<(), StoreError> {
        self.record_mut(match_id)?.metadata = metadata;
        Ok(())
    }

    /// Drop every trace of a match. Returns the removed record.
    pub fn wipe(&mut self, match_id: &MatchId) -> Option<MatchRecord> {
        let removed = self.records.remove(match_id)?;
        self.order.retain(|id| id != match_id);
        Some(removed)
    }

    /// Ids of all stored matches, oldest first.
    pub fn list_matches(&self) -> Vec<MatchId> {
        self.order.clone()
    }

    fn record_mut(&mut self, match_id: &MatchId) -> Result<&mut MatchRecord, StoreError> {
        self.records
            .get_mut(match_id)
            .ok_or_else(|| StoreError::UnknownMatch(match_id.clone()))
    }
}
