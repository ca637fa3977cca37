//! Per-connection offer bookkeeping
//!
//! The pending table maps message-ids to offer records and carries the
//! backlog byte counter. One mutex guards both; every critical section is
//! O(1) apart from the state snapshots, and no callback ever runs under
//! the lock.

use std::collections::HashMap;
use std::sync::Mutex;

/// Where an offered article is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OfferState {
    /// Offered, nothing sent yet
    Queued,
    /// CHECK transmitted
    Check,
    /// Peer wants it, TAKETHIS queued or transmitted
    Takethis,
    /// ARTICLE fetch in flight (reader mode)
    Article,
}

/// One live offer
#[derive(Debug, Clone)]
pub struct OfferRecord {
    /// The offered article
    pub msgid: String,
    /// Stored size in bytes, 0 when unknown at queue time
    pub size: u64,
    /// Current lifecycle state
    pub state: OfferState,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, OfferRecord>,
    backlog: u64,
}

/// Thread-safe offer table with a running backlog counter
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the message-id has a live offer
    pub fn is_queued(&self, msgid: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(msgid)
    }

    /// Upsert an offer record
    ///
    /// An existing record only changes state; `size` is recorded (and
    /// added to the backlog) on creation alone.
    pub fn set_state(&self, msgid: &str, state: OfferState, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(msgid) {
            Some(record) => record.state = state,
            None => {
                inner.entries.insert(
                    msgid.to_string(),
                    OfferRecord {
                        msgid: msgid.to_string(),
                        size,
                        state,
                    },
                );
                inner.backlog += size;
            }
        }
    }

    /// Resolve an offer, releasing its backlog share
    pub fn set_processed(&self, msgid: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.entries.remove(msgid) {
            inner.backlog -= record.size;
        }
    }

    /// Sum of sizes over live offers
    pub fn backlog(&self) -> u64 {
        self.inner.lock().unwrap().backlog
    }

    /// Number of live offers
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether no offers are live
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Message-ids currently in `state`
    pub fn articles_in_state(&self, state: OfferState) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|record| record.state == state)
            .map(|record| record.msgid.clone())
            .collect()
    }

    /// Snapshot of every live offer's state, for status reporting
    pub fn snapshot(&self) -> Vec<(String, OfferState)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .map(|record| (record.msgid.clone(), record.state))
            .collect()
    }
}
