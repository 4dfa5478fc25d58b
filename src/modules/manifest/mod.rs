//! Request manifest: an audit ledger with one entry per top-level dispatch.
//!
//! Entries are kept most-recent-first. Retries inside a dispatch mutate the
//! same entry; they never open a new one. The ledger is bounded and evicts
//! its oldest entries once full.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;
use url::Url;

use crate::transport::FailureKind;

pub const DEFAULT_MANIFEST_CAPACITY: usize = 1000;

/// Opaque reference to an entry opened by [`ManifestRecorder::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u64);

/// Summary of the response that closed an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestResponse {
    pub status: u16,
    pub url: Url,
    pub domain: Option<String>,
    pub content_length: usize,
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub id: u64,
    pub method: Method,
    pub url: Url,
    pub payload_size: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub roundtrip: Option<Duration>,
    pub errors: Vec<FailureKind>,
    pub attempt_count: u32,
    pub proxy: Option<String>,
    /// `None` while the dispatch is in flight.
    pub success: Option<bool>,
    pub response: Option<ManifestResponse>,
}

impl ManifestEntry {
    pub fn is_open(&self) -> bool {
        self.success.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ManifestRecorder {
    entries: VecDeque<ManifestEntry>,
    capacity: usize,
    next_id: u64,
}

impl ManifestRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Opens a fresh entry at the front of the ledger.
    pub fn open(&mut self, method: Method, url: Url, payload_size: usize) -> EntryHandle {
        let id = self.next_id;
        self.next_id += 1;

        self.entries.push_front(ManifestEntry {
            id,
            method,
            url,
            payload_size,
            started_at: Utc::now(),
            ended_at: None,
            roundtrip: None,
            errors: Vec::new(),
            attempt_count: 1,
            proxy: None,
            success: None,
            response: None,
        });

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                log::debug!("manifest full, evicting entry {}", evicted.id);
            }
        }

        EntryHandle(id)
    }

    pub fn record_error(&mut self, handle: EntryHandle, kind: FailureKind) {
        if let Some(entry) = self.open_entry_mut(handle) {
            entry.errors.push(kind);
        }
    }

    pub fn set_attempts(&mut self, handle: EntryHandle, attempts: u32) {
        if let Some(entry) = self.open_entry_mut(handle) {
            entry.attempt_count = attempts;
        }
    }

    pub fn set_proxy(&mut self, handle: EntryHandle, proxy: Option<String>) {
        if let Some(entry) = self.open_entry_mut(handle) {
            entry.proxy = proxy;
        }
    }

    /// Finalizes an entry. Returns false when the entry was already closed or
    /// has been evicted.
    pub fn close(
        &mut self,
        handle: EntryHandle,
        response: Option<ManifestResponse>,
        roundtrip: Duration,
        success: bool,
    ) -> bool {
        let Some(entry) = self.open_entry_mut(handle) else {
            log::warn!("manifest entry {} closed twice or evicted", handle.0);
            return false;
        };

        entry.ended_at = Some(Utc::now());
        entry.roundtrip = Some(roundtrip);
        entry.response = response;
        entry.success = Some(success);
        true
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.id == handle.0)
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&ManifestEntry> {
        self.entries.front()
    }

    /// Entries, most recent first.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn open_entry_mut(&mut self, handle: EntryHandle) -> Option<&mut ManifestEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == handle.0 && entry.is_open())
    }
}

impl Default for ManifestRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_CAPACITY)
    }
}
