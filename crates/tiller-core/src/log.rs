// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only event log with random access by order and by id, optionally
//! mirrored to disk as one JSON file per event.
//!
//! Disk layout: `events/event-<zero-padded-order>-<id>.json`. Every write
//! goes to a temp file first and is atomically renamed; no event with
//! order `n + 1` becomes visible before order `n` is durable, because
//! appends are serialized and each append persists before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::event::{Event, EventId};

const EVENTS_SUBDIR: &str = "events";

#[derive(Debug)]
pub struct EventLog {
    events: Vec<Event>,
    by_id: HashMap<EventId, usize>,
    events_dir: Option<PathBuf>,
}

impl EventLog {
    /// In-memory log without persistence.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            by_id: HashMap::new(),
            events_dir: None,
        }
    }

    /// Log persisted under `<dir>/events/`. Existing events are replayed;
    /// an empty or missing directory starts a fresh log.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let events_dir = dir.join(EVENTS_SUBDIR);
        std::fs::create_dir_all(&events_dir)
            .with_context(|| format!("creating {}", events_dir.display()))?;

        let mut log = Self {
            events: Vec::new(),
            by_id: HashMap::new(),
            events_dir: None,
        };
        for event in load_events(&events_dir)? {
            let expected = log.events.len() as u64;
            if event.order != expected {
                anyhow::bail!(
                    "corrupted event log: expected order {expected}, found {} (gap or reorder)",
                    event.order
                );
            }
            if log.by_id.contains_key(&event.id) {
                anyhow::bail!("corrupted event log: duplicate event id {}", event.id);
            }
            log.by_id.insert(event.id.clone(), log.events.len());
            log.events.push(event);
        }
        log.events_dir = Some(events_dir);
        Ok(log)
    }

    /// Append an event, assigning the next dense order. The write is
    /// durable before the event becomes visible in memory.
    pub fn append(&mut self, mut event: Event) -> anyhow::Result<Event> {
        if self.by_id.contains_key(&event.id) {
            anyhow::bail!("duplicate event id {} rejected", event.id);
        }
        event.order = self.events.len() as u64;

        if let Some(events_dir) = &self.events_dir {
            let path = events_dir.join(event_file_name(&event));
            let bytes = serde_json::to_vec_pretty(&event)?;
            write_atomic(&path, &bytes)
                .with_context(|| format!("persisting event {}", event.order))?;
        }

        self.by_id.insert(event.id.clone(), self.events.len());
        self.events.push(event.clone());
        Ok(event)
    }

    pub fn get(&self, order: u64) -> Option<&Event> {
        self.events.get(order as usize)
    }

    pub fn find(&self, id: &str) -> Option<&Event> {
        self.by_id.get(id).map(|&i| &self.events[i])
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Ordered copy for reads outside the conversation lock.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.clone()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn event_file_name(event: &Event) -> String {
    format!("event-{:06}-{}.json", event.order, event.id)
}

fn load_events(events_dir: &Path) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::new();
    for entry in std::fs::read_dir(events_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let event: Event = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        events.push(event);
    }
    events.sort_by_key(|e| e.order);
    Ok(events)
}

/// Write via temp file + rename in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
