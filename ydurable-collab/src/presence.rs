//! Presence (awareness) state shared by the clients of one document.
//!
//! Every client publishes an ephemeral JSON state (cursor, user name,
//! selection) under its numeric client id. Entries carry a per-client
//! clock; the highest clock wins, and a `null` state at the current clock
//! marks the client as gone.
//!
//! ## Architecture
//!
//! ```text
//! kind=1 frame ──► Presence::apply_update() ──► PresenceChange
//!                        │                      { added, updated, removed }
//!                        ▼                              │
//!                  states + meta                        ▼
//!                        │                  Presence::encode_update(ids)
//!   every 3s             ▼                              │
//!   prune_outdated() ──► remove_states()                ▼
//!                                              broadcast to all peers
//! ```
//!
//! Wire format of a presence update:
//! ```text
//! varuint count, then per entry: varuint client_id │ varuint clock │ varstring json
//! ```
//!
//! Nothing here is persisted.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

/// Numeric presence client id (the CRDT client id of the peer).
pub type ClientId = u64;

/// Entries not refreshed within this window are dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the owner should call [`Presence::prune_outdated`].
pub const CHECK_INTERVAL: Duration = Duration::from_secs(3);

// ───────────────────────────────────────────────────────────────────
// Wire entries
// ───────────────────────────────────────────────────────────────────

/// One `(client id, clock, state)` tuple of a presence update.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub clock: u32,
    /// `None` announces that the client left
    pub state: Option<Value>,
}

impl PresenceEntry {
    pub fn new(client_id: ClientId, clock: u32, state: Option<Value>) -> Self {
        Self {
            client_id,
            clock,
            state,
        }
    }

    /// Encode a list of entries as one presence update.
    pub fn encode_all(entries: &[PresenceEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(entries.len() as u64);
        for entry in entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            let json = entry.state.as_ref().map_or_else(|| "null".to_string(), Value::to_string);
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode_all(bytes: &[u8]) -> Result<Vec<PresenceEntry>, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let count: u64 = cursor.read_var()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id: u64 = cursor.read_var()?;
            let clock: u32 = cursor.read_var()?;
            let json = cursor.read_string()?;
            let state: Value = serde_json::from_str(json)
                .map_err(|e| ProtocolError::InvalidAwareness(e.to_string()))?;
            let state = if state.is_null() { None } else { Some(state) };
            entries.push(PresenceEntry::new(client_id, clock, state));
        }
        Ok(entries)
    }
}

// ───────────────────────────────────────────────────────────────────
// Change sets
// ───────────────────────────────────────────────────────────────────

/// Client ids touched by one presence operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn removed(removed: Vec<ClientId>) -> Self {
        Self {
            removed,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// `added ++ updated ++ removed`, the ids to re-broadcast.
    pub fn all(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u32,
    last_updated: Instant,
}

/// Presence states of all clients of one document.
///
/// Clock metadata outlives removed states so a stale re-delivery of an
/// old entry cannot resurrect a client.
#[derive(Debug)]
pub struct Presence {
    states: BTreeMap<ClientId, Value>,
    meta: BTreeMap<ClientId, Meta>,
    timeout: Duration,
}

impl Default for Presence {
    fn default() -> Self {
        Self::with_timeout(OUTDATED_TIMEOUT)
    }
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            states: BTreeMap::new(),
            meta: BTreeMap::new(),
            timeout,
        }
    }

    pub fn state(&self, client_id: ClientId) -> Option<&Value> {
        self.states.get(&client_id)
    }

    /// Ids with a live state, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.states.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current clock of `client_id`, including removed clients.
    pub fn clock(&self, client_id: ClientId) -> Option<u32> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    pub fn apply_update(&mut self, update: &[u8]) -> Result<PresenceChange, ProtocolError> {
        self.apply_update_at(update, Instant::now())
    }

    /// Apply a remote presence update received at `now`.
    ///
    /// The whole update is decoded before any entry is applied.
    pub fn apply_update_at(
        &mut self,
        update: &[u8],
        now: Instant,
    ) -> Result<PresenceChange, ProtocolError> {
        let entries = PresenceEntry::decode_all(update)?;
        let mut change = PresenceChange::default();

        for entry in entries {
            let id = entry.client_id;
            let known = self.meta.get(&id).copied();
            let current_clock = known.map_or(0, |m| m.clock);
            let live = self.states.contains_key(&id);

            let newer = current_clock < entry.clock;
            let leave_at_same_clock =
                current_clock == entry.clock && entry.state.is_none() && live;
            if !(newer || leave_at_same_clock) {
                continue;
            }

            let is_leave = entry.state.is_none();
            match entry.state {
                Some(state) => {
                    self.states.insert(id, state);
                }
                None => {
                    self.states.remove(&id);
                }
            }
            self.meta.insert(
                id,
                Meta {
                    clock: entry.clock,
                    last_updated: now,
                },
            );

            match (known.is_some(), is_leave) {
                (false, false) => change.added.push(id),
                (true, true) => change.removed.push(id),
                (true, false) => change.updated.push(id),
                (false, true) => {}
            }
        }
        Ok(change)
    }

    /// Drop the states of `clients`, keeping their clocks. Returns the ids
    /// that actually had a state.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        clients
            .iter()
            .copied()
            .filter(|id| self.states.remove(id).is_some())
            .collect()
    }

    /// Remove clients whose entry is older than the timeout.
    pub fn prune_outdated(&mut self, now: Instant) -> Vec<ClientId> {
        let outdated: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(id, meta)| {
                self.states.contains_key(*id)
                    && now.saturating_duration_since(meta.last_updated) >= self.timeout
            })
            .map(|(id, _)| *id)
            .collect();
        if !outdated.is_empty() {
            log::debug!("Presence timeout for clients {outdated:?}");
        }
        self.remove_states(&outdated)
    }

    /// Encode the current entries of `clients`; removed clients are sent
    /// as `null` at their last clock.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let entries: Vec<PresenceEntry> = clients
            .iter()
            .filter_map(|id| {
                let meta = self.meta.get(id)?;
                Some(PresenceEntry::new(*id, meta.clock, self.states.get(id).cloned()))
            })
            .collect();
        PresenceEntry::encode_all(&entries)
    }
}
