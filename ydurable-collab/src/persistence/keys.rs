//! Storage key layout for one document.
//!
//! ```text
//! <ns>:bytes                  unflushed byte counter (bincode u64)
//! <ns>:clock                  highest clock ever assigned (bincode u64)
//! <ns>:updates:000042         raw update, clock 42
//! <ns>:merged:000003          merged chunk, index 3
//! ```
//!
//! Numbers are zero-padded to six digits so ascending string order and
//! ascending numeric order coincide. Past 999999 the width grows and the
//! ordering no longer holds.

/// Digits used for clocks and chunk indices.
pub const PAD_WIDTH: usize = 6;

/// Namespace used when no document name is given.
pub const DEFAULT_NAMESPACE: &str = "v1:ydoc";

/// Key builder for a single document namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    ns: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeySpace {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    /// Key space for a named document: `v1:ydoc@<name>`.
    ///
    /// `%` and `:` in the name are percent-encoded, so the namespace never
    /// contains a separator and no document's keys fall under another's
    /// prefix.
    pub fn for_document(name: &str) -> Self {
        if name.is_empty() {
            Self::default()
        } else {
            Self::new(format!("{DEFAULT_NAMESPACE}@{}", escape_name(name)))
        }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Prefix covering every key of this document.
    pub fn root_prefix(&self) -> String {
        format!("{}:", self.ns)
    }

    pub fn bytes_key(&self) -> String {
        format!("{}:bytes", self.ns)
    }

    pub fn clock_key(&self) -> String {
        format!("{}:clock", self.ns)
    }

    pub fn updates_prefix(&self) -> String {
        format!("{}:updates:", self.ns)
    }

    pub fn merged_prefix(&self) -> String {
        format!("{}:merged:", self.ns)
    }

    pub fn update_key(&self, clock: u64) -> String {
        format!("{}{}", self.updates_prefix(), pad(clock))
    }

    pub fn merged_key(&self, index: u64) -> String {
        format!("{}{}", self.merged_prefix(), pad(index))
    }

    /// Clock of an update key produced by [`KeySpace::update_key`].
    pub fn parse_update_clock(&self, key: &str) -> Option<u64> {
        key.strip_prefix(self.updates_prefix().as_str())?.parse().ok()
    }

    /// Index of a chunk key produced by [`KeySpace::merged_key`].
    pub fn parse_chunk_index(&self, key: &str) -> Option<u64> {
        key.strip_prefix(self.merged_prefix().as_str())?.parse().ok()
    }
}

fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn pad(n: u64) -> String {
    format!("{n:0width$}", width = PAD_WIDTH)
}
