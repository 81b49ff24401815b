//! ProgressTable: per-transfer completion percentages.
//!
//! Keys are `(direction, peer, fileId)`; outgoing transfers use
//! [`LOCAL_PEER`] as the peer. Values only ever grow while an entry lives,
//! and an entry is removed exactly once, when its transfer ends.
//!
//! Outgoing entries cleared by a disconnect are retired until their sender
//! notices the closed channel, so a late chunk cannot resurrect them.

use crate::core::config::LOCAL_PEER;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProgressKey {
    pub direction: Direction,
    pub peer: String,
    pub file_id: String,
}

impl ProgressKey {
    pub fn incoming(peer: &str, file_id: &str) -> Self {
        Self {
            direction: Direction::Incoming,
            peer: peer.to_string(),
            file_id: file_id.to_string(),
        }
    }

    pub fn outgoing(file_id: &str) -> Self {
        Self {
            direction: Direction::Outgoing,
            peer: LOCAL_PEER.to_string(),
            file_id: file_id.to_string(),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.peer, self.file_id)
    }
}

#[derive(Debug, Default)]
pub struct ProgressTable {
    entries: HashMap<ProgressKey, f64>,
    retired: HashSet<ProgressKey>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the entry to `percent` (clamped to 0..=100). Returns the value
    /// now stored, or `None` if the update was a no-op.
    pub fn update(&mut self, key: ProgressKey, percent: f64) -> Option<f64> {
        if self.retired.contains(&key) {
            return None;
        }
        let percent = percent.clamp(0.0, 100.0);
        match self.entries.get_mut(&key) {
            Some(current) if percent <= *current => None,
            Some(current) => {
                *current = percent;
                Some(percent)
            }
            None => {
                self.entries.insert(key, percent);
                Some(percent)
            }
        }
    }

    pub fn remove(&mut self, key: &ProgressKey) -> Option<f64> {
        self.retired.remove(key);
        self.entries.remove(key)
    }

    pub fn get(&self, key: &ProgressKey) -> Option<f64> {
        self.entries.get(key).copied()
    }

    pub fn snapshot(&self) -> HashMap<ProgressKey, f64> {
        self.entries.clone()
    }

    /// Drop every incoming entry from `peer` and retire the listed
    /// outgoing transfers.
    pub fn clear_peer(&mut self, peer: &str, outgoing: &[String]) {
        self.entries.retain(|key, _| match key.direction {
            Direction::Incoming => key.peer != peer,
            Direction::Outgoing => !outgoing.contains(&key.file_id),
        });
        self.retired
            .extend(outgoing.iter().map(|id| ProgressKey::outgoing(id)));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.retired.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
