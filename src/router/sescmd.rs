//! Session command history
//!
//! Session commands (SET, USE, COM_INIT_DB) change connection state, so every
//! backend the session uses must execute them. Connections opened later get
//! the history replayed before their first statement.

use std::collections::VecDeque;

use tracing::warn;

use crate::protocol::Packet;

#[derive(Debug, Clone)]
pub struct SescmdEntry {
    pub id: u64,
    pub packet: Packet,
    /// Outcome of the first reply, None until it arrives
    pub ok: Option<bool>,
}

/// How a reply compares with the first reply to the same command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SescmdCheck {
    First,
    Match,
    Mismatch,
}

#[derive(Debug)]
pub struct SescmdHistory {
    entries: VecDeque<SescmdEntry>,
    max_len: usize,
    next_id: u64,
    pruned: bool,
}

impl SescmdHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
            next_id: 1,
            pruned: false,
        }
    }

    /// Record a new command, returns its id
    pub fn add(&mut self, packet: Packet) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(SescmdEntry {
            id,
            packet,
            ok: None,
        });

        if self.entries.len() > self.max_len {
            if !self.pruned {
                warn!(
                    max = self.max_len,
                    "Session command history limit reached, dropping the oldest commands"
                );
                self.pruned = true;
            }
            self.entries.pop_front();
        }
        id
    }

    /// Compare a reply outcome with the recorded one, recording it if first
    pub fn check(&mut self, id: u64, ok: bool) -> SescmdCheck {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => match entry.ok {
                None => {
                    entry.ok = Some(ok);
                    SescmdCheck::First
                }
                Some(expected) if expected == ok => SescmdCheck::Match,
                Some(_) => SescmdCheck::Mismatch,
            },
            // Pruned before the reply arrived
            None => SescmdCheck::Match,
        }
    }

    pub fn result(&self, id: u64) -> Option<bool> {
        self.entries.iter().find(|e| e.id == id).and_then(|e| e.ok)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SescmdEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pruned = false;
    }
}
