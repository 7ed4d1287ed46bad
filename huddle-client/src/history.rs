//! Undo/redo as an inverse-op journal.
//!
//! Each user-level mutation batch records the ops that undo it; no
//! snapshots are kept. The undo and redo stacks are bounded. While
//! paused, recorded inverses coalesce into a single entry pushed on
//! resume, newest-first so replaying the entry front-to-back unwinds the
//! whole pause.

use huddle_store::Op;

use crate::error::HistoryError;
use crate::presence::PresencePatch;

pub(crate) const HISTORY_CAP: usize = 50;

/// One undoable step: either a storage op or a presence restoration.
#[derive(Debug, Clone)]
pub(crate) enum HistoryOp {
    Storage(Op),
    Presence(PresencePatch),
}

pub(crate) type HistoryEntry = Vec<HistoryOp>;

#[derive(Debug, Default)]
pub(crate) struct History {
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    /// While `Some`, recorded batches coalesce here instead of pushing
    /// individual undo entries.
    paused: Option<HistoryEntry>,
}

impl History {
    /// Record the inverse of one mutation batch.
    pub fn record(&mut self, inverse: HistoryEntry) {
        if inverse.is_empty() {
            return;
        }
        match &mut self.paused {
            Some(buffer) => {
                // newer inverses must apply before older ones
                buffer.splice(0..0, inverse);
            }
            None => {
                self.undo.push(inverse);
                if self.undo.len() > HISTORY_CAP {
                    self.undo.remove(0);
                }
            }
        }
    }

    pub fn clear_redo(&mut self) {
        self.redo.clear();
    }

    pub fn pop_undo(&mut self) -> Result<Option<HistoryEntry>, HistoryError> {
        if self.paused.is_some() {
            return Err(HistoryError::Paused);
        }
        Ok(self.undo.pop())
    }

    pub fn pop_redo(&mut self) -> Result<Option<HistoryEntry>, HistoryError> {
        if self.paused.is_some() {
            return Err(HistoryError::Paused);
        }
        Ok(self.redo.pop())
    }

    /// Push the inverse of an undo application.
    pub fn push_redo(&mut self, entry: HistoryEntry) {
        if entry.is_empty() {
            return;
        }
        self.redo.push(entry);
        if self.redo.len() > HISTORY_CAP {
            self.redo.remove(0);
        }
    }

    /// Push the inverse of a redo application back onto undo, bypassing
    /// the pause buffer (redo is rejected while paused anyway).
    pub fn push_undo(&mut self, entry: HistoryEntry) {
        if entry.is_empty() {
            return;
        }
        self.undo.push(entry);
        if self.undo.len() > HISTORY_CAP {
            self.undo.remove(0);
        }
    }

    pub fn pause(&mut self) {
        if self.paused.is_none() {
            self.paused = Some(Vec::new());
        }
    }

    pub fn resume(&mut self) {
        if let Some(buffer) = self.paused.take() {
            if !buffer.is_empty() {
                self.undo.push(buffer);
                if self.undo.len() > HISTORY_CAP {
                    self.undo.remove(0);
                }
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn can_undo(&self) -> bool {
        self.paused.is_none() && !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        self.paused.is_none() && !self.redo.is_empty()
    }
}
