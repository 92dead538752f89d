//! Transaction admission.
//!
//! Two transactions conflict when they target the same database, their
//! scopes overlap, and at least one of them writes. Conflicting
//! transactions start in creation order; everything else runs interleaved.

use super::event_loop::Task;
use crate::types::TransactionMode;
use std::collections::VecDeque;

/// Stores a transaction may touch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Stores(Vec<String>),
    /// The whole database (version changes, deletion).
    All,
}

impl Scope {
    fn overlaps(&self, other: &Scope) -> bool {
        match (self, other) {
            (Scope::All, _) | (_, Scope::All) => true,
            (Scope::Stores(a), Scope::Stores(b)) => a.iter().any(|name| b.contains(name)),
        }
    }
}

/// What the scheduler knows about a transaction.
#[derive(Clone, Debug)]
pub(crate) struct TxTicket {
    pub id: u64,
    pub database: String,
    pub scope: Scope,
    pub mode: TransactionMode,
}

impl TxTicket {
    fn conflicts_with(&self, other: &TxTicket) -> bool {
        self.database == other.database
            && (self.mode.is_write() || other.mode.is_write())
            && self.scope.overlaps(&other.scope)
    }
}

struct Waiting {
    ticket: TxTicket,
    start: Task,
}

/// Tracks running transactions and queues blocked ones.
#[derive(Default)]
pub(crate) struct Scheduler {
    running: Vec<TxTicket>,
    waiting: VecDeque<Waiting>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction. Returns its start task if it may run now;
    /// otherwise the task is held until [`Scheduler::finish`] releases it.
    pub(crate) fn submit(&mut self, ticket: TxTicket, start: Task) -> Option<Task> {
        let blocked = self.running.iter().any(|r| r.conflicts_with(&ticket))
            || self.waiting.iter().any(|w| w.ticket.conflicts_with(&ticket));

        if blocked {
            self.waiting.push_back(Waiting { ticket, start });
            None
        } else {
            self.running.push(ticket);
            Some(start)
        }
    }

    /// Mark a transaction finished and return the tasks that may now start.
    pub(crate) fn finish(&mut self, id: u64) -> Vec<Task> {
        self.running.retain(|ticket| ticket.id != id);

        let mut ready = Vec::new();
        let mut still_waiting: VecDeque<Waiting> = VecDeque::new();

        while let Some(waiting) = self.waiting.pop_front() {
            let blocked = self
                .running
                .iter()
                .any(|r| r.conflicts_with(&waiting.ticket))
                || still_waiting
                    .iter()
                    .any(|w| w.ticket.conflicts_with(&waiting.ticket));

            if blocked {
                still_waiting.push_back(waiting);
            } else {
                self.running.push(waiting.ticket);
                ready.push(waiting.start);
            }
        }

        self.waiting = still_waiting;
        ready
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}
