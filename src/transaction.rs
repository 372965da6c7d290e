//! Per-connection MULTI/EXEC/DISCARD queues
//!
//! Each connection owns at most one transaction slot, keyed by the
//! monotonic connection ID assigned on accept. Queued commands keep
//! their original wire bytes so a SET executed by EXEC can still be
//! propagated to replicas byte-for-byte.

use std::collections::HashMap;

/// A command captured while a transaction is queuing.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub verb: String,
    pub args: Vec<String>,
    pub raw: Vec<u8>,
}

/// Transaction state for one connection.
#[derive(Debug, Default)]
pub struct Transaction {
    active: bool,
    queue: Vec<QueuedCommand>,
}

/// All transactions, keyed by connection ID.
#[derive(Debug, Default)]
pub struct TransactionTable {
    slots: HashMap<u64, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Whether the connection is currently queuing commands.
    pub fn is_queuing(&self, conn_id: u64) -> bool {
        self.slots.get(&conn_id).is_some_and(|t| t.active)
    }

    /// Activate queuing for the connection. Returns false when a
    /// transaction is already active (nested MULTI).
    pub fn begin(&mut self, conn_id: u64) -> bool {
        let slot = self.slots.entry(conn_id).or_default();
        if slot.active {
            return false;
        }
        slot.active = true;
        slot.queue.clear();
        true
    }

    /// Append a command to the connection's queue.
    pub fn enqueue(&mut self, conn_id: u64, command: QueuedCommand) {
        self.slots.entry(conn_id).or_default().queue.push(command);
    }

    /// Deactivate the transaction and hand back the queued commands in
    /// insertion order. Returns `None` when no transaction was active.
    pub fn take(&mut self, conn_id: u64) -> Option<Vec<QueuedCommand>> {
        let slot = self.slots.get_mut(&conn_id)?;
        if !slot.active {
            return None;
        }
        slot.active = false;
        Some(std::mem::take(&mut slot.queue))
    }

    /// Discard the queue. Returns false when no transaction was
    /// active.
    pub fn discard(&mut self, conn_id: u64) -> bool {
        match self.slots.get_mut(&conn_id) {
            Some(slot) if slot.active => {
                slot.active = false;
                slot.queue.clear();
                true
            }
            _ => false,
        }
    }

    /// Drop the slot entirely; called when the connection closes.
    pub fn remove(&mut self, conn_id: u64) {
        self.slots.remove(&conn_id);
    }
}
