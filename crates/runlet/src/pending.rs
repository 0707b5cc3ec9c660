//! Manager-side pending-call registry.
//!
//! Shared between caller tasks (inserters) and the reader task
//! (completer). An entry is inserted before its Call frame is written and
//! removed when the matching Response arrives or when child-exit drains the
//! registry. Responses for absent ids are dropped silently.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rmpv::Value;
use tokio::sync::oneshot;

use crate::manager::CallError;

pub(crate) type CallReply = Result<Option<Value>, CallError>;

pub(crate) struct PendingCalls {
    next_id: AtomicI32,
    entries: DashMap<i32, oneshot::Sender<CallReply>>,
    /// Set once when the runner is gone; carries the drain message.
    closed: OnceLock<String>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(0),
            entries: DashMap::new(),
            closed: OnceLock::new(),
        }
    }

    /// Allocate a request id and park a completion slot for it.
    ///
    /// Ids come from an atomic increment; an id that is still live after
    /// wraparound is skipped rather than clobbered.
    pub fn register(&self) -> Result<(i32, oneshot::Receiver<CallReply>), CallError> {
        loop {
            if let Some(message) = self.closed.get() {
                return Err(CallError::Exited(message.clone()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            match self.entries.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.insert(tx);
                    // A close racing this insert must not strand the entry.
                    if let Some(message) = self.closed.get() {
                        self.entries.remove(&id);
                        return Err(CallError::Exited(message.clone()));
                    }
                    return Ok((id, rx));
                }
            }
        }
    }

    /// Complete a pending entry. Returns false for late or duplicate
    /// responses, which the caller drops silently.
    pub fn complete(&self, id: i32, reply: CallReply) -> bool {
        match self.entries.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Remove an entry whose Call frame never made it onto the stream.
    pub fn discard(&self, id: i32) {
        self.entries.remove(&id);
    }

    /// Fail every in-flight call with `message` and refuse all later
    /// registrations with the same error.
    pub fn close(&self, message: &str) {
        let _ = self.closed.set(message.to_string());
        let ids: Vec<i32> = self.entries.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.entries.remove(&id) {
                let _ = tx.send(Err(CallError::Exited(message.to_string())));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn set_next_id(&self, value: i32) {
        self.next_id.store(value, Ordering::SeqCst);
    }
}
