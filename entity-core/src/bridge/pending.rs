//! Process-wide table of frontend tool calls waiting for their result

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::ids::WaitId;

#[derive(Debug)]
enum Outcome {
    Resolved(Value),
    Rejected(String),
}

struct Entry {
    tool_name: String,
    created_at: Instant,
    sender: oneshot::Sender<Outcome>,
}

/// Wait id -> suspended tool call.
///
/// Shared through `Arc` between the handler that suspends a tool call and the
/// handler that later delivers its result. Entries live in this process only.
#[derive(Default)]
pub struct PendingToolCalls {
    entries: Mutex<HashMap<WaitId, Entry>>,
}

impl PendingToolCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WaitId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a wait entry under a fresh wait id
    pub fn register(self: &Arc<Self>, tool_name: &str) -> PendingCall {
        let wait_id = WaitId::for_tool(tool_name);
        let (sender, receiver) = oneshot::channel();
        self.entries().insert(
            wait_id.clone(),
            Entry {
                tool_name: tool_name.to_string(),
                created_at: Instant::now(),
                sender,
            },
        );
        tracing::debug!(wait_id = %wait_id, tool = tool_name, "Registered pending tool call");
        PendingCall {
            wait_id,
            receiver,
            owner: Arc::clone(self),
        }
    }

    fn complete(&self, wait_id: &WaitId, outcome: Outcome) -> bool {
        let Some(entry) = self.entries().remove(wait_id) else {
            tracing::debug!(wait_id = %wait_id, "No pending tool call for result, ignoring");
            return false;
        };
        tracing::debug!(wait_id = %wait_id, tool = %entry.tool_name, "Delivering tool result");
        // The waiter may have gone away between removal and send
        entry.sender.send(outcome).is_ok()
    }

    /// Fulfil a waiting call; unknown or already-settled ids return false
    pub fn resolve(&self, wait_id: &WaitId, value: Value) -> bool {
        self.complete(wait_id, Outcome::Resolved(value))
    }

    pub fn reject(&self, wait_id: &WaitId, message: impl Into<String>) -> bool {
        self.complete(wait_id, Outcome::Rejected(message.into()))
    }

    /// Drop the entry; its waiter fails with `ToolCancelled`
    pub fn cancel(&self, wait_id: &WaitId) -> bool {
        self.entries().remove(wait_id).is_some()
    }

    /// Cancel every entry older than `max_age`, returning how many were dropped
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|wait_id, entry| {
            let keep = entry.created_at.elapsed() < max_age;
            if !keep {
                tracing::warn!(wait_id = %wait_id, tool = %entry.tool_name, "Dropping abandoned tool call");
            }
            keep
        });
        before - entries.len()
    }

    pub fn contains(&self, wait_id: &WaitId) -> bool {
        self.entries().contains_key(wait_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Receiving side of one wait entry; dropping it removes the entry
pub struct PendingCall {
    wait_id: WaitId,
    receiver: oneshot::Receiver<Outcome>,
    owner: Arc<PendingToolCalls>,
}

impl PendingCall {
    pub fn wait_id(&self) -> &WaitId {
        &self.wait_id
    }

    /// Suspend until the result is delivered, the entry is cancelled, or `timeout` elapses
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(Outcome::Resolved(value))) => Ok(value),
            Ok(Ok(Outcome::Rejected(message))) => Err(EngineError::ToolFailed(message)),
            Ok(Err(_)) => Err(EngineError::ToolCancelled(self.wait_id.to_string())),
            Err(_) => {
                tracing::warn!(wait_id = %self.wait_id, "Frontend tool call timed out");
                Err(EngineError::ToolTimeout {
                    wait_id: self.wait_id.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.owner.entries().remove(&self.wait_id);
    }
}
