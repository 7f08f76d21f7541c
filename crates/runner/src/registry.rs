//! Per-conversation run state and task memory.

use std::{collections::VecDeque, sync::Arc};

use dashmap::{DashMap, DashSet, mapref::entry::Entry};

/// One finished task remembered for a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub task: String,
    pub result: String,
}

#[derive(Debug, Default)]
struct ConversationState {
    running: bool,
    memory: VecDeque<MemoryEntry>,
}

/// Shared across the inbound handler and every task worker. Cloning is
/// cheap and yields a handle to the same state.
#[derive(Debug, Clone)]
pub struct ConversationRegistry {
    conversations: Arc<DashMap<String, ConversationState>>,
    memory_limit: usize,
}

impl ConversationRegistry {
    #[must_use]
    pub fn new(memory_limit: usize) -> Self {
        Self {
            conversations: Arc::new(DashMap::new()),
            memory_limit,
        }
    }

    /// Mark `conversation_id` as running unless it already is.
    ///
    /// Check and set happen under the shard lock, so concurrent callers for
    /// the same conversation get at most one guard. The flag is cleared
    /// when the guard drops.
    #[must_use]
    pub fn try_begin(&self, conversation_id: &str) -> Option<RunGuard> {
        match self.conversations.entry(conversation_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if state.running {
                    return None;
                }
                state.running = true;
            },
            Entry::Vacant(vacant) => {
                vacant.insert(ConversationState {
                    running: true,
                    memory: VecDeque::new(),
                });
            },
        }
        Some(RunGuard {
            conversations: Arc::clone(&self.conversations),
            conversation_id: conversation_id.to_string(),
        })
    }

    #[must_use]
    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|state| state.running)
    }

    /// Number of conversations with a task in flight.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.conversations.iter().filter(|s| s.running).count()
    }

    /// Remember a finished task, evicting the oldest entries past the limit.
    pub fn record(&self, conversation_id: &str, task: &str, result: &str) {
        if self.memory_limit == 0 {
            return;
        }
        let mut state = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        state.memory.push_back(MemoryEntry {
            task: task.to_string(),
            result: result.to_string(),
        });
        while state.memory.len() > self.memory_limit {
            state.memory.pop_front();
        }
    }

    /// Remembered tasks, oldest first.
    #[must_use]
    pub fn memory(&self, conversation_id: &str) -> Vec<MemoryEntry> {
        self.conversations
            .get(conversation_id)
            .map(|state| state.memory.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget everything remembered for the conversation. Returns how many
    /// entries were dropped. A running task is unaffected.
    pub fn clear_memory(&self, conversation_id: &str) -> usize {
        self.conversations
            .get_mut(conversation_id)
            .map(|mut state| {
                let dropped = state.memory.len();
                state.memory.clear();
                dropped
            })
            .unwrap_or(0)
    }
}

/// Holds a conversation's running flag for the lifetime of one task.
#[derive(Debug)]
pub struct RunGuard {
    conversations: Arc<DashMap<String, ConversationState>>,
    conversation_id: String,
}

impl RunGuard {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(mut state) = self.conversations.get_mut(&self.conversation_id) {
            state.running = false;
        }
    }
}

/// Pids of agent processes that are running right now, across every
/// conversation. Cleanup never kills these or their descendants.
#[derive(Debug, Clone, Default)]
pub struct LiveAgents {
    pids: Arc<DashSet<u32>>,
}

impl LiveAgents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid` until the returned guard drops.
    #[must_use]
    pub fn register(&self, pid: u32) -> LiveAgentGuard {
        self.pids.insert(pid);
        LiveAgentGuard {
            pids: Arc::clone(&self.pids),
            pid,
        }
    }

    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[derive(Debug)]
pub struct LiveAgentGuard {
    pids: Arc<DashSet<u32>>,
    pid: u32,
}

impl Drop for LiveAgentGuard {
    fn drop(&mut self) {
        self.pids.remove(&self.pid);
    }
}
