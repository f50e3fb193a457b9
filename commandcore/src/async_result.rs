//! Completion handles for in-flight commands.
//!
//! A submitter registers a command id and awaits the returned receiver. The
//! pipeline reports exactly one terminal outcome per id through
//! [`CommandAsyncResultManager::try_complete`] or
//! [`CommandAsyncResultManager::try_complete_success`]; the first call wins and
//! every later call for that id is a no-op returning `false`.
//!
//! Each shard remembers its most recently completed ids so that a completed
//! command cannot be registered, and so resolved, a second time. The memory is
//! bounded; ids older than the last [`COMPLETED_HISTORY_PER_SHARD`] completions
//! of their shard are forgotten.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::errors::{AsyncResultError, Fault};
use crate::types::CommandId;

const SHARD_COUNT: usize = 16;

/// Completed ids remembered per shard.
pub const COMPLETED_HISTORY_PER_SHARD: usize = 4096;

/// Terminal status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command took effect.
    Success,
    /// The command failed terminally.
    Failed,
}

/// The outcome delivered to whoever awaits a command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// The completed command.
    pub command_id: CommandId,
    /// Success or failure.
    pub status: CommandStatus,
    /// Human readable reason, set on failure.
    pub error_message: Option<String>,
    /// The fault, set on failure.
    pub fault: Option<Fault>,
}

impl CommandResult {
    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

#[derive(Default)]
struct ShardState {
    pending: HashMap<CommandId, oneshot::Sender<CommandResult>>,
    completed: HashSet<CommandId>,
    // Completion order, oldest first
    completed_order: VecDeque<CommandId>,
}

impl ShardState {
    fn remember_completed(&mut self, command_id: CommandId, history: usize) {
        if history == 0 {
            return;
        }
        if self.completed_order.len() == history {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
        self.completed.insert(command_id);
        self.completed_order.push_back(command_id);
    }
}

type Shard = Mutex<ShardState>;

/// Registry of pending command completions.
///
/// Ids are spread over independently locked shards, so completions for
/// different commands do not contend.
pub struct CommandAsyncResultManager {
    shards: Vec<Shard>,
    completed_history: usize,
}

impl CommandAsyncResultManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_completed_history(COMPLETED_HISTORY_PER_SHARD)
    }

    fn with_completed_history(completed_history: usize) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(ShardState::default()))
                .collect(),
            completed_history,
        }
    }

    fn shard(&self, command_id: &CommandId) -> &Shard {
        // The tail of a UUIDv7 is random.
        let index = usize::from(command_id.as_bytes()[15]) % self.shards.len();
        &self.shards[index]
    }

    /// Registers a command and returns the receiver its outcome will arrive on.
    ///
    /// # Errors
    /// Returns [`AsyncResultError::AlreadyRegistered`] if the id is still
    /// pending and [`AsyncResultError::AlreadyCompleted`] if it was recently
    /// completed.
    pub fn register(
        &self,
        command_id: CommandId,
    ) -> Result<oneshot::Receiver<CommandResult>, AsyncResultError> {
        let mut shard = self.shard(&command_id).lock();
        if shard.pending.contains_key(&command_id) {
            return Err(AsyncResultError::AlreadyRegistered(command_id));
        }
        if shard.completed.contains(&command_id) {
            return Err(AsyncResultError::AlreadyCompleted(command_id));
        }
        let (tx, rx) = oneshot::channel();
        shard.pending.insert(command_id, tx);
        trace!(%command_id, "Command registered for async result");
        Ok(rx)
    }

    /// Reports a terminal failure.
    ///
    /// Returns `false` without effect if the id is unknown or already completed.
    pub fn try_complete(
        &self,
        command_id: CommandId,
        error_message: impl Into<String>,
        fault: Fault,
    ) -> bool {
        self.complete(CommandResult {
            command_id,
            status: CommandStatus::Failed,
            error_message: Some(error_message.into()),
            fault: Some(fault),
        })
    }

    /// Reports success.
    ///
    /// Returns `false` without effect if the id is unknown or already completed.
    pub fn try_complete_success(&self, command_id: CommandId) -> bool {
        self.complete(CommandResult {
            command_id,
            status: CommandStatus::Success,
            error_message: None,
            fault: None,
        })
    }

    /// Whether a completion is still outstanding for `command_id`.
    pub fn is_pending(&self, command_id: CommandId) -> bool {
        self.shard(&command_id).lock().pending.contains_key(&command_id)
    }

    /// Number of outstanding completions.
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().pending.len()).sum()
    }

    fn complete(&self, result: CommandResult) -> bool {
        let command_id = result.command_id;
        let sender = {
            let mut shard = self.shard(&command_id).lock();
            let sender = shard.pending.remove(&command_id);
            if sender.is_some() {
                shard.remember_completed(command_id, self.completed_history);
            }
            sender
        };
        let Some(sender) = sender else {
            trace!(%command_id, "Ignoring completion for unknown or completed command");
            return false;
        };

        let status = result.status;
        if sender.send(result).is_err() {
            debug!(%command_id, ?status, "Command completed but nobody is awaiting the result");
        } else {
            debug!(%command_id, ?status, "Command completed");
        }
        true
    }
}

impl Default for CommandAsyncResultManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandAsyncResultManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAsyncResultManager")
            .field("pending", &self.pending_count())
            .finish()
    }
}
