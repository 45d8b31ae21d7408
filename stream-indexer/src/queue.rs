//! Durable at-least-once work queue
//!
//! Tasks are keyed by `enqueue_timestamp || blockchain || account` in the
//! ledger's `tasks` column family, so a forward scan drains oldest first and
//! tasks from different batches never overwrite each other. A drained task
//! stays in the queue until it is acknowledged.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use stream_ledger::{AccountId, Blockchain, Storage};

/// Task id: `account#enqueueTimestamp`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    /// Account to recompute
    pub account: AccountId,
    /// Enqueue timestamp (unix millis) shared by the whole batch
    pub enqueued_at: i64,
}

impl TaskId {
    /// Create task id
    pub fn new(account: AccountId, enqueued_at: i64) -> Self {
        Self {
            account,
            enqueued_at,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.account, self.enqueued_at)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (account, timestamp) = s
            .rsplit_once('#')
            .ok_or_else(|| Error::InvalidTask(format!("missing '#' in task id '{}'", s)))?;
        if account.is_empty() {
            return Err(Error::InvalidTask(format!("empty account in task id '{}'", s)));
        }
        let enqueued_at = timestamp
            .parse()
            .map_err(|e| Error::InvalidTask(format!("bad timestamp in task id '{}': {}", s, e)))?;
        Ok(Self::new(AccountId::new(account), enqueued_at))
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// Task payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Blockchain of the account
    pub blockchain: Blockchain,
    /// Account to recompute
    pub account: AccountId,
}

/// Queued recompute task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: TaskId,
    /// Payload
    pub payload: TaskPayload,
}

impl Task {
    /// Build the task for one dirty account of a batch
    pub fn new(blockchain: Blockchain, account: AccountId, enqueued_at: i64) -> Self {
        Self {
            id: TaskId::new(account.clone(), enqueued_at),
            payload: TaskPayload {
                blockchain,
                account,
            },
        }
    }

    /// Enqueue timestamp
    pub fn timestamp(&self) -> i64 {
        self.id.enqueued_at
    }

    fn queue_key(&self) -> Vec<u8> {
        let chain = self.payload.blockchain.as_str().as_bytes();
        let account = self.id.account.as_str().as_bytes();
        let mut key = Vec::with_capacity(8 + chain.len() + 1 + account.len());
        // Sign bit flipped so pre-epoch timestamps still sort first
        key.extend_from_slice(&((self.id.enqueued_at as u64) ^ (1 << 63)).to_be_bytes());
        key.extend_from_slice(chain);
        key.push(0);
        key.extend_from_slice(account);
        key
    }
}

/// Task handed out by [`WorkQueue::drain`], acknowledged by its receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedTask {
    /// The task
    pub task: Task,
    receipt: Vec<u8>,
}

impl DrainedTask {
    /// Receipt used to acknowledge the task
    pub fn receipt(&self) -> &[u8] {
        &self.receipt
    }
}

/// Durable queue seam between the scheduler and the replay worker
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue tasks atomically
    async fn enqueue(&self, tasks: &[Task]) -> Result<()>;

    /// Oldest tasks, at most `batch`; they stay queued until acknowledged
    async fn drain(&self, batch: usize) -> Result<Vec<DrainedTask>>;

    /// Remove handled tasks
    async fn ack(&self, tasks: &[DrainedTask]) -> Result<()>;

    /// Number of queued tasks
    async fn len(&self) -> Result<usize>;

    /// Whether the queue is empty
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// RocksDB-backed queue over the ledger storage
#[derive(Debug, Clone)]
pub struct TaskQueue {
    storage: Arc<Storage>,
}

impl TaskQueue {
    /// Create queue over ledger storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl WorkQueue for TaskQueue {
    async fn enqueue(&self, tasks: &[Task]) -> Result<()> {
        let entries = tasks
            .iter()
            .map(|task| Ok((task.queue_key(), serde_json::to_vec(task)?)))
            .collect::<Result<Vec<_>>>()?;
        self.storage.put_tasks(&entries)?;
        Ok(())
    }

    async fn drain(&self, batch: usize) -> Result<Vec<DrainedTask>> {
        let entries = self.storage.peek_tasks(batch)?;
        let mut drained = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();

        for (key, value) in entries {
            match serde_json::from_slice::<Task>(&value) {
                Ok(task) => drained.push(DrainedTask { task, receipt: key }),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable queue entry");
                    corrupt.push(key);
                }
            }
        }

        if !corrupt.is_empty() {
            self.storage.delete_tasks(&corrupt)?;
        }

        Ok(drained)
    }

    async fn ack(&self, tasks: &[DrainedTask]) -> Result<()> {
        let keys: Vec<Vec<u8>> = tasks.iter().map(|t| t.receipt.clone()).collect();
        self.storage.delete_tasks(&keys)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.storage.task_count()?)
    }
}
