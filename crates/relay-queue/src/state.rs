//! Lease bookkeeping for in-process queues
//!
//! All methods take the current time explicitly so lease expiry can be
//! exercised without sleeping.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::{later_by, LeaseToken, LeasedTask, Task, TaskId};

use crate::{QueueError, Result};

#[derive(Debug, Clone)]
struct Lease {
    token: LeaseToken,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    task: Task,
    lease: Option<Lease>,
}

impl Entry {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.task.scheduled_at <= now
            && self.lease.as_ref().map_or(true, |l| l.expires_at <= now)
    }
}

#[derive(Debug, Default)]
pub struct QueueState {
    entries: HashMap<TaskId, Entry>,
    /// Live lease tokens. A token is dropped once its task is settled or re-leased.
    tokens: HashMap<LeaseToken, TaskId>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, mut task: Task, not_before: DateTime<Utc>) -> Result<()> {
        if self.entries.contains_key(&task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }
        task.scheduled_at = not_before;
        self.entries.insert(task.id.clone(), Entry { task, lease: None });
        Ok(())
    }

    pub fn lease(&mut self, now: DateTime<Utc>, batch_size: usize, lease_duration: Duration) -> Vec<LeasedTask> {
        let mut due: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.is_available(now))
            .collect();
        due.sort_by(|a, b| {
            a.task
                .scheduled_at
                .cmp(&b.task.scheduled_at)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        let ids: Vec<TaskId> = due.into_iter().take(batch_size).map(|e| e.task.id.clone()).collect();

        let expires_at = later_by(now, lease_duration);
        let mut leased = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if let Some(stale) = entry.lease.take() {
                self.tokens.remove(&stale.token);
            }
            let token = LeaseToken::generate();
            entry.lease = Some(Lease {
                token: token.clone(),
                expires_at,
            });
            self.tokens.insert(token.clone(), id);
            leased.push(LeasedTask {
                task: entry.task.clone(),
                token,
                lease_expires_at: expires_at,
            });
        }
        leased
    }

    pub fn ack(&mut self, token: &LeaseToken) -> Result<Task> {
        let id = self.tokens.remove(token).ok_or_else(|| QueueError::lease_lost(token))?;
        self.entries
            .remove(&id)
            .map(|e| e.task)
            .ok_or_else(|| QueueError::lease_lost(token))
    }

    pub fn nack(&mut self, token: &LeaseToken, next_not_before: DateTime<Utc>) -> Result<()> {
        let entry = self.owned_entry(token)?;
        entry.task.attempts += 1;
        entry.task.scheduled_at = next_not_before;
        entry.lease = None;
        self.tokens.remove(token);
        Ok(())
    }

    pub fn extend(&mut self, token: &LeaseToken, now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
        let entry = self.owned_entry(token)?;
        let expires_at = later_by(now, duration);
        if let Some(lease) = entry.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    fn owned_entry(&mut self, token: &LeaseToken) -> Result<&mut Entry> {
        let id = self.tokens.get(token).ok_or_else(|| QueueError::lease_lost(token))?;
        self.entries
            .get_mut(id)
            .filter(|e| e.lease.as_ref().map_or(false, |l| &l.token == token))
            .ok_or_else(|| QueueError::lease_lost(token))
    }

    /// Earliest time at which some task becomes leasable
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .map(|e| match &e.lease {
                Some(l) => l.expires_at.max(e.task.scheduled_at),
                None => e.task.scheduled_at,
            })
            .min()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.entries.get(id).map(|e| &e.task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.entries.values().map(|e| &e.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tasks currently held under an unexpired lease
    pub fn leased_count(&self, now: DateTime<Utc>) -> usize {
        self.entries
            .values()
            .filter(|e| e.lease.as_ref().map_or(false, |l| l.expires_at > now))
            .count()
    }
}
