//! In-memory durable queue.

use async_trait::async_trait;
use contentflow_core::clock::to_chrono;
use contentflow_core::{
    Clock, MessageBody, QueueMessage, QueueStats, ResourceId, StageName, SystemClock,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{DbResult, DurableQueue};

/// Acked messages kept for inspection; older ones are dropped.
pub const ARCHIVE_LIMIT: usize = 1000;

#[derive(Default)]
struct QueueState {
    queues: HashMap<StageName, Vec<QueueMessage>>,
    archived: VecDeque<QueueMessage>,
}

impl QueueState {
    fn find_mut(&mut self, message_id: ResourceId) -> Option<&mut QueueMessage> {
        self.queues
            .values_mut()
            .flat_map(|q| q.iter_mut())
            .find(|m| m.id == message_id)
    }
}

/// Queue backed by process memory.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Every live message of a stage, leased or not.
    pub async fn messages(&self, stage: &StageName) -> Vec<QueueMessage> {
        let state = self.state.lock().await;
        state.queues.get(stage).cloned().unwrap_or_default()
    }

    /// The most recently acked messages, oldest first, at most `ARCHIVE_LIMIT`.
    pub async fn archived(&self) -> Vec<QueueMessage> {
        self.state.lock().await.archived.iter().cloned().collect()
    }

    async fn push(
        &self,
        stage: &StageName,
        body: &MessageBody,
        delay: Duration,
    ) -> DbResult<ResourceId> {
        let now = self.clock.now();
        let message = QueueMessage {
            id: ResourceId::new(),
            queue: stage.clone(),
            body: body.clone(),
            enqueued_at: now,
            visible_at: now + to_chrono(delay),
            leased_at: None,
            delivery_count: 0,
        };
        let id = message.id;
        let mut state = self.state.lock().await;
        state.queues.entry(stage.clone()).or_default().push(message);
        Ok(id)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, stage: &StageName, body: &MessageBody) -> DbResult<ResourceId> {
        self.push(stage, body, Duration::ZERO).await
    }

    async fn enqueue_delayed(
        &self,
        stage: &StageName,
        body: &MessageBody,
        delay: Duration,
    ) -> DbResult<ResourceId> {
        self.push(stage, body, delay).await
    }

    async fn dequeue(
        &self,
        stage: &StageName,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> DbResult<Vec<QueueMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(stage) else {
            return Ok(Vec::new());
        };

        let mut visible: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_visible(now))
            .map(|(idx, _)| idx)
            .collect();
        visible.sort_by_key(|&idx| (queue[idx].visible_at, queue[idx].id));

        let deadline = now + to_chrono(visibility_timeout);
        let mut leased = Vec::new();
        for idx in visible.into_iter().take(max_count) {
            let message = &mut queue[idx];
            message.visible_at = deadline;
            message.leased_at = Some(now);
            message.delivery_count += 1;
            leased.push(message.clone());
        }
        Ok(leased)
    }

    async fn ack(&self, message_id: ResourceId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let mut removed = None;
        for queue in state.queues.values_mut() {
            if let Some(idx) = queue.iter().position(|m| m.id == message_id) {
                removed = Some(queue.remove(idx));
                break;
            }
        }
        match removed {
            Some(message) => {
                if state.archived.len() == ARCHIVE_LIMIT {
                    state.archived.pop_front();
                }
                state.archived.push_back(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend_visibility(
        &self,
        message_id: ResourceId,
        timeout: Duration,
    ) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.find_mut(message_id) {
            Some(message) if message.leased_at.is_some() => {
                message.visible_at = now + to_chrono(timeout);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(&self, message_id: ResourceId, delay: Duration) -> DbResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.find_mut(message_id) {
            Some(message) => {
                message.visible_at = now + to_chrono(delay);
                message.leased_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn has_message(&self, stage: &StageName, job_id: ResourceId) -> DbResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(stage)
            .is_some_and(|q| q.iter().any(|m| m.body.job_id == job_id)))
    }

    async fn backlog_depth(&self, stage: &StageName) -> DbResult<u64> {
        Ok(self.stats(stage).await?.ready)
    }

    async fn stats(&self, stage: &StageName) -> DbResult<QueueStats> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for message in state.queues.get(stage).into_iter().flatten() {
            if message.is_visible(now) {
                stats.ready += 1;
            } else if message.is_in_flight(now) {
                stats.in_flight += 1;
            } else if message.is_delayed(now) {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }
}
