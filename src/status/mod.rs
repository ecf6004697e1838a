//! Status Broadcaster (C8) — single-producer, multi-consumer fan-out of
//! structured run events.
//!
//! Grounded in the redesign note in spec.md §9 ("Event handlers
//! everywhere"): a typed enum fanned out to per-consumer bounded queues
//! instead of nominal listener registration, mirroring the teacher's
//! `cli::events`-style structured event modeling. A slow consumer never
//! blocks the orchestrator (§4.8): a full queue evicts its oldest buffered
//! intermediate progress event to make room rather than ever dropping a
//! terminal one. A plain `tokio::sync::mpsc::Sender` has no way to evict
//! an already-buffered item from the producer side, so each consumer gets
//! its own `Mutex<VecDeque<StatusEvent>>` plus a `Notify` instead.

use crate::error::ErrorKind;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

const CONSUMER_BUFFER_CAPACITY: usize = 256;

/// Structured run events, per the enumeration in spec.md §4.8.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    RunStarted,
    PhaseStarted { order: u32, item_ids: Vec<String> },
    AgentStarted { agent_id: String, item_id: String },
    AgentProgress { agent_id: String, percent: u8, activity: Option<String> },
    ToolCall { agent_id: String, tool: String, args_summary: String },
    ItemCompleted { id: String },
    ItemFailed { id: String, error_kind: ErrorKind, message: String },
    PhaseCompleted { order: u32 },
    Paused,
    Resumed,
    RunCompleted { completed: usize, failed: usize, success: bool },
}

impl StatusEvent {
    /// Terminal events are never dropped under backpressure; everything
    /// else is an "intermediate" event eligible for eviction.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusEvent::ItemCompleted { .. }
                | StatusEvent::ItemFailed { .. }
                | StatusEvent::PhaseCompleted { .. }
                | StatusEvent::RunCompleted { .. }
        )
    }

    /// Progress events are the first things dropped when a consumer falls
    /// behind (§4.8's drop policy: "drop newest intermediate progress
    /// events first").
    fn is_progress(&self) -> bool {
        matches!(self, StatusEvent::AgentProgress { .. })
    }
}

struct ConsumerState {
    queue: VecDeque<StatusEvent>,
    closed: bool,
}

struct Consumer {
    state: Arc<Mutex<ConsumerState>>,
    notify: Arc<Notify>,
}

/// The receiving half returned by [`StatusBroadcaster::subscribe`]. Events
/// are observed in publish order; `recv` returns `None` once the
/// broadcaster side has been dropped and the queue has drained.
pub struct StatusReceiver {
    state: Arc<Mutex<ConsumerState>>,
    notify: Arc<Notify>,
}

impl StatusReceiver {
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for StatusReceiver {
    fn drop(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// The single producer side, owned by the orchestrator. Cloned handles are
/// cheap; every clone publishes to the same registered consumer set.
#[derive(Clone)]
pub struct StatusBroadcaster {
    consumers: Arc<Mutex<Vec<Consumer>>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StatusBroadcaster {
    /// Mirrors `mpsc::Sender`'s drop-closes-channel behavior: once the last
    /// clone of the producer goes away, every outstanding receiver is woken
    /// and told to close once its queue drains, rather than waiting forever.
    fn drop(&mut self) {
        if Arc::strong_count(&self.consumers) == 1 {
            let consumers = self.consumers.lock().unwrap();
            for consumer in consumers.iter() {
                consumer.state.lock().unwrap().closed = true;
                consumer.notify.notify_waiters();
            }
        }
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self {
            consumers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a new consumer and returns its receiver. Consumers observe
    /// events in publish order.
    pub fn subscribe(&self) -> StatusReceiver {
        let state = Arc::new(Mutex::new(ConsumerState {
            queue: VecDeque::with_capacity(CONSUMER_BUFFER_CAPACITY),
            closed: false,
        }));
        let notify = Arc::new(Notify::new());
        self.consumers.lock().unwrap().push(Consumer {
            state: state.clone(),
            notify: notify.clone(),
        });
        StatusReceiver { state, notify }
    }

    /// Publish one event to every registered consumer. Never blocks on a
    /// consumer: a full queue evicts its oldest non-terminal event to make
    /// room for the incoming one rather than awaiting drain, so a slow TUI
    /// never delays the phase loop. Per §4.8, a terminal event is only ever
    /// dropped if every buffered event for that consumer is itself terminal
    /// (the queue is then full of events the consumer hasn't drained yet;
    /// the oldest of those is dropped to bound memory).
    pub fn publish(&self, event: StatusEvent) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|consumer| {
            let mut state = consumer.state.lock().unwrap();
            if state.closed {
                return false;
            }

            if state.queue.len() >= CONSUMER_BUFFER_CAPACITY {
                if event.is_terminal() {
                    match state.queue.iter().position(|queued| !queued.is_terminal()) {
                        Some(pos) => {
                            state.queue.remove(pos);
                            warn!(
                                "status consumer buffer full; evicted a buffered intermediate \
                                 event to retain a terminal event"
                            );
                        }
                        None => {
                            state.queue.pop_front();
                            warn!(
                                "status consumer buffer full of unread terminal events; \
                                 dropping the oldest to retain the newest"
                            );
                        }
                    }
                } else {
                    warn!("status consumer buffer full; dropping intermediate event");
                    drop(state);
                    consumer.notify.notify_waiters();
                    return true;
                }
            }

            state.queue.push_back(event.clone());
            drop(state);
            consumer.notify.notify_waiters();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(StatusEvent::RunStarted);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, StatusEvent::RunStarted));
    }

    #[tokio::test]
    async fn multiple_consumers_each_receive_events() {
        let broadcaster = StatusBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        broadcaster.publish(StatusEvent::Paused);
        assert!(matches!(a.recv().await.unwrap(), StatusEvent::Paused));
        assert!(matches!(b.recv().await.unwrap(), StatusEvent::Paused));
    }

    #[tokio::test]
    async fn dropped_consumer_is_pruned_without_affecting_others() {
        let broadcaster = StatusBroadcaster::new();
        let rx = broadcaster.subscribe();
        let mut survivor = broadcaster.subscribe();
        drop(rx);
        broadcaster.publish(StatusEvent::Resumed);
        assert!(matches!(survivor.recv().await.unwrap(), StatusEvent::Resumed));
        assert_eq!(broadcaster.consumers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_event_survives_a_full_queue_of_progress_events() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        for i in 0..CONSUMER_BUFFER_CAPACITY {
            broadcaster.publish(StatusEvent::AgentProgress {
                agent_id: "a".into(),
                percent: (i % 100) as u8,
                activity: None,
            });
        }
        broadcaster.publish(StatusEvent::ItemCompleted { id: "item-1".into() });

        let mut saw_terminal = false;
        for _ in 0..CONSUMER_BUFFER_CAPACITY {
            match rx.recv().await.unwrap() {
                StatusEvent::ItemCompleted { id } => {
                    assert_eq!(id, "item-1");
                    saw_terminal = true;
                    break;
                }
                StatusEvent::AgentProgress { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_terminal, "terminal event was dropped under backpressure");
    }

    #[tokio::test]
    async fn queue_full_of_terminal_events_drops_oldest_not_newest() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        for i in 0..CONSUMER_BUFFER_CAPACITY {
            broadcaster.publish(StatusEvent::ItemCompleted { id: format!("item-{i}") });
        }
        broadcaster.publish(StatusEvent::ItemCompleted { id: "newest".into() });
        drop(broadcaster);

        let mut last_seen = String::new();
        while let Some(event) = rx.recv().await {
            if let StatusEvent::ItemCompleted { id } = event {
                last_seen = id;
            }
        }
        assert_eq!(last_seen, "newest");
    }

    #[test]
    fn terminal_classification_matches_spec_list() {
        assert!(StatusEvent::ItemCompleted { id: "x".into() }.is_terminal());
        assert!(StatusEvent::ItemFailed { id: "x".into(), error_kind: ErrorKind::AgentTimeout, message: String::new() }.is_terminal());
        assert!(StatusEvent::PhaseCompleted { order: 1 }.is_terminal());
        assert!(!StatusEvent::AgentProgress { agent_id: "a".into(), percent: 10, activity: None }.is_terminal());
        assert!(StatusEvent::AgentProgress { agent_id: "a".into(), percent: 10, activity: None }.is_progress());
    }
}
