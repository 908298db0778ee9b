//! Event bus — append-only log plus in-process fan-out.
//!
//! Every emit is recorded to the store first (the log is authoritative),
//! then broadcast to live subscribers. Subscribers that fall behind lag and
//! re-sync; producers are never back-pressured.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::store::Store;

/// Buffered events per subscriber before laggards start dropping.
const CHANNEL_CAPACITY: usize = 256;

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub id: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct EventBus {
    store: Arc<Store>,
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, tx }
    }

    /// Record an event and fan it out.
    ///
    /// A store failure is surfaced to the caller; the broadcast still
    /// happens so live observers stay current even when the log write
    /// fails.
    pub async fn emit(
        &self,
        event_type: &str,
        entity_type: &str,
        entity_id: Option<&str>,
        payload: Value,
    ) -> anyhow::Result<()> {
        let stored = self
            .store
            .append_event(event_type, entity_type, entity_id, &payload)
            .await;

        let event = match &stored {
            Ok(row) => BusEvent {
                id: row.id,
                event_type: row.event_type.clone(),
                entity_type: row.entity_type.clone(),
                entity_id: row.entity_id.clone(),
                payload: row.payload.clone(),
                created_at: row.created_at,
            },
            Err(e) => {
                tracing::warn!(event_type, ?e, "failed to append event to store");
                BusEvent {
                    id: 0,
                    event_type: event_type.to_string(),
                    entity_type: entity_type.to_string(),
                    entity_id: entity_id.map(String::from),
                    payload,
                    created_at: chrono::Utc::now(),
                }
            }
        };

        // Ignore send errors (no active receivers)
        let _ = self.tx.send(event);
        stored.map(|_| ())
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(Store::open_memory().unwrap()))
    }

    #[tokio::test]
    async fn emit_reaches_subscriber_and_store() {
        let bus = bus();
        let mut rx = bus.subscribe();

        bus.emit("task.created", "task", Some("u-1"), json!({"task_id": 1}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.created");
        assert_eq!(event.entity_id.as_deref(), Some("u-1"));
        assert_eq!(event.payload["task_id"], 1);
        assert!(event.id > 0, "store-assigned id is carried on the bus");

        let logged = bus.store.list_events(None, None, 10).await.unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn emit_without_subscribers_still_logs() {
        let bus = bus();
        bus.emit("heartbeat.tick", "system", None, json!({"beat": 1}))
            .await
            .unwrap();
        let logged = bus.store.list_events(None, None, 10).await.unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn subscriber_only_sees_later_events() {
        let bus = bus();
        bus.emit("task.created", "task", None, json!({}))
            .await
            .unwrap();

        let mut rx = bus.subscribe();
        bus.emit("task.assessed", "task", None, json!({}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.assessed");
        assert!(rx.try_recv().is_err(), "no backlog replay");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit("session.started", "session", Some("s"), json!({}))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().event_type, "session.started");
        assert_eq!(b.recv().await.unwrap().event_type, "session.started");
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() {
        let bus = bus();
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit("heartbeat.tick", "system", None, json!({"beat": i}))
                .await
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload["beat"], i);
        }
    }
}
