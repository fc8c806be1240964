// Router node
//
// Interposed in front of a source writer while a hash range is being moved.
// Writes outside the moving range pass straight through; writes inside it
// are held in arrival order in a pause buffer. At cutover the pause buffer
// drains into the target writer before the router is removed, so range
// ordering is preserved end to end.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::KeyHasher;
use crate::error::Result;
use crate::event::{Event, EventAction, EventData};
use crate::network::protocol::{Query, QueryReply};
use crate::sharding::ShardNodeClient;

pub struct RouterNode {
    downstream: Arc<dyn ShardNodeClient>,
    range_start: i32,
    range_end: i32,
    holding: AtomicBool,
    pause_buffer: Mutex<VecDeque<(EventAction, EventData)>>,
    hasher: Arc<dyn KeyHasher>,
}

impl RouterNode {
    pub fn new(
        downstream: Arc<dyn ShardNodeClient>,
        range_start: i32,
        range_end: i32,
        hasher: Arc<dyn KeyHasher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            range_start,
            range_end,
            holding: AtomicBool::new(true),
            pause_buffer: Mutex::new(VecDeque::new()),
            hasher,
        })
    }

    fn in_range(&self, data: &EventData) -> bool {
        let hash = self.hasher.hash_key(data.route_key());
        hash >= self.range_start && hash <= self.range_end
    }

    pub fn held_count(&self) -> usize {
        self.pause_buffer.lock().len()
    }

    pub fn downstream(&self) -> Arc<dyn ShardNodeClient> {
        self.downstream.clone()
    }

    /// Drain the pause buffer into the target writer in arrival order and
    /// stop holding; later writes pass through to the downstream writer
    /// until the router is removed from the path.
    pub async fn release_to(&self, target: &Arc<dyn ShardNodeClient>) -> Result<usize> {
        self.holding.store(false, Ordering::SeqCst);
        let held: Vec<(EventAction, EventData)> = self.pause_buffer.lock().drain(..).collect();
        let released = held.len();
        for (action, data) in held {
            target.apply_event(action, data).await?;
        }
        if released > 0 {
            tracing::info!("router released {} held writes to the target writer", released);
        }
        Ok(released)
    }
}

#[async_trait]
impl ShardNodeClient for RouterNode {
    async fn apply_event(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>> {
        if self.holding.load(Ordering::SeqCst) && self.in_range(&data) {
            self.pause_buffer.lock().push_back((action, data));
            // accepted but unstamped until release
            return Ok(None);
        }
        self.downstream.apply_event(action, data).await
    }

    async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
        self.downstream.ingest_events(events).await
    }

    async fn query(&self, query: Query) -> Result<QueryReply> {
        self.downstream.query(query).await
    }

    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        self.downstream.events_since(prior_event_id).await
    }

    async fn processing_count(&self) -> Result<usize> {
        self.downstream.processing_count().await
    }

    async fn flush(&self) -> Result<()> {
        self.downstream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccessError;
    use crate::model::User;

    /// Hasher that reads the key as an integer.
    struct ParseHasher;

    impl KeyHasher for ParseHasher {
        fn hash_key(&self, key: &str) -> i32 {
            key.parse().unwrap_or(0)
        }
    }

    struct RecordingNode {
        applied: Mutex<Vec<EventData>>,
    }

    impl RecordingNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ShardNodeClient for RecordingNode {
        async fn apply_event(
            &self,
            _action: EventAction,
            data: EventData,
        ) -> Result<Option<Uuid>> {
            self.applied.lock().push(data);
            Ok(Some(Uuid::new_v4()))
        }

        async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
            Ok(events.len())
        }

        async fn query(&self, _query: Query) -> Result<QueryReply> {
            Err(AccessError::Internal("not queried in this test".to_string()))
        }

        async fn events_since(&self, _prior: Option<Uuid>) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn processing_count(&self) -> Result<usize> {
            Ok(0)
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn user(data_key: i32) -> EventData {
        EventData::User {
            user: User::new(data_key.to_string()),
        }
    }

    #[tokio::test]
    async fn test_holds_in_range_and_forwards_outside() {
        let source = RecordingNode::new();
        let router = RouterNode::new(
            source.clone() as Arc<dyn ShardNodeClient>,
            0,
            i32::MAX,
            Arc::new(ParseHasher),
        );

        let held = router.apply_event(EventAction::Add, user(5)).await.unwrap();
        assert_eq!(held, None);
        let forwarded = router.apply_event(EventAction::Add, user(-5)).await.unwrap();
        assert!(forwarded.is_some());

        assert_eq!(router.held_count(), 1);
        assert_eq!(source.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_release_preserves_arrival_order() {
        let source = RecordingNode::new();
        let target = RecordingNode::new();
        let router = RouterNode::new(
            source.clone() as Arc<dyn ShardNodeClient>,
            0,
            i32::MAX,
            Arc::new(ParseHasher),
        );

        for key in [3, 1, 2] {
            router.apply_event(EventAction::Add, user(key)).await.unwrap();
        }
        let released = router
            .release_to(&(target.clone() as Arc<dyn ShardNodeClient>))
            .await
            .unwrap();
        assert_eq!(released, 3);
        assert_eq!(
            *target.applied.lock(),
            vec![user(3), user(1), user(2)]
        );

        // after release the router forwards in-range writes downstream
        router.apply_event(EventAction::Add, user(9)).await.unwrap();
        assert_eq!(source.applied.lock().len(), 1);
        assert_eq!(router.held_count(), 0);
    }
}
