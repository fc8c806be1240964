// Remote node client
//
// One pooled TCP connection per remote node, re-dialled on demand.
// Transient transport failures are retried up to the configured count with
// a fixed interval; application errors decoded from the wire surface
// unchanged. All calls accept cancellation through the client's token.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::protocol::{Query, QueryReply, Request, Response};
use super::{read_frame, write_frame};
use crate::common::CancelToken;
use crate::config::RetryConfig;
use crate::error::{AccessError, Result};
use crate::event::{Event, EventAction, EventData};
use crate::node::EventFeed;
use crate::sharding::{ShardConnector, ShardNodeClient};

pub struct RemoteNodeClient {
    endpoint: String,
    retry: RetryConfig,
    cancel: CancelToken,
    connection: Mutex<Option<TcpStream>>,
}

impl RemoteNodeClient {
    pub fn new(endpoint: impl Into<String>, retry: RetryConfig, cancel: CancelToken) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry,
            cancel,
            connection: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One request/response exchange, retrying transient transport errors.
    async fn call(&self, request: &Request) -> Result<Response> {
        let mut attempt: u32 = 0;
        loop {
            self.cancel.check()?;
            match self.try_call(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        "transient error calling {} (attempt {}/{}): {}",
                        self.endpoint,
                        attempt,
                        self.retry.retry_count,
                        e
                    );
                    self.cancel.sleep(self.retry.retry_interval()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_call(&self, request: &Request) -> Result<Response> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.endpoint)
                .await
                .map_err(|e| AccessError::Network(format!("{}: {}", self.endpoint, e)))?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connection just established");

        let payload = bincode::serde::encode_to_vec(request, bincode::config::standard())?;
        let exchange = async {
            write_frame(stream, &payload).await?;
            read_frame(stream).await
        };
        let frame = match exchange.await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                *guard = None;
                return Err(AccessError::Network(format!(
                    "{}: connection closed mid-call",
                    self.endpoint
                )));
            }
            Err(e) => {
                // a broken connection is dropped and re-dialled on retry
                *guard = None;
                return Err(e);
            }
        };
        let (response, _): (Response, usize) =
            bincode::serde::decode_from_slice(&frame, bincode::config::standard())?;
        match response {
            Response::Error(error) => Err(error.into_error()),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl ShardNodeClient for RemoteNodeClient {
    async fn apply_event(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>> {
        match self.call(&Request::ApplyEvent { action, data }).await? {
            Response::Applied { event_id } => Ok(event_id),
            other => Err(unexpected_response("ApplyEvent", &other)),
        }
    }

    async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
        match self.call(&Request::IngestEvents { events }).await? {
            Response::Ingested { accepted } => Ok(accepted),
            other => Err(unexpected_response("IngestEvents", &other)),
        }
    }

    async fn query(&self, query: Query) -> Result<QueryReply> {
        match self.call(&Request::Query(query)).await? {
            Response::Query(reply) => Ok(reply),
            other => Err(unexpected_response("Query", &other)),
        }
    }

    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        match self.call(&Request::EventsSince { prior_event_id }).await? {
            Response::Events(events) => Ok(events),
            other => Err(unexpected_response("EventsSince", &other)),
        }
    }

    async fn processing_count(&self) -> Result<usize> {
        match self.call(&Request::ProcessingCount).await? {
            Response::Count(count) => Ok(count),
            other => Err(unexpected_response("ProcessingCount", &other)),
        }
    }

    async fn flush(&self) -> Result<()> {
        match self.call(&Request::Flush).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected_response("Flush", &other)),
        }
    }
}

#[async_trait]
impl EventFeed for RemoteNodeClient {
    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        ShardNodeClient::events_since(self, prior_event_id).await
    }
}

fn unexpected_response(call: &str, response: &Response) -> AccessError {
    AccessError::Internal(format!(
        "unexpected response shape for {}: {:?}",
        call, response
    ))
}

/// Connector dialling TCP endpoints; used when shard groups live in other
/// processes.
pub struct TcpShardConnector {
    retry: RetryConfig,
    cancel: CancelToken,
}

impl TcpShardConnector {
    pub fn new(retry: RetryConfig, cancel: CancelToken) -> Self {
        Self { retry, cancel }
    }
}

impl ShardConnector for TcpShardConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardNodeClient>> {
        Ok(Arc::new(RemoteNodeClient::new(
            endpoint,
            self.retry,
            self.cancel.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Fnv1aKeyHasher, TripSwitch};
    use crate::config::{BufferConfig, ErrorMappingConfig, FlushStrategyKind, NodeConfig};
    use crate::model::User;
    use crate::network::server::NodeServer;
    use crate::node::LocalShardNode;
    use crate::storage::MemoryEventStorage;
    use tokio::net::TcpListener;

    async fn served_node() -> (String, CancelToken, Arc<LocalShardNode>) {
        let config = NodeConfig {
            buffer: BufferConfig {
                strategy: FlushStrategyKind::Manual,
                size_limit: 10_000,
                flush_interval_ms: 60_000,
                flush_failure_limit: 3,
            },
            ..NodeConfig::default()
        };
        let node = LocalShardNode::new(
            &config,
            Arc::new(MemoryEventStorage::new()),
            Arc::new(Fnv1aKeyHasher),
            Arc::new(TripSwitch::new()),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancelToken::new();
        let server = NodeServer::new(
            node.clone() as Arc<dyn ShardNodeClient>,
            ErrorMappingConfig::default(),
        );
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener, server_cancel).await;
        });
        (addr, cancel, node)
    }

    #[tokio::test]
    async fn test_apply_flush_query_over_tcp() {
        let (addr, cancel, _node) = served_node().await;
        let client = RemoteNodeClient::new(&addr, RetryConfig::default(), cancel.clone());

        let applied = client
            .apply_event(EventAction::Add, EventData::User { user: User::new("u1") })
            .await
            .unwrap();
        assert!(applied.is_some());
        client.flush().await.unwrap();

        match client.query(Query::ContainsUser { user: User::new("u1") }).await.unwrap() {
            QueryReply::Bool(contained) => assert!(contained),
            other => panic!("unexpected reply {:?}", other),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_application_error_crosses_wire_unchanged() {
        let (addr, cancel, _node) = served_node().await;
        let client = RemoteNodeClient::new(&addr, RetryConfig::default(), cancel.clone());

        let err = client
            .query(Query::HasAccessToComponent {
                user: User::new("ghost"),
                component: crate::model::ApplicationComponent::new("Orders"),
                level: crate::model::AccessLevel::new("View"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::UserNotFound(user) if user == "ghost"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connect_failure_retries_then_surfaces() {
        let retry = RetryConfig {
            retry_count: 2,
            retry_interval_ms: 10,
        };
        // nothing listens on this port
        let client = RemoteNodeClient::new("127.0.0.1:1", retry, CancelToken::new());
        let err = client.processing_count().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cache_pull_over_tcp() {
        let (addr, cancel, node) = served_node().await;
        let client = RemoteNodeClient::new(&addr, RetryConfig::default(), cancel.clone());

        let err = ShardNodeClient::events_since(&client, None).await.unwrap_err();
        assert!(matches!(err, AccessError::EventCacheEmpty));

        node.apply_event(EventAction::Add, EventData::User { user: User::new("u1") })
            .await
            .unwrap();
        node.flush().await.unwrap();

        let events = ShardNodeClient::events_since(&client, None).await.unwrap();
        assert_eq!(events.len(), 1);
        cancel.cancel();
    }
}
