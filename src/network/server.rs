// Node server
//
// Exposes one shard group node over the TCP node protocol. Each connection
// is served on its own task; a connection cap bounds resource usage. Every
// error leaving the server is shaped by the node's error-mapping
// configuration before it reaches the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{ErrorResponse, Request, Response};
use super::{read_frame, write_frame};
use crate::common::CancelToken;
use crate::config::ErrorMappingConfig;
use crate::error::{AccessError, Result};
use crate::sharding::ShardNodeClient;

/// Maximum concurrent connections before new ones are turned away.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

pub struct NodeServer {
    node: Arc<dyn ShardNodeClient>,
    errors: ErrorMappingConfig,
    active_connections: Arc<AtomicUsize>,
}

impl NodeServer {
    pub fn new(node: Arc<dyn ShardNodeClient>, errors: ErrorMappingConfig) -> Self {
        Self {
            node,
            errors,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run(&self, addr: &str, cancel: CancelToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        tracing::info!("node server listening on {}", addr);
        self.serve(listener, cancel).await
    }

    /// Accept loop over an already-bound listener; exits when cancelled.
    pub async fn serve(&self, listener: TcpListener, cancel: CancelToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => {
                    tracing::info!("node server shutting down");
                    return Ok(());
                }
            };
            let (socket, peer) = accepted.map_err(|e| AccessError::Network(e.to_string()))?;

            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= MAX_CONCURRENT_CONNECTIONS {
                tracing::warn!(
                    "connection limit reached ({}/{}), rejecting {}",
                    current,
                    MAX_CONCURRENT_CONNECTIONS,
                    peer
                );
                continue;
            }
            self.active_connections.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("connection from {}", peer);

            let node = self.node.clone();
            let errors = self.errors;
            let active_connections = self.active_connections.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(node, errors, socket).await {
                    tracing::warn!("connection from {} ended with error: {}", peer, e);
                }
                active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

async fn handle_connection(
    node: Arc<dyn ShardNodeClient>,
    errors: ErrorMappingConfig,
    mut socket: TcpStream,
) -> Result<()> {
    while let Some(payload) = read_frame(&mut socket).await? {
        let response = match bincode::serde::decode_from_slice::<Request, _>(
            &payload,
            bincode::config::standard(),
        ) {
            Ok((request, _)) => dispatch(&node, request).await.unwrap_or_else(|e| {
                Response::Error(ErrorResponse::from_error(&e, &errors))
            }),
            Err(e) => Response::Error(ErrorResponse::from_error(
                &AccessError::Serialization(e.to_string()),
                &errors,
            )),
        };
        let encoded = bincode::serde::encode_to_vec(&response, bincode::config::standard())?;
        write_frame(&mut socket, &encoded).await?;
    }
    Ok(())
}

async fn dispatch(node: &Arc<dyn ShardNodeClient>, request: Request) -> Result<Response> {
    let response = match request {
        Request::ApplyEvent { action, data } => {
            let event_id = node.apply_event(action, data).await?;
            Response::Applied { event_id }
        }
        Request::IngestEvents { events } => {
            let accepted = node.ingest_events(events).await?;
            Response::Ingested { accepted }
        }
        Request::Query(query) => Response::Query(node.query(query).await?),
        Request::EventsSince { prior_event_id } => {
            Response::Events(node.events_since(prior_event_id).await?)
        }
        Request::ProcessingCount => Response::Count(node.processing_count().await?),
        Request::Flush => {
            node.flush().await?;
            Response::Ok
        }
        Request::Ping => Response::Pong,
    };
    Ok(response)
}
