// # Shard Group Split/Merge Orchestrator
//
// Moves a contiguous hash sub-range from one shard group to another while
// writes continue. The protocol, phase by phase:
//
//   Provision -> RouterInterpose -> DrainSource -> CopyBatches/CatchUp ->
//   Cutover -> ReleaseRouter -> DeleteFromSource -> Teardown (merge only)
//
// No in-range event is lost (it is either still in the source or already
// copied to the target), none is duplicated (idempotent persistence plus
// the copy cursor), and range order is preserved (the router holds writes
// in arrival order and the target drains the pause buffer before serving
// new ones). A drain timeout rolls the operation back: router removed,
// target deleted.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::client::{ShardNodeClient, SwappableNodeClient};
use super::instance::InstanceManager;
use super::{ShardConfiguration, ShardConfigurationStore, ShardGroupDescriptor, ShardGroupRole};
use crate::common::{CancelToken, KeyHasher};
use crate::error::{AccessError, Result};
use crate::node::RouterNode;
use crate::storage::EventStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPhase {
    Provision,
    RouterInterpose,
    DrainSource,
    CopyBatches,
    CatchUp,
    Cutover,
    ReleaseRouter,
    DeleteFromSource,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitShardGroupRequest {
    pub role: ShardGroupRole,
    /// Range start of the source shard group.
    pub source_start: i32,
    /// First hash owned by the new target group; the moved range is
    /// `[new_start, source range end]`.
    pub new_start: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeShardGroupsRequest {
    pub role: ShardGroupRole,
    /// The surviving group.
    pub left_start: i32,
    /// The group absorbed into the left one; must own the range directly
    /// above it.
    pub right_start: i32,
}

/// Node lifecycle hooks the orchestrator drives. The in-process registry
/// implements this over local nodes; a cluster deployment implements it
/// over its scheduler.
pub trait ShardGroupProvisioner: Send + Sync {
    /// Bring up the nodes of a new shard group over the given storage.
    fn provision(
        &self,
        descriptor: &ShardGroupDescriptor,
        storage: Arc<dyn EventStorage>,
    ) -> Result<Arc<dyn ShardNodeClient>>;

    /// Tear down a shard group's nodes.
    fn decommission(&self, name: &str) -> Result<()>;

    /// The swappable client sitting in front of a group's writer endpoint;
    /// the orchestrator interposes its router by swapping here.
    fn writer_front(&self, descriptor: &ShardGroupDescriptor) -> Result<Arc<SwappableNodeClient>>;

    /// Toggle duplicate-primary-event tolerance on a group's writer.
    fn set_collision_tolerant(
        &self,
        descriptor: &ShardGroupDescriptor,
        tolerant: bool,
    ) -> Result<()>;
}

pub struct ShardGroupOrchestrator {
    config_store: Arc<ShardConfigurationStore>,
    instance_manager: Arc<dyn InstanceManager>,
    provisioner: Arc<dyn ShardGroupProvisioner>,
    hasher: Arc<dyn KeyHasher>,
    drain_max_attempts: u32,
    drain_backoff: Duration,
    copy_batch_size: usize,
}

impl ShardGroupOrchestrator {
    pub fn new(
        config_store: Arc<ShardConfigurationStore>,
        instance_manager: Arc<dyn InstanceManager>,
        provisioner: Arc<dyn ShardGroupProvisioner>,
        hasher: Arc<dyn KeyHasher>,
    ) -> Self {
        Self {
            config_store,
            instance_manager,
            provisioner,
            hasher,
            drain_max_attempts: 20,
            drain_backoff: Duration::from_millis(50),
            copy_batch_size: 500,
        }
    }

    pub fn with_drain_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.drain_max_attempts = max_attempts;
        self.drain_backoff = backoff;
        self
    }

    fn phase(&self, operation: &str, phase: SplitPhase) {
        tracing::info!("{} phase: {:?}", operation, phase);
    }

    /// Wait for the writer's buffered count to reach zero, flushing and
    /// backing off between polls.
    async fn drain_writer(
        &self,
        writer: &Arc<dyn ShardNodeClient>,
        cancel: &CancelToken,
    ) -> Result<()> {
        for attempt in 0..self.drain_max_attempts {
            cancel.check()?;
            // a failing flush keeps its events buffered; keep polling until
            // the writer recovers or the attempts run out
            if let Err(e) = writer.flush().await {
                tracing::warn!("source flush failed while draining: {}", e);
            }
            let pending = writer.processing_count().await?;
            if pending == 0 {
                return Ok(());
            }
            let jitter = rand::rng().random_range(0..=self.drain_backoff.as_millis() as u64 / 2);
            let backoff = self.drain_backoff * (attempt + 1) + Duration::from_millis(jitter);
            tracing::debug!(
                "writer still has {} buffered events; backing off {:?}",
                pending,
                backoff
            );
            cancel.sleep(backoff).await?;
        }
        Err(AccessError::Timeout(
            "source writer did not drain within the allowed attempts".to_string(),
        ))
    }

    /// Copy every in-range event from source storage into the target node,
    /// in persistence order, batch by batch, until a pass finds nothing new.
    async fn copy_range(
        &self,
        source_storage: &Arc<dyn EventStorage>,
        target: &Arc<dyn ShardNodeClient>,
        range_start: i32,
        range_end: i32,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let mut cursor: Option<Uuid> = None;
        let mut copied = 0usize;
        loop {
            cancel.check()?;
            let batch = source_storage.read_range(
                range_start,
                range_end,
                cursor,
                self.copy_batch_size,
            )?;
            if batch.is_empty() {
                // in-range writes are paused at the router and the source is
                // drained, so an empty pass means we have caught up
                return Ok(copied);
            }
            cursor = batch.last().map(|event| event.id);
            copied += batch.len();
            target.ingest_events(batch).await?;
        }
    }

    /// Split one shard group in two: the source keeps `[source_start,
    /// new_start)`, the target takes `[new_start, source range end]`.
    /// Re-running after a completed cutover is a no-op.
    pub async fn split(
        &self,
        request: SplitShardGroupRequest,
        cancel: &CancelToken,
    ) -> Result<Arc<ShardConfiguration>> {
        let config = self.config_store.snapshot();
        if config.find(request.role, request.new_start).is_some() {
            tracing::info!(
                "split at {} already published in generation {}; nothing to do",
                request.new_start,
                config.generation
            );
            return Ok(config);
        }
        let source = config
            .find(request.role, request.source_start)
            .ok_or_else(|| {
                AccessError::NotFound(format!(
                    "shard group of role '{}' starting at {}",
                    request.role, request.source_start
                ))
            })?
            .clone();
        let (source_lo, source_hi) = config.range_of(request.role, request.source_start)?;
        if request.new_start <= source_lo || request.new_start > source_hi {
            return Err(AccessError::ArgumentOutOfRange(format!(
                "split point {} is outside the source range [{}, {}]",
                request.new_start, source_lo, source_hi
            )));
        }
        let (range_start, range_end) = (request.new_start, source_hi);

        self.phase("split", SplitPhase::Provision);
        let target_name = format!("{}-shard-{}", request.role, request.new_start);
        let target_descriptor = ShardGroupDescriptor {
            name: target_name.clone(),
            role: request.role,
            hash_range_start: request.new_start,
            writer_endpoint: format!("local://{}", target_name),
            reader_endpoints: Vec::new(),
            storage_instance: target_name.clone(),
        };
        let target_storage = self.instance_manager.create_instance(&target_name)?;
        let target_node = self
            .provisioner
            .provision(&target_descriptor, target_storage)?;

        self.phase("split", SplitPhase::RouterInterpose);
        let source_front = self.provisioner.writer_front(&source)?;
        let source_writer = source_front.current();
        let router = RouterNode::new(
            source_writer.clone(),
            range_start,
            range_end,
            self.hasher.clone(),
        );
        source_front.swap(router.clone());

        self.phase("split", SplitPhase::DrainSource);
        if let Err(e) = self.drain_writer(&source_writer, cancel).await {
            tracing::error!("split aborted during drain: {}; rolling back", e);
            source_front.swap(source_writer);
            self.provisioner.decommission(&target_name)?;
            self.instance_manager.delete_instance(&target_name)?;
            return Err(e);
        }

        self.phase("split", SplitPhase::CopyBatches);
        let source_storage = self.instance_manager.open_instance(&source.storage_instance)?;
        let copied = self
            .copy_range(&source_storage, &target_node, range_start, range_end, cancel)
            .await?;
        self.phase("split", SplitPhase::CatchUp);
        tracing::info!("copied {} in-range events to '{}'", copied, target_name);

        self.phase("split", SplitPhase::Cutover);
        let next = self
            .config_store
            .snapshot()
            .with_group_added(target_descriptor.clone())?;
        let published = self.config_store.publish(next)?;

        self.phase("split", SplitPhase::ReleaseRouter);
        router.release_to(&target_node).await?;
        source_front.swap(source_writer);

        self.phase("split", SplitPhase::DeleteFromSource);
        let deleted = source_storage.delete_range(range_start, range_end)?;
        tracing::info!(
            "deleted {} moved records from source '{}'",
            deleted,
            source.name
        );

        Ok(published)
    }

    /// Merge the right shard group into its left neighbour. Colliding
    /// primary-element events (the same group or entity type present on
    /// both sides) are counted and dropped by the surviving writer.
    pub async fn merge(
        &self,
        request: MergeShardGroupsRequest,
        cancel: &CancelToken,
    ) -> Result<Arc<ShardConfiguration>> {
        let config = self.config_store.snapshot();
        let left = config
            .find(request.role, request.left_start)
            .ok_or_else(|| {
                AccessError::NotFound(format!(
                    "shard group of role '{}' starting at {}",
                    request.role, request.left_start
                ))
            })?
            .clone();
        let right = match config.find(request.role, request.right_start) {
            Some(right) => right.clone(),
            None => {
                tracing::info!(
                    "right group at {} already absorbed in generation {}; nothing to do",
                    request.right_start,
                    config.generation
                );
                return Ok(config);
            }
        };
        let (_, left_hi) = config.range_of(request.role, request.left_start)?;
        let (right_lo, right_hi) = config.range_of(request.role, request.right_start)?;
        if left_hi + 1 != right_lo {
            return Err(AccessError::InvalidArgument(format!(
                "shard groups at {} and {} are not adjacent",
                request.left_start, request.right_start
            )));
        }

        let left_front = self.provisioner.writer_front(&left)?;
        let left_node: Arc<dyn ShardNodeClient> = left_front.clone();
        self.provisioner.set_collision_tolerant(&left, true)?;

        self.phase("merge", SplitPhase::RouterInterpose);
        let right_front = self.provisioner.writer_front(&right)?;
        let right_writer = right_front.current();
        let router = RouterNode::new(right_writer.clone(), right_lo, right_hi, self.hasher.clone());
        right_front.swap(router.clone());

        self.phase("merge", SplitPhase::DrainSource);
        if let Err(e) = self.drain_writer(&right_writer, cancel).await {
            tracing::error!("merge aborted during drain: {}; rolling back", e);
            right_front.swap(right_writer);
            self.provisioner.set_collision_tolerant(&left, false)?;
            return Err(e);
        }

        self.phase("merge", SplitPhase::CopyBatches);
        let right_storage = self.instance_manager.open_instance(&right.storage_instance)?;
        let copied = self
            .copy_range(&right_storage, &left_node, right_lo, right_hi, cancel)
            .await?;
        tracing::info!("merged {} events into '{}'", copied, left.name);

        self.phase("merge", SplitPhase::Cutover);
        let next = self
            .config_store
            .snapshot()
            .with_group_removed(request.role, request.right_start)?;
        let published = self.config_store.publish(next)?;

        self.phase("merge", SplitPhase::ReleaseRouter);
        router.release_to(&left_node).await?;

        self.phase("merge", SplitPhase::Teardown);
        self.provisioner.decommission(&right.name)?;
        self.instance_manager.delete_instance(&right.storage_instance)?;
        self.provisioner.set_collision_tolerant(&left, false)?;

        Ok(published)
    }
}
