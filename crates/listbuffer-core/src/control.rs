//! Tick classification and the buffer engine loop.
//!
//! Every tick samples both queue depths and picks exactly one action:
//!
//! | in surplus | out deficit | action |
//! |---|---|---|
//! | yes | yes | direct transfer of one `redis_chunk` |
//! | yes | no | spill `in_chunks * redis_chunk` items to disk |
//! | no | yes | reload one chunk (or move the whole in-queue if disk is empty) |
//! | no | no | idle |
//!
//! Surplus and deficit are counted in whole `redis_chunk` batches, so a
//! queue has to be at least one batch past its target before anything moves.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{Item, Result};
use crate::broker::{QueueBroker, QueueLengths};
use crate::chunk_store::{ChunkId, ChunkStore, LoadOutcome};
use crate::config::BufferConfig;
use crate::error::Error;
use crate::shutdown::ShutdownSignal;

/// Depth targets and batch size driving classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub target_in: i64,
    pub target_out: i64,
    /// Items per broker pop/push; always >= 1.
    pub redis_chunk: i64,
}

/// Everything the engine needs from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub in_key: String,
    pub out_key: String,
    pub thresholds: Thresholds,
    pub tick: Duration,
}

impl EngineSettings {
    /// Assumes `config` passed [`BufferConfig::validate`].
    #[must_use]
    pub fn from_config(config: &BufferConfig) -> Self {
        let clamp = |value: u64| value.min(i64::MAX as u64) as i64;
        Self {
            in_key: config.redis.in_key.clone(),
            out_key: config.redis.out_key.clone(),
            thresholds: Thresholds {
                target_in: clamp(config.target_in),
                target_out: clamp(config.target_out),
                redis_chunk: clamp(config.redis_chunk).max(1),
            },
            tick: config.tick_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickAction {
    DirectTransfer,
    /// Pop and store this many `redis_chunk` batches.
    Spill { batches: u64 },
    Reload,
    Idle,
}

impl fmt::Display for TickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectTransfer => write!(f, "transfer"),
            Self::Spill { .. } => write!(f, "spill"),
            Self::Reload => write!(f, "reload"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Classification of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPlan {
    pub in_chunks: i64,
    pub out_chunks: i64,
    pub action: TickAction,
}

/// Decide what a tick should do. Pure; no broker or disk access.
#[must_use]
pub fn classify(lengths: QueueLengths, thresholds: &Thresholds) -> TickPlan {
    let redis_chunk = thresholds.redis_chunk.max(1);
    let in_delta = lengths.in_len.saturating_sub(thresholds.target_in);
    let out_delta = thresholds.target_out.saturating_sub(lengths.out_len);
    let in_chunks = in_delta / redis_chunk;
    let out_chunks = out_delta / redis_chunk;

    let action = if in_chunks > 0 && out_chunks > 0 {
        TickAction::DirectTransfer
    } else if in_chunks > 0 {
        TickAction::Spill {
            batches: in_chunks as u64,
        }
    } else if out_chunks > 0 {
        TickAction::Reload
    } else {
        TickAction::Idle
    };

    TickPlan {
        in_chunks,
        out_chunks,
        action,
    }
}

/// Whether the loop should wait a tick before the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work was done; go again immediately.
    Busy,
    /// Nothing (more) to do right now.
    Idle,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub failed_ticks: u64,
    /// Items moved in-queue → out-queue without touching disk.
    pub transferred: u64,
    pub spilled: u64,
    pub reloaded: u64,
    /// Items returned to the in-queue after a failed spill or transfer.
    pub requeued: u64,
    pub orphaned_chunks: u64,
    /// Failed ticks caused by a lost broker connection.
    pub connection_losses: u64,
}

/// The buffer: a broker, a chunk store and the settings tying them together.
#[derive(Debug)]
pub struct BufferEngine<B> {
    broker: B,
    store: ChunkStore,
    settings: EngineSettings,
    /// Set once the store has been seen empty; cleared by the next spill.
    empty_hint: bool,
    stats: EngineStats,
}

impl<B: QueueBroker> BufferEngine<B> {
    pub fn new(broker: B, store: ChunkStore, settings: EngineSettings) -> Result<Self> {
        let empty_hint = store.is_empty()?;
        Ok(Self {
            broker,
            store,
            settings,
            empty_hint,
            stats: EngineStats::default(),
        })
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn empty_hint(&self) -> bool {
        self.empty_hint
    }

    /// Hand back the components, e.g. to reopen the store in a test.
    pub fn into_parts(self) -> (B, ChunkStore) {
        (self.broker, self.store)
    }

    /// Run one iteration: sample, classify, act.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.stats.ticks += 1;
        let lengths = self
            .broker
            .lengths(&self.settings.in_key, &self.settings.out_key)
            .await?;
        let plan = classify(lengths, &self.settings.thresholds);

        match plan.action {
            TickAction::DirectTransfer => {
                info!(
                    action = %plan.action,
                    in_len = lengths.in_len,
                    out_len = lengths.out_len,
                    items = self.settings.thresholds.redis_chunk,
                    "Directly transferring items"
                );
                self.transfer_chunk().await?;
                Ok(TickOutcome::Busy)
            }
            TickAction::Spill { batches } => {
                info!(
                    action = %plan.action,
                    in_len = lengths.in_len,
                    out_len = lengths.out_len,
                    in_chunks = plan.in_chunks,
                    items = batches.saturating_mul(self.settings.thresholds.redis_chunk as u64),
                    "Storing items"
                );
                self.spill(batches).await?;
                Ok(TickOutcome::Busy)
            }
            TickAction::Reload => self.reload(lengths, plan).await,
            TickAction::Idle => {
                debug!(
                    action = %plan.action,
                    in_len = lengths.in_len,
                    out_len = lengths.out_len,
                    "Idle"
                );
                Ok(TickOutcome::Idle)
            }
        }
    }

    /// Tick until `shutdown` is requested, then close the store.
    ///
    /// Tick errors are logged and counted. A failure to close the store is
    /// logged too: everything already written stays on disk and the tail
    /// size is re-derived on the next open.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> EngineStats {
        info!(
            in_key = %self.settings.in_key,
            out_key = %self.settings.out_key,
            tick_ms = self.settings.tick.as_millis() as u64,
            empty = self.empty_hint,
            "Buffer engine started"
        );

        while !shutdown.is_requested() {
            let pause = match self.tick().await {
                Ok(TickOutcome::Busy) => false,
                Ok(TickOutcome::Idle) => {
                    self.stats.idle_ticks += 1;
                    true
                }
                Err(err) if err.is_broker_connection_lost() => {
                    self.stats.failed_ticks += 1;
                    self.stats.connection_losses += 1;
                    warn!(error = %err, "Broker connection lost, reconnecting next tick");
                    true
                }
                Err(err) => {
                    self.stats.failed_ticks += 1;
                    error!(error = %err, "Tick failed");
                    true
                }
            };

            if pause {
                if shutdown.sleep(self.settings.tick).await {
                    break;
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        if let Err(err) = self.store.close() {
            error!(error = %err, "Failed to close tail chunk");
        }
        let stats = self.stats;
        info!(
            ticks = stats.ticks,
            idle_ticks = stats.idle_ticks,
            failed_ticks = stats.failed_ticks,
            transferred = stats.transferred,
            spilled = stats.spilled,
            reloaded = stats.reloaded,
            requeued = stats.requeued,
            orphaned_chunks = stats.orphaned_chunks,
            connection_losses = stats.connection_losses,
            "Buffer engine stopped"
        );
        stats
    }

    async fn transfer_chunk(&mut self) -> Result<()> {
        let count = self.settings.thresholds.redis_chunk as u64;
        let items = self.broker.pop_front(&self.settings.in_key, count).await?;
        if let Err(err) = self.broker.push_back(&self.settings.out_key, &items).await {
            return Err(self.requeue(&items, err.into()).await);
        }
        self.stats.transferred += items.len() as u64;
        Ok(())
    }

    async fn spill(&mut self, batches: u64) -> Result<()> {
        let count = self.settings.thresholds.redis_chunk as u64;
        for _ in 0..batches {
            let items = self.broker.pop_front(&self.settings.in_key, count).await?;
            if items.is_empty() {
                debug!("In-queue drained before spill finished");
                break;
            }
            if let Err(err) = self.store.write(&items) {
                // Only the unstored suffix goes back; the rest is on disk.
                self.stats.spilled += err.written as u64;
                if err.written > 0 {
                    self.empty_hint = false;
                }
                return Err(self.requeue(&items[err.written..], err.source).await);
            }
            self.stats.spilled += items.len() as u64;
            self.empty_hint = false;
        }
        Ok(())
    }

    async fn reload(&mut self, lengths: QueueLengths, plan: TickPlan) -> Result<TickOutcome> {
        if self.empty_hint {
            if lengths.in_len > 0 {
                info!(
                    action = %plan.action,
                    items = lengths.in_len,
                    "Directly transferring all items"
                );
                let items = self.broker.pop_all(&self.settings.in_key).await?;
                if let Err(err) = self.broker.push_back(&self.settings.out_key, &items).await {
                    return Err(self.requeue(&items, err.into()).await);
                }
                self.stats.transferred += items.len() as u64;
            } else {
                debug!(action = %plan.action, "Buffer and in-queue are empty");
            }
            return Ok(TickOutcome::Idle);
        }

        info!(
            action = %plan.action,
            in_len = lengths.in_len,
            out_len = lengths.out_len,
            out_chunks = plan.out_chunks,
            "Loading chunk"
        );
        match self.store.load_oldest()? {
            LoadOutcome::Empty => {
                debug!("Buffer is empty");
                self.empty_hint = true;
            }
            LoadOutcome::Orphaned { id } => {
                self.stats.orphaned_chunks += 1;
                warn!(chunk_id = %ChunkId(id), "Items of a missing chunk file were lost");
            }
            LoadOutcome::Loaded(chunk) => {
                let piece = self.settings.thresholds.redis_chunk as usize;
                for batch in chunk.items.chunks(piece.max(1)) {
                    self.broker.push_back(&self.settings.out_key, batch).await?;
                }
                self.store.retire(chunk.id)?;
                self.stats.reloaded += chunk.items.len() as u64;
                debug!(
                    chunk_id = %ChunkId(chunk.id),
                    items = chunk.items.len(),
                    "Chunk reloaded"
                );
            }
        }
        Ok(TickOutcome::Busy)
    }

    /// Put `items` back at the head of the in-queue after `cause` and return
    /// `cause` for the caller to report.
    async fn requeue(&mut self, items: &[Item], cause: Error) -> Error {
        if items.is_empty() {
            return cause;
        }
        match self.broker.push_front(&self.settings.in_key, items).await {
            Ok(()) => {
                self.stats.requeued += items.len() as u64;
                warn!(items = items.len(), error = %cause, "Returned items to the in-queue");
            }
            Err(err) => {
                error!(
                    items = items.len(),
                    error = %cause,
                    requeue_error = %err,
                    "Could not return items to the in-queue; they are lost"
                );
            }
        }
        cause
    }
}
