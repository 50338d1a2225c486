//! Family Channel
//!
//! One writer per (database, shard, family window). Incoming rows append to
//! the current chunk; the chunk seals on size or age and the compressed
//! block goes onto a bounded in-memory channel. A dedicated consumer task
//! drains that channel into the leader's fan-out queue.
//!
//! ```text
//!  write(rows) ──► current chunk ──seal──► [sealed blocks, cap K] ──► sink
//!                    (mutex)               (mpsc, non-blocking)    (consumer
//!                                                                    task)
//! ```
//!
//! The enqueue side is strictly non-blocking: a full channel fails the write
//! with `ChannelFull` so backpressure propagates to the ingestion caller
//! instead of buffering without bound. The writer owns the send side, the
//! consumer owns the receive side; there is no back-pointer between them.

use crate::chunk::{Chunk, ChunkWriter, CompressedChunk};
use crate::config::WriteConfig;
use crate::error::{Error, Result};
use crate::replicator::BlockSink;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use timefan_core::models::ShardId;
use timefan_core::row::MetricRow;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

struct WriterState {
    chunk: Box<dyn ChunkWriter>,
    last_flush: Instant,
}

/// Write channel for one family window of one shard.
pub struct FamilyChannel {
    database: String,
    shard_id: ShardId,
    family_time: i64,
    cfg: WriteConfig,
    writer: Mutex<WriterState>,
    sender: Mutex<Option<mpsc::Sender<CompressedChunk>>>,
    receiver: Mutex<Option<mpsc::Receiver<CompressedChunk>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl FamilyChannel {
    pub fn new(
        database: impl Into<String>,
        shard_id: ShardId,
        family_time: i64,
        cfg: WriteConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.family_channel_capacity.max(1));
        let chunk = Box::new(Chunk::new(cfg.chunk_max_size_bytes));
        Arc::new(Self {
            database: database.into(),
            shard_id,
            family_time,
            cfg,
            writer: Mutex::new(WriterState {
                chunk,
                last_flush: Instant::now(),
            }),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            consumer: Mutex::new(None),
        })
    }

    pub fn family_time(&self) -> i64 {
        self.family_time
    }

    /// Spawns the consumer task draining sealed blocks into `sink`.
    /// Idempotent: only the first call starts a consumer.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn BlockSink>, shutdown: watch::Receiver<bool>) {
        let rx = self.receiver.lock().expect("receiver lock").take();
        let Some(rx) = rx else { return };
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_consumer(rx, sink, shutdown).await });
        *self.consumer.lock().expect("consumer lock") = Some(handle);
    }

    /// Writes rows into the current chunk, sealing it whenever it fills.
    ///
    /// Errors surface the channel's state: `ChannelFull` is backpressure the
    /// caller may retry after a delay, `ChannelClosed` is terminal for this
    /// family.
    pub fn write(&self, rows: &[MetricRow]) -> Result<()> {
        if self.sender.lock().expect("sender lock").is_none() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self.writer.lock().expect("writer lock");
        for row in rows {
            writer.chunk.write(row);
            if writer.chunk.is_full() {
                self.flush_chunk(&mut writer)?;
            }
        }
        Ok(())
    }

    /// Refuses further writes, drains the current chunk and joins the
    /// consumer.
    pub async fn stop(&self) {
        self.write_pending_before_close();
        self.close_sender();
        let handle = self.consumer.lock().expect("consumer lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(
            database = %self.database,
            shard = self.shard_id,
            family = self.family_time,
            "family channel stopped"
        );
    }

    async fn run_consumer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<CompressedChunk>,
        sink: Arc<dyn BlockSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.cfg.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                block = rx.recv() => match block {
                    Some(block) => {
                        if !self.send_to_sink(&sink, block).await {
                            // queue append failure is fatal for this family
                            self.close_sender();
                            rx.close();
                            while rx.recv().await.is_some() {}
                            break;
                        }
                    }
                    None => break, // stopped and fully drained
                },
                _ = ticker.tick() => self.check_flush(),
                _ = shutdown.changed() => {
                    // drain best-effort: seal what is buffered, stop writes,
                    // flush everything already sealed
                    self.write_pending_before_close();
                    self.close_sender();
                    rx.close();
                    while let Some(block) = rx.recv().await {
                        if !self.send_to_sink(&sink, block).await {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        debug!(
            database = %self.database,
            shard = self.shard_id,
            family = self.family_time,
            "family channel consumer exited"
        );
    }

    async fn send_to_sink(&self, sink: &Arc<dyn BlockSink>, block: CompressedChunk) -> bool {
        match sink.append(block).await {
            Ok(seq) => {
                debug!(
                    database = %self.database,
                    shard = self.shard_id,
                    family = self.family_time,
                    seq,
                    "sealed block enqueued for replication"
                );
                true
            }
            Err(e) => {
                error!(
                    database = %self.database,
                    shard = self.shard_id,
                    family = self.family_time,
                    error = %e,
                    "fan-out append failed, stopping family channel"
                );
                false
            }
        }
    }

    /// Timer-driven flush: seals a non-empty chunk older than the flush
    /// interval. Failures here only log — the rows stay lost-bounded by the
    /// chunk, and the next write retries.
    fn check_flush(&self) {
        let mut writer = self.writer.lock().expect("writer lock");
        if writer.chunk.size() > 0 && writer.last_flush.elapsed() >= self.cfg.flush_interval() {
            if let Err(e) = self.flush_chunk(&mut writer) {
                warn!(
                    database = %self.database,
                    shard = self.shard_id,
                    family = self.family_time,
                    error = %e,
                    "timed flush failed"
                );
            }
        }
    }

    fn flush_chunk(&self, writer: &mut WriterState) -> Result<()> {
        let block = writer
            .chunk
            .compress()
            .map_err(|e| Error::Compress(e.to_string()))?;
        let Some(block) = block else { return Ok(()) };
        writer.last_flush = Instant::now();
        self.enqueue(block)
    }

    /// Non-blocking enqueue of one sealed block.
    fn enqueue(&self, block: CompressedChunk) -> Result<()> {
        let sender = self.sender.lock().expect("sender lock");
        let Some(tx) = sender.as_ref() else {
            return Err(Error::ChannelClosed);
        };
        match tx.try_send(block) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::ChannelFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Seals whatever the current chunk holds and enqueues it; a failure at
    /// this point drops the block with a warning (we are closing anyway).
    fn write_pending_before_close(&self) {
        let mut writer = self.writer.lock().expect("writer lock");
        match writer.chunk.compress() {
            Ok(Some(block)) => {
                if let Err(e) = self.enqueue(block) {
                    warn!(
                        database = %self.database,
                        shard = self.shard_id,
                        family = self.family_time,
                        error = %e,
                        "dropping pending chunk on close"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                database = %self.database,
                shard = self.shard_id,
                family = self.family_time,
                error = %e,
                "pending chunk compression failed on close"
            ),
        }
    }

    fn close_sender(&self) {
        self.sender.lock().expect("sender lock").take();
    }

    #[cfg(test)]
    fn swap_chunk(&self, chunk: Box<dyn ChunkWriter>) {
        self.writer.lock().unwrap().chunk = chunk;
    }
}
