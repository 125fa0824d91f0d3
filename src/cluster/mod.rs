//! Gather of per-node summaries onto the coordinator.
//!
//! One cycle of the exchange, seen from the coordinator (rank 0):
//!
//! 1. every worker sends `Count(n)`;
//! 2. the coordinator checks the total against its queue's free slots and
//!    answers `Proceed`, or `Abort` to everyone when it would overflow;
//! 3. every worker sends `Records`;
//! 4. the coordinator re-queues its own summaries followed by every worker's
//!    in rank order, then sends `Done` to release the workers.
//!
//! With a world size of one the exchange is skipped entirely.

pub mod wire;

use std::io;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use self::wire::{Frame, FrameType, WireError, HEADER_LEN};
use crate::config::ClusterConfig;
use crate::queue::RecordQueue;
use crate::stats::ProcessSummary;

/// Rank of the node that merges and emits.
pub const COORDINATOR_RANK: u32 = 0;

/// Pause between worker connection attempts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Gather failures. All of them end the cycle; none are retried.
#[derive(Error, Debug)]
pub enum GatherError {
    #[error(
        "gather would overflow the coordinator queue: {incoming} summaries incoming, \
         {free} slots free; raise buffer_capacity"
    )]
    CapacityExceeded { incoming: u64, free: u64 },

    #[error("coordinator aborted the gather: {incoming} summaries incoming, {free} slots free")]
    Aborted { incoming: u64, free: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Counts from one completed gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatherOutcome {
    /// Summaries this node contributed.
    pub local: usize,
    /// Summaries received from workers (coordinator only).
    pub remote: usize,
    /// Summaries the coordinator queue rejected while merging.
    pub dropped: usize,
}

/// Framed connection to one other node.
#[derive(Debug)]
struct Peer<S> {
    rank: u32,
    stream: S,
    buf: BytesMut,
}

impl<S> Peer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(rank: u32, stream: S) -> Self {
        Self {
            rank,
            stream,
            buf: BytesMut::with_capacity(HEADER_LEN),
        }
    }

    async fn send(&mut self, own_rank: u32, frame: &Frame) -> Result<(), GatherError> {
        self.buf.clear();
        wire::encode_frame(own_rank, frame, &mut self.buf)?;
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<(u32, Frame), GatherError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let header = wire::decode_header(&header)?;

        let mut payload = vec![0u8; header.payload_len];
        self.stream.read_exact(&mut payload).await?;

        let frame = wire::decode_payload(&header, Bytes::from(payload))?;
        Ok((header.rank, frame))
    }

    /// Receives a frame and checks it came from this peer's rank.
    async fn recv_from_peer(&mut self) -> Result<Frame, GatherError> {
        let (rank, frame) = self.recv().await?;
        if rank != self.rank {
            return Err(GatherError::Protocol(format!(
                "frame from rank {rank} on connection of rank {}",
                self.rank
            )));
        }
        Ok(frame)
    }
}

fn unexpected(expected: FrameType, got: &Frame, rank: u32) -> GatherError {
    GatherError::Protocol(format!(
        "expected {expected} frame, got {} from rank {rank}",
        got.frame_type()
    ))
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Rank 0 side of the exchange, holding one connection per worker.
#[derive(Debug)]
pub struct Coordinator<S> {
    workers: Vec<Peer<S>>,
}

impl<S> Coordinator<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Reads the hello frame from every stream and orders the workers by
    /// rank. Exactly `world_size - 1` distinct worker ranks are required.
    pub async fn handshake(streams: Vec<S>, world_size: u32) -> Result<Self, GatherError> {
        let expected = world_size.saturating_sub(1) as usize;
        if streams.len() != expected {
            return Err(GatherError::Protocol(format!(
                "{} worker connections for world size {world_size}",
                streams.len()
            )));
        }

        let mut workers = Vec::with_capacity(streams.len());
        for stream in streams {
            let mut peer = Peer::new(COORDINATOR_RANK, stream);
            let (rank, frame) = peer.recv().await?;
            if frame != Frame::Hello {
                return Err(unexpected(FrameType::Hello, &frame, rank));
            }
            if rank == COORDINATOR_RANK || rank >= world_size {
                return Err(GatherError::Protocol(format!(
                    "worker rank {rank} outside 1..{world_size}"
                )));
            }
            if workers.iter().any(|w: &Peer<S>| w.rank == rank) {
                return Err(GatherError::Protocol(format!(
                    "rank {rank} registered twice"
                )));
            }

            debug!(rank, "worker registered");
            peer.rank = rank;
            workers.push(peer);
        }

        workers.sort_by_key(|w| w.rank);
        Ok(Self { workers })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Runs one gather, leaving every node's summaries in `queue`.
    pub async fn gather(
        &mut self,
        queue: &mut RecordQueue<ProcessSummary>,
    ) -> Result<GatherOutcome, GatherError> {
        let mut counts = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            match worker.recv_from_peer().await? {
                Frame::Count(n) => counts.push(n),
                other => return Err(unexpected(FrameType::Count, &other, worker.rank)),
            }
        }

        let incoming: u64 = counts.iter().sum();
        let free = queue.free() as u64;
        if incoming > free {
            let abort = Frame::Abort { incoming, free };
            for worker in &mut self.workers {
                if let Err(e) = worker.send(COORDINATOR_RANK, &abort).await {
                    warn!(rank = worker.rank, error = %e, "notifying worker of abort");
                }
            }
            return Err(GatherError::CapacityExceeded { incoming, free });
        }

        for worker in &mut self.workers {
            worker.send(COORDINATOR_RANK, &Frame::Proceed).await?;
        }

        let mut remote = Vec::with_capacity(self.workers.len());
        for (worker, count) in self.workers.iter_mut().zip(&counts) {
            let records = match worker.recv_from_peer().await? {
                Frame::Records(records) => records,
                other => return Err(unexpected(FrameType::Records, &other, worker.rank)),
            };
            if records.len() as u64 != *count {
                return Err(GatherError::Protocol(format!(
                    "rank {} announced {count} summaries but sent {}",
                    worker.rank,
                    records.len()
                )));
            }
            if let Some(bad) = records.iter().find(|s| s.rank != worker.rank) {
                return Err(GatherError::Protocol(format!(
                    "rank {} sent a summary tagged rank {} (pid {})",
                    worker.rank, bad.rank, bad.pid
                )));
            }
            remote.push(records);
        }

        let local: Vec<ProcessSummary> = queue.drain().collect();
        let mut outcome = GatherOutcome {
            local: local.len(),
            ..Default::default()
        };

        for summary in local {
            if !requeue(queue, summary) {
                outcome.dropped += 1;
            }
        }
        for summary in remote.into_iter().flatten() {
            if requeue(queue, summary) {
                outcome.remote += 1;
            } else {
                outcome.dropped += 1;
            }
        }

        for worker in &mut self.workers {
            worker.send(COORDINATOR_RANK, &Frame::Done).await?;
        }

        Ok(outcome)
    }
}

/// Inserts a merged summary, logging and discarding it if the queue is full.
fn requeue(queue: &mut RecordQueue<ProcessSummary>, summary: ProcessSummary) -> bool {
    match queue.try_insert(summary) {
        Ok(()) => true,
        Err(full) => {
            warn!(
                rank = full.record.rank,
                pid = full.record.pid,
                capacity = full.capacity,
                "coordinator queue full, dropping summary"
            );
            false
        }
    }
}

impl Coordinator<TcpStream> {
    /// Accepts and registers `world_size - 1` workers on `listener`.
    pub async fn accept(
        listener: &TcpListener,
        world_size: u32,
        timeout: Duration,
    ) -> Result<Self, GatherError> {
        tokio::time::timeout(timeout, Self::accept_all(listener, world_size))
            .await
            .map_err(|_| {
                GatherError::Protocol(format!(
                    "timed out after {timeout:?} waiting for {} workers",
                    world_size.saturating_sub(1)
                ))
            })?
    }

    async fn accept_all(listener: &TcpListener, world_size: u32) -> Result<Self, GatherError> {
        let expected = world_size.saturating_sub(1) as usize;
        let mut streams = Vec::with_capacity(expected);
        while streams.len() < expected {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            debug!(%addr, "worker connected");
            streams.push(stream);
        }
        Self::handshake(streams, world_size).await
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Non-coordinator side of the exchange.
#[derive(Debug)]
pub struct Worker<S> {
    rank: u32,
    coordinator: Peer<S>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Registers with the coordinator over an established stream.
    pub async fn handshake(rank: u32, stream: S) -> Result<Self, GatherError> {
        if rank == COORDINATOR_RANK {
            return Err(GatherError::Protocol(
                "rank 0 is the coordinator and cannot join as a worker".to_string(),
            ));
        }

        let mut coordinator = Peer::new(COORDINATOR_RANK, stream);
        coordinator.send(rank, &Frame::Hello).await?;
        Ok(Self { rank, coordinator })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Ships every summary in `queue` to the coordinator and waits for the
    /// merge to finish. The queue is empty afterwards.
    pub async fn gather(
        &mut self,
        queue: &mut RecordQueue<ProcessSummary>,
    ) -> Result<GatherOutcome, GatherError> {
        let count = queue.len();
        self.coordinator
            .send(self.rank, &Frame::Count(count as u64))
            .await?;

        match self.coordinator.recv_from_peer().await? {
            Frame::Proceed => {}
            Frame::Abort { incoming, free } => {
                return Err(GatherError::Aborted { incoming, free });
            }
            other => return Err(unexpected(FrameType::Proceed, &other, COORDINATOR_RANK)),
        }

        let records: Vec<ProcessSummary> = queue.drain().collect();
        self.coordinator
            .send(self.rank, &Frame::Records(records))
            .await?;

        match self.coordinator.recv_from_peer().await? {
            Frame::Done => Ok(GatherOutcome {
                local: count,
                ..Default::default()
            }),
            other => Err(unexpected(FrameType::Done, &other, COORDINATOR_RANK)),
        }
    }
}

impl Worker<TcpStream> {
    /// Connects to the coordinator, retrying until `timeout` has elapsed.
    pub async fn connect(addr: &str, rank: u32, timeout: Duration) -> Result<Self, GatherError> {
        let deadline = tokio::time::Instant::now() + timeout;

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    debug!(addr, error = %e, "coordinator not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;

        Self::handshake(rank, stream).await
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// This node's role in the gather.
#[derive(Debug)]
pub enum Cluster<S = TcpStream> {
    /// World size of one; gather is a no-op.
    Single,
    Coordinator(Coordinator<S>),
    Worker(Worker<S>),
}

impl<S> Cluster<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn rank(&self) -> u32 {
        match self {
            Self::Single | Self::Coordinator(_) => COORDINATOR_RANK,
            Self::Worker(w) => w.rank(),
        }
    }

    /// Whether this node owns the merged view and the output sink.
    pub fn is_coordinator(&self) -> bool {
        !matches!(self, Self::Worker(_))
    }

    pub async fn gather(
        &mut self,
        queue: &mut RecordQueue<ProcessSummary>,
    ) -> Result<GatherOutcome, GatherError> {
        match self {
            Self::Single => Ok(GatherOutcome {
                local: queue.len(),
                ..Default::default()
            }),
            Self::Coordinator(c) => c.gather(queue).await,
            Self::Worker(w) => w.gather(queue).await,
        }
    }
}

impl Cluster<TcpStream> {
    /// Establishes this node's connections as described by `cfg`.
    pub async fn from_config(cfg: &ClusterConfig) -> Result<Self> {
        if cfg.world_size <= 1 {
            return Ok(Self::Single);
        }

        if cfg.rank == COORDINATOR_RANK {
            let listener = TcpListener::bind(&cfg.listen_addr)
                .await
                .with_context(|| format!("binding gather listener on {}", cfg.listen_addr))?;
            info!(
                addr = %cfg.listen_addr,
                workers = cfg.world_size - 1,
                "waiting for workers"
            );

            let coordinator = Coordinator::accept(&listener, cfg.world_size, cfg.connect_timeout)
                .await
                .context("registering workers")?;
            info!(workers = coordinator.num_workers(), "all workers registered");

            return Ok(Self::Coordinator(coordinator));
        }

        let Some(addr) = cfg.coordinator_addr.as_deref() else {
            bail!("cluster.coordinator_addr is required on worker ranks");
        };

        let worker = Worker::connect(addr, cfg.rank, cfg.connect_timeout)
            .await
            .with_context(|| format!("joining coordinator at {addr}"))?;
        info!(rank = cfg.rank, %addr, "joined coordinator");

        Ok(Self::Worker(worker))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;

    const PIPE: usize = 64 * 1024;

    fn summary(rank: u32, pid: u32) -> ProcessSummary {
        ProcessSummary {
            pid,
            rank,
            tx_kb: i64::from(pid),
            rx_kb: 0,
            n_event: 1,
            avg_latency_ms: f64::NAN,
            avg_lifetime_ms: 1.0,
            fraction_ipv6: 0.0,
            comm: format!("p{pid}"),
        }
    }

    fn queue_with(capacity: usize, rank: u32, pids: &[u32]) -> RecordQueue<ProcessSummary> {
        let mut q = RecordQueue::new(capacity).unwrap();
        for pid in pids {
            q.try_insert(summary(rank, *pid)).unwrap();
        }
        q
    }

    async fn cluster(world_size: u32) -> (Coordinator<DuplexStream>, Vec<Worker<DuplexStream>>) {
        let mut coord_ends = Vec::new();
        let mut workers = Vec::new();
        // Register in reverse so the coordinator has to sort.
        for rank in (1..world_size).rev() {
            let (a, b) = tokio::io::duplex(PIPE);
            coord_ends.push(a);
            workers.push(Worker::handshake(rank, b).await.unwrap());
        }
        let coordinator = Coordinator::handshake(coord_ends, world_size).await.unwrap();
        (coordinator, workers)
    }

    #[tokio::test]
    async fn test_single_is_identity() {
        let mut q = queue_with(4, 0, &[1, 2]);
        let mut c: Cluster<DuplexStream> = Cluster::Single;

        let outcome = c.gather(&mut q).await.unwrap();
        assert_eq!(outcome.local, 2);
        assert_eq!(outcome.remote, 0);
        assert_eq!(
            q.drain().map(|s| s.pid).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(c.is_coordinator());
        assert_eq!(c.rank(), 0);
    }

    #[tokio::test]
    async fn test_merge_orders_local_then_ranks() {
        let (mut coordinator, workers) = cluster(3).await;
        assert_eq!(coordinator.num_workers(), 2);

        let mut handles = Vec::new();
        for mut w in workers {
            let rank = w.rank();
            handles.push(tokio::spawn(async move {
                let mut q = queue_with(8, rank, &[rank * 10, rank * 10 + 1]);
                let outcome = w.gather(&mut q).await.unwrap();
                assert!(q.is_empty());
                outcome
            }));
        }

        let mut q = queue_with(8, 0, &[5]);
        let outcome = coordinator.gather(&mut q).await.unwrap();
        assert_eq!(outcome.local, 1);
        assert_eq!(outcome.remote, 4);
        assert_eq!(outcome.dropped, 0);

        for h in handles {
            assert_eq!(h.await.unwrap().local, 2);
        }

        let merged: Vec<(u32, u32)> = q.drain().map(|s| (s.rank, s.pid)).collect();
        assert_eq!(merged, vec![(0, 5), (1, 10), (1, 11), (2, 20), (2, 21)]);
    }

    #[tokio::test]
    async fn test_capacity_overflow_aborts_everyone() {
        let (mut coordinator, mut workers) = cluster(2).await;
        let mut w = workers.pop().unwrap();

        let handle = tokio::spawn(async move {
            let mut q = queue_with(8, 1, &[1, 2, 3]);
            w.gather(&mut q).await
        });

        let mut q = queue_with(3, 0, &[9]);
        let err = coordinator.gather(&mut q).await.unwrap_err();
        assert!(matches!(
            err,
            GatherError::CapacityExceeded {
                incoming: 3,
                free: 2
            }
        ));
        // Local summaries are untouched by a failed gather.
        assert_eq!(q.len(), 1);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            GatherError::Aborted {
                incoming: 3,
                free: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_exact_fit_is_accepted() {
        let (mut coordinator, mut workers) = cluster(2).await;
        let mut w = workers.pop().unwrap();

        let handle = tokio::spawn(async move {
            let mut q = queue_with(4, 1, &[1, 2]);
            w.gather(&mut q).await
        });

        let mut q = queue_with(3, 0, &[9]);
        let outcome = coordinator.gather(&mut q).await.unwrap();
        assert_eq!(outcome.remote, 2);
        assert!(q.is_full());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mistagged_summary_rejected() {
        let (mut coordinator, mut workers) = cluster(2).await;
        let mut w = workers.pop().unwrap();

        let handle = tokio::spawn(async move {
            let mut q = queue_with(4, 7, &[1]);
            w.gather(&mut q).await
        });

        let mut q = queue_with(4, 0, &[9]);
        let err = coordinator.gather(&mut q).await.unwrap_err();
        assert!(matches!(err, GatherError::Protocol(_)), "{err}");
        // Nothing was merged.
        assert_eq!(q.len(), 1);

        // The worker never gets a done frame.
        drop(coordinator);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_duplicate_rank() {
        let (a1, b1) = tokio::io::duplex(PIPE);
        let (a2, b2) = tokio::io::duplex(PIPE);
        Worker::handshake(1, b1).await.unwrap();
        Worker::handshake(1, b2).await.unwrap();

        let err = Coordinator::handshake(vec![a1, a2], 3).await.unwrap_err();
        assert!(matches!(err, GatherError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_out_of_range_rank() {
        let (a, b) = tokio::io::duplex(PIPE);
        Worker::handshake(5, b).await.unwrap();

        let err = Coordinator::handshake(vec![a], 2).await.unwrap_err();
        assert!(matches!(err, GatherError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_worker_cannot_be_rank_zero() {
        let (_a, b) = tokio::io::duplex(PIPE);
        assert!(Worker::handshake(0, b).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_is_io_error() {
        let (a, b) = tokio::io::duplex(PIPE);
        Worker::handshake(1, b).await.map(drop).unwrap();

        let mut coordinator = Coordinator::handshake(vec![a], 2).await.unwrap();
        let mut q = queue_with(4, 0, &[]);
        let err = coordinator.gather(&mut q).await.unwrap_err();
        assert!(matches!(err, GatherError::Io(_)));
    }
}
