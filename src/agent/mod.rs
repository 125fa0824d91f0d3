use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::presentation::Presentation;
use crate::queue::RecordQueue;
use crate::sink::{SinkTarget, TextSink};
use crate::stats::{ProcessStatistics, ProcessSummary};
use crate::tailer::TailedFile;
use crate::tracer::event::EventKind;
use crate::tracer::parse::parse_line;
use crate::tracer::stats::EventStats;

/// How often accumulated line counts are logged.
const LINE_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// One tailed input and the kind of line it carries.
#[derive(Debug)]
struct Source {
    kind: EventKind,
    tailer: TailedFile,
}

/// What one polling cycle did on this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub lines_parsed: u64,
    pub lines_rejected: u64,
    /// Parsed events dropped because they came from the agent itself.
    pub self_filtered: u64,
    /// Summaries this node queued for the gather.
    pub local_summaries: usize,
    /// Summaries lost to a full queue, locally or while merging.
    pub dropped: usize,
    /// Summaries written to the sink (coordinator only).
    pub emitted: usize,
}

/// Agent owns every piece of per-node state and drives the polling cycle:
/// read new lines, aggregate, summarize, gather, emit.
pub struct Agent<S = TcpStream> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sources: Vec<Source>,
    stats: ProcessStatistics,
    queue: RecordQueue<ProcessSummary>,
    cluster: Option<Cluster<S>>,
    sink: TextSink,
    presentation: Presentation,
    line_stats: Arc<EventStats>,
    self_pid: u32,
    cycles: u64,
    cancel: CancellationToken,
}

impl<S> Agent<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a new Agent, initializing health metrics and the summary queue.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let queue = RecordQueue::new(cfg.buffer_capacity).context("creating summary queue")?;
        let sink = TextSink::new(SinkTarget::parse(&cfg.output));
        let presentation = Presentation::new(cfg.presentation.clone());

        Ok(Self {
            cfg,
            health,
            sources: Vec::new(),
            stats: ProcessStatistics::new(),
            queue,
            cluster: None,
            sink,
            presentation,
            line_stats: Arc::new(EventStats::new()),
            self_pid: std::process::id(),
            cycles: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Opens every input and starts with an already established cluster
    /// handle.
    pub async fn start_with_cluster(&mut self, cluster: Cluster<S>) -> Result<()> {
        self.open_sources().await?;
        self.attach(cluster).await
    }

    pub fn statistics(&self) -> &ProcessStatistics {
        &self.stats
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Whether this node writes the merged view.
    pub fn is_coordinator(&self) -> bool {
        self.cluster.as_ref().map_or(true, |c| c.is_coordinator())
    }

    /// Opens the configured inputs and discards their header lines. A
    /// missing input is fatal.
    async fn open_sources(&mut self) -> Result<()> {
        let inputs: Vec<(EventKind, PathBuf)> = self
            .cfg
            .inputs
            .sources()
            .into_iter()
            .map(|(kind, path)| (kind, path.to_path_buf()))
            .collect();

        for (kind, path) in inputs {
            let mut tailer = TailedFile::open(&path)
                .await
                .with_context(|| format!("opening {kind} input {}", path.display()))?;
            tailer
                .skip_header(self.cfg.inputs.header_lines)
                .await
                .with_context(|| format!("skipping header of {}", path.display()))?;

            info!(kind = %kind, tool = kind.tool(), path = %path.display(), "tailing input");
            self.sources.push(Source { kind, tailer });
        }

        Ok(())
    }

    async fn attach(&mut self, cluster: Cluster<S>) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        info!(
            rank = cluster.rank(),
            coordinator = cluster.is_coordinator(),
            inputs = self.sources.len(),
            output = %self.sink.target(),
            capacity = self.queue.capacity(),
            "agent started"
        );
        self.cluster = Some(cluster);
        self.spawn_line_stats_reporter();

        Ok(())
    }

    /// Runs polling cycles until `cancel` fires or a cycle fails. A gather
    /// in flight is abandoned on cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let interval = self.cfg.polling_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.run_cycle() => {
                    result?;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Runs one polling cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.read_sources(&mut report).await;
        self.health
            .processes_tracked
            .set(self.stats.num_distinct_processes() as f64);

        let Some(cluster) = self.cluster.as_mut() else {
            anyhow::bail!("agent not started");
        };

        // Local summaries.
        let rank = cluster.rank();
        let mut rejected = 0;
        for summary in self.stats.summaries(rank) {
            if self.queue.try_insert(summary).is_err() {
                rejected += 1;
            }
        }
        if rejected > 0 {
            warn!(
                dropped = rejected,
                capacity = self.queue.capacity(),
                "summary queue full, dropping summaries"
            );
        }
        report.local_summaries = self.queue.len();

        // Gather.
        let started = Instant::now();
        let outcome = match cluster.gather(&mut self.queue).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(rank, error = %e, "gather failed");
                return Err(e).context("gathering summaries");
            }
        };
        self.health
            .gather_duration
            .observe(started.elapsed().as_secs_f64());
        self.health.gather_cycles.inc();

        report.dropped = rejected + outcome.dropped;
        self.health.queue_drops.inc_by(report.dropped as f64);

        // Emit.
        if cluster.is_coordinator() {
            let merged: Vec<ProcessSummary> = self.queue.drain().collect();
            report.emitted = self
                .sink
                .emit(&merged)
                .await
                .with_context(|| format!("writing summaries to {}", self.sink.target()))?;
            self.health.summaries_emitted.inc_by(report.emitted as f64);

            if self.cycles == 0 {
                self.presentation
                    .launch(self.sink.target())
                    .context("launching presentation process")?;
            }
        }

        self.cycles += 1;
        debug!(
            cycle = self.cycles,
            parsed = report.lines_parsed,
            rejected = report.lines_rejected,
            processes = self.stats.num_distinct_processes(),
            local = report.local_summaries,
            remote = outcome.remote,
            emitted = report.emitted,
            "polling cycle complete"
        );

        Ok(report)
    }

    /// Reads every complete line appended to each input since the last
    /// cycle, in kind order.
    async fn read_sources(&mut self, report: &mut CycleReport) {
        let Self {
            sources,
            stats,
            health,
            line_stats,
            self_pid,
            ..
        } = self;

        for source in sources.iter_mut() {
            let grown = match source.tailer.has_grown().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        kind = %source.kind,
                        path = %source.tailer.path().display(),
                        error = %e,
                        "checking input for growth"
                    );
                    0
                }
            };
            if grown == 0 {
                continue;
            }

            let kind = source.kind;
            let read = source
                .tailer
                .read_lines(|line| {
                    ingest_line(kind, line, *self_pid, stats, line_stats, health, report);
                })
                .await;

            if let Err(e) = read {
                warn!(
                    kind = %kind,
                    path = %source.tailer.path().display(),
                    error = %e,
                    "reading input"
                );
            }
        }
    }

    /// Gracefully stop all components. Held summaries and open inputs are
    /// released.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Err(e) = self.presentation.stop().await {
            error!(error = %e, "error stopping presentation process");
        }

        self.queue.drain();
        self.sources.clear();
        self.cluster = None;

        self.health.stop().await?;

        Ok(())
    }

    /// Periodically log per-kind line counts.
    fn spawn_line_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let line_stats = Arc::clone(&self.line_stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LINE_STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = line_stats.snapshot();
                        let parsed: u64 = snapshot.iter().map(|(_, c)| c.parsed).sum();
                        let rejected: u64 = snapshot.iter().map(|(_, c)| c.rejected).sum();

                        if parsed + rejected == 0 {
                            continue;
                        }

                        info!(parsed, rejected, "line stats (60s)");

                        for (kind, counts) in &snapshot {
                            debug!(
                                kind = %kind,
                                parsed = counts.parsed,
                                rejected = counts.rejected,
                                "  by kind (60s)",
                            );
                        }
                    }
                }
            }
        });
    }
}

impl Agent<TcpStream> {
    /// Opens every input, then joins the cluster described by the config.
    pub async fn start(&mut self) -> Result<()> {
        self.open_sources().await?;

        let cluster = Cluster::from_config(&self.cfg.cluster)
            .await
            .context("establishing cluster")?;

        self.attach(cluster).await
    }
}

/// Parses one line and folds it into the aggregate. Bad lines and the
/// agent's own traffic are counted and dropped.
fn ingest_line(
    kind: EventKind,
    line: &str,
    self_pid: u32,
    stats: &mut ProcessStatistics,
    line_stats: &EventStats,
    health: &HealthMetrics,
    report: &mut CycleReport,
) {
    let event = match parse_line(kind, line) {
        Ok(event) => event,
        Err(e) => {
            debug!(kind = %kind, error = %e, line, "dropping unparseable line");
            line_stats.record_rejected(kind);
            report.lines_rejected += 1;
            health
                .lines_read
                .with_label_values(&[kind.as_str(), "rejected"])
                .inc();
            health
                .parse_errors
                .with_label_values(&[kind.as_str(), e.label()])
                .inc();
            return;
        }
    };

    line_stats.record_parsed(kind);
    report.lines_parsed += 1;
    health
        .lines_read
        .with_label_values(&[kind.as_str(), "parsed"])
        .inc();

    if event.pid() == self_pid {
        debug!(kind = %kind, pid = self_pid, "ignoring own traffic");
        report.self_filtered += 1;
        health.self_traffic_filtered.inc();
        return;
    }

    stats.add(&event);
}
