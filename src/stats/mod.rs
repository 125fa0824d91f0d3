//! Per-process running aggregates over parsed tcp events.

use std::collections::HashMap;

use crate::tracer::event::{
    AcceptEvent, ConnLatEvent, ConnectEvent, Event, LifeEvent, RetransEvent, TypedEvent,
    UNKNOWN_COMM,
};

/// Running totals for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessData {
    pub n_accept: u64,
    pub n_connect: u64,
    pub n_connlat: u64,
    pub n_life: u64,
    pub n_retrans: u64,
    pub tx_kb: i64,
    pub rx_kb: i64,
    pub n_ipv4: u64,
    pub n_ipv6: u64,
    pub latency_ms_sum: f64,
    pub lifetime_ms_sum: f64,
    /// Last process name seen for this pid.
    pub comm: String,
}

impl Default for ProcessData {
    fn default() -> Self {
        Self {
            n_accept: 0,
            n_connect: 0,
            n_connlat: 0,
            n_life: 0,
            n_retrans: 0,
            tx_kb: 0,
            rx_kb: 0,
            n_ipv4: 0,
            n_ipv6: 0,
            latency_ms_sum: 0.0,
            lifetime_ms_sum: 0.0,
            comm: UNKNOWN_COMM.to_string(),
        }
    }
}

impl ProcessData {
    /// Total events of every kind.
    pub fn n_event(&self) -> u64 {
        self.n_accept + self.n_connect + self.n_connlat + self.n_life + self.n_retrans
    }

    fn count_family(&mut self, ip_version: u32) {
        match ip_version {
            4 => self.n_ipv4 += 1,
            6 => self.n_ipv6 += 1,
            _ => {}
        }
    }
}

/// Derived per-process snapshot that is gathered and emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub pid: u32,
    /// Rank of the node that observed the process.
    pub rank: u32,
    pub tx_kb: i64,
    pub rx_kb: i64,
    pub n_event: u64,
    /// NaN when no connlat events were seen.
    pub avg_latency_ms: f64,
    /// NaN when no life events were seen.
    pub avg_lifetime_ms: f64,
    /// NaN when no v4 or v6 events were seen.
    pub fraction_ipv6: f64,
    pub comm: String,
}

/// Computes the summary of one aggregate without modifying it.
pub fn summarize(pid: u32, rank: u32, data: &ProcessData) -> ProcessSummary {
    ProcessSummary {
        pid,
        rank,
        tx_kb: data.tx_kb,
        rx_kb: data.rx_kb,
        n_event: data.n_event(),
        avg_latency_ms: data.latency_ms_sum / data.n_connlat as f64,
        avg_lifetime_ms: data.lifetime_ms_sum / data.n_life as f64,
        fraction_ipv6: data.n_ipv6 as f64 / (data.n_ipv6 + data.n_ipv4) as f64,
        comm: data.comm.clone(),
    }
}

/// Maps process ids to their running aggregates.
///
/// Aggregates are created on the first event for a pid and live as long as
/// the aggregator does.
#[derive(Debug, Default)]
pub struct ProcessStatistics {
    processes: HashMap<u32, ProcessData>,
}

impl ProcessStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds any typed event into its process aggregate.
    pub fn add(&mut self, event: &TypedEvent) {
        match event {
            TypedEvent::Accept(e) => self.add_accept(e),
            TypedEvent::Connect(e) => self.add_connect(e),
            TypedEvent::ConnLat(e) => self.add_connlat(e),
            TypedEvent::Life(e) => self.add_life(e),
            TypedEvent::Retrans(e) => self.add_retrans(e),
        }
    }

    pub fn add_accept(&mut self, e: &AcceptEvent) {
        let data = self.entry(&e.event);
        data.n_accept += 1;
        data.comm.clone_from(&e.event.comm);
    }

    pub fn add_connect(&mut self, e: &ConnectEvent) {
        let data = self.entry(&e.event);
        data.n_connect += 1;
        data.comm.clone_from(&e.event.comm);
    }

    pub fn add_connlat(&mut self, e: &ConnLatEvent) {
        let data = self.entry(&e.event);
        data.n_connlat += 1;
        data.latency_ms_sum += e.latency_ms;
        data.comm.clone_from(&e.event.comm);
    }

    pub fn add_life(&mut self, e: &LifeEvent) {
        let data = self.entry(&e.event);
        data.n_life += 1;
        data.tx_kb = data.tx_kb.saturating_add(e.tx_kb);
        data.rx_kb = data.rx_kb.saturating_add(e.rx_kb);
        data.lifetime_ms_sum += e.duration_ms;
        data.comm.clone_from(&e.event.comm);
    }

    /// Retransmissions carry no trustworthy process name, so the stored name
    /// is reset to the unknown marker.
    pub fn add_retrans(&mut self, e: &RetransEvent) {
        let data = self.entry(&e.event);
        data.n_retrans += 1;
        data.comm = UNKNOWN_COMM.to_string();
    }

    fn entry(&mut self, event: &Event) -> &mut ProcessData {
        let data = self.processes.entry(event.pid).or_default();
        data.count_family(event.ip_version);
        data
    }

    pub fn num_distinct_processes(&self) -> usize {
        self.processes.len()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessData> {
        self.processes.get(&pid)
    }

    /// Returns every known pid with its aggregate as parallel vectors.
    /// Order is unspecified.
    pub fn get_all(&self) -> (Vec<u32>, Vec<ProcessData>) {
        self.processes
            .iter()
            .map(|(pid, data)| (*pid, data.clone()))
            .unzip()
    }

    /// Summaries for every known process, tagged with `rank`.
    pub fn summaries(&self, rank: u32) -> impl Iterator<Item = ProcessSummary> + '_ {
        self.processes
            .iter()
            .map(move |(pid, data)| summarize(*pid, rank, data))
    }
}
