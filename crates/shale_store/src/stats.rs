//! Operational counters and sampled rate metrics.
//!
//! Counters are monotonic `AtomicU64` accumulators grouped into component
//! matrices. Subtracting two matrix snapshots yields a delta used by the
//! periodic full-time matrix log. The instantaneous metrics keep a ring of
//! sixteen 100 ms rate samples per metric; the published value is the mean of
//! the ring.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

/// Number of rate samples kept per instantaneous metric.
pub const STATS_METRIC_SAMPLES: usize = 16;

pub fn ns_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

pub fn us_since_epoch() -> u64 {
    ns_since_epoch() / 1_000
}

pub fn ms_since_epoch() -> u64 {
    ns_since_epoch() / 1_000_000
}

/// Metrics sampled by the cron loop every 100 ms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    Command = 0,
    NetInput = 1,
    NetOutput = 2,
}

const METRIC_COUNT: usize = 3;

#[derive(Clone, Copy, Default)]
struct InstMetric {
    last_sample_time_ms: u64,
    last_sample_count: u64,
    idx: usize,
    samples: [u64; STATS_METRIC_SAMPLES],
}

/// Server-wide counters plus the instantaneous metric rings.
#[derive(Default)]
pub struct ServerStat {
    pub expired_keys: AtomicU64,
    pub keyspace_hits: AtomicU64,
    pub keyspace_misses: AtomicU64,
    pub keyspace_incorrect_ep: AtomicU64,
    pub rejected_conn: AtomicU64,
    pub sync_full: AtomicU64,
    pub sync_partial_ok: AtomicU64,
    pub sync_partial_err: AtomicU64,
    pub net_input_bytes: AtomicU64,
    pub net_output_bytes: AtomicU64,
    inst: Mutex<[InstMetric; METRIC_COUNT]>,
}

impl ServerStat {
    /// Store one rate sample computed from the delta against the previous
    /// reading. The cron loop is the only caller.
    pub fn track_instantaneous(&self, metric: Metric, current_reading: u64) {
        self.track_instantaneous_at(metric, current_reading, ms_since_epoch());
    }

    fn track_instantaneous_at(&self, metric: Metric, current_reading: u64, now_ms: u64) {
        let mut inst = self.inst.lock().unwrap();
        let m = &mut inst[metric as usize];
        let elapsed = now_ms.saturating_sub(m.last_sample_time_ms);
        let ops = current_reading.saturating_sub(m.last_sample_count);
        let ops_sec = if elapsed > 0 { ops * 1000 / elapsed } else { 0 };
        m.samples[m.idx] = ops_sec;
        m.idx = (m.idx + 1) % STATS_METRIC_SAMPLES;
        m.last_sample_time_ms = now_ms;
        m.last_sample_count = current_reading;
    }

    /// Mean of the sample ring for one metric.
    pub fn instantaneous(&self, metric: Metric) -> u64 {
        let inst = self.inst.lock().unwrap();
        let m = &inst[metric as usize];
        m.samples.iter().sum::<u64>() / STATS_METRIC_SAMPLES as u64
    }

    /// Zero every counter and every sample ring.
    pub fn reset(&self) {
        self.expired_keys.store(0, Ordering::Relaxed);
        self.keyspace_hits.store(0, Ordering::Relaxed);
        self.keyspace_misses.store(0, Ordering::Relaxed);
        self.keyspace_incorrect_ep.store(0, Ordering::Relaxed);
        self.rejected_conn.store(0, Ordering::Relaxed);
        self.sync_full.store(0, Ordering::Relaxed);
        self.sync_partial_ok.store(0, Ordering::Relaxed);
        self.sync_partial_err.store(0, Ordering::Relaxed);
        self.net_input_bytes.store(0, Ordering::Relaxed);
        self.net_output_bytes.store(0, Ordering::Relaxed);
        let mut inst = self.inst.lock().unwrap();
        *inst = [InstMetric::default(); METRIC_COUNT];
    }
}

/// Connection and framing counters owned by the network layer.
#[derive(Default)]
pub struct NetworkMatrix {
    pub sticky_packets: AtomicU64,
    pub conn_created: AtomicU64,
    pub conn_released: AtomicU64,
    pub invalid_packets: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub sticky_packets: u64,
    pub conn_created: u64,
    pub conn_released: u64,
    pub invalid_packets: u64,
}

impl NetworkMatrix {
    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            sticky_packets: self.sticky_packets.load(Ordering::Relaxed),
            conn_created: self.conn_created.load(Ordering::Relaxed),
            conn_released: self.conn_released.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.sticky_packets.store(0, Ordering::Relaxed);
        self.conn_created.store(0, Ordering::Relaxed);
        self.conn_released.store(0, Ordering::Relaxed);
        self.invalid_packets.store(0, Ordering::Relaxed);
    }
}

impl NetworkSnapshot {
    pub fn delta(&self, earlier: &NetworkSnapshot) -> NetworkSnapshot {
        NetworkSnapshot {
            sticky_packets: self.sticky_packets - earlier.sticky_packets,
            conn_created: self.conn_created - earlier.conn_created,
            conn_released: self.conn_released - earlier.conn_released,
            invalid_packets: self.invalid_packets - earlier.invalid_packets,
        }
    }
}

/// Worker pool queue/execution counters, shared by every pool.
#[derive(Default)]
pub struct PoolMatrix {
    /// Gauge of jobs currently queued across all pools.
    pub in_queue: AtomicU64,
    pub executed: AtomicU64,
    pub queue_time_ns: AtomicU64,
    pub execute_time_ns: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub in_queue: u64,
    pub executed: u64,
    pub queue_time_ns: u64,
    pub execute_time_ns: u64,
}

impl PoolMatrix {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            in_queue: self.in_queue.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            queue_time_ns: self.queue_time_ns.load(Ordering::Relaxed),
            execute_time_ns: self.execute_time_ns.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.in_queue.store(0, Ordering::Relaxed);
        self.executed.store(0, Ordering::Relaxed);
        self.queue_time_ns.store(0, Ordering::Relaxed);
        self.execute_time_ns.store(0, Ordering::Relaxed);
    }
}

impl PoolSnapshot {
    pub fn delta(&self, earlier: &PoolSnapshot) -> PoolSnapshot {
        PoolSnapshot {
            // Gauge, not an accumulator.
            in_queue: self.in_queue,
            executed: self.executed - earlier.executed,
            queue_time_ns: self.queue_time_ns - earlier.queue_time_ns,
            execute_time_ns: self.execute_time_ns - earlier.execute_time_ns,
        }
    }
}

/// Request dispatcher counters.
#[derive(Default)]
pub struct RequestMatrix {
    pub processed: AtomicU64,
    pub process_cost_ns: AtomicU64,
    pub send_packet_cost_ns: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub processed: u64,
    pub process_cost_ns: u64,
    pub send_packet_cost_ns: u64,
}

impl RequestMatrix {
    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            process_cost_ns: self.process_cost_ns.load(Ordering::Relaxed),
            send_packet_cost_ns: self.send_packet_cost_ns.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.process_cost_ns.store(0, Ordering::Relaxed);
        self.send_packet_cost_ns.store(0, Ordering::Relaxed);
    }
}

impl RequestSnapshot {
    pub fn delta(&self, earlier: &RequestSnapshot) -> RequestSnapshot {
        RequestSnapshot {
            processed: self.processed - earlier.processed,
            process_cost_ns: self.process_cost_ns - earlier.process_cost_ns,
            send_packet_cost_ns: self.send_packet_cost_ns - earlier.send_packet_cost_ns,
        }
    }
}

/// Render the stats section of INFO. The counter names are stable wire
/// strings consumed by external tooling; do not rename them.
pub fn stat_info(
    stat: &ServerStat,
    net: &NetworkMatrix,
    pool: &PoolMatrix,
    req: &RequestMatrix,
) -> String {
    let net = net.snapshot();
    let pool = pool.snapshot();
    let req = req.snapshot();

    let mut out = String::with_capacity(1024);
    let mut line = |name: &str, value: String| {
        out.push_str(name);
        out.push(':');
        out.push_str(&value);
        out.push_str("\r\n");
    };

    line("total_connections_received", net.conn_created.to_string());
    line("total_connections_released", net.conn_released.to_string());
    let executed = req.processed;
    line("total_commands_processed", executed.to_string());
    line(
        "instantaneous_ops_per_sec",
        stat.instantaneous(Metric::Command).to_string(),
    );

    let all_cost = pool.execute_time_ns + pool.queue_time_ns + req.send_packet_cost_ns;
    line("total_commands_cost(ns)", all_cost.to_string());
    line(
        "total_commands_workpool_queue_cost(ns)",
        pool.queue_time_ns.to_string(),
    );
    line(
        "total_commands_workpool_execute_cost(ns)",
        pool.execute_time_ns.to_string(),
    );
    line(
        "total_commands_send_packet_cost(ns)",
        req.send_packet_cost_ns.to_string(),
    );
    line(
        "total_commands_execute_cost(ns)",
        req.process_cost_ns.to_string(),
    );

    let executed = executed.max(1);
    line("avg_commands_cost(ns)", (all_cost / executed).to_string());
    line(
        "avg_commands_workpool_queue_cost(ns)",
        (pool.queue_time_ns / executed).to_string(),
    );
    line(
        "avg_commands_workpool_execute_cost(ns)",
        (pool.execute_time_ns / executed).to_string(),
    );
    line(
        "avg_commands_send_packet_cost(ns)",
        (req.send_packet_cost_ns / executed).to_string(),
    );
    line(
        "avg_commands_execute_cost(ns)",
        (req.process_cost_ns / executed).to_string(),
    );

    line("commands_in_queue", pool.in_queue.to_string());
    line("commands_executed_in_workpool", pool.executed.to_string());

    line("total_stricky_packets", net.sticky_packets.to_string());
    line("total_invalid_packets", net.invalid_packets.to_string());

    line(
        "total_net_input_bytes",
        stat.net_input_bytes.load(Ordering::Relaxed).to_string(),
    );
    line(
        "total_net_output_bytes",
        stat.net_output_bytes.load(Ordering::Relaxed).to_string(),
    );
    line(
        "instantaneous_input_kbps",
        format!("{}", stat.instantaneous(Metric::NetInput) as f64 / 1024.0),
    );
    line(
        "instantaneous_output_kbps",
        format!("{}", stat.instantaneous(Metric::NetOutput) as f64 / 1024.0),
    );
    line(
        "rejected_connections",
        stat.rejected_conn.load(Ordering::Relaxed).to_string(),
    );
    line("sync_full", stat.sync_full.load(Ordering::Relaxed).to_string());
    line(
        "sync_partial_ok",
        stat.sync_partial_ok.load(Ordering::Relaxed).to_string(),
    );
    line(
        "sync_partial_err",
        stat.sync_partial_err.load(Ordering::Relaxed).to_string(),
    );
    line(
        "expired_keys",
        stat.expired_keys.load(Ordering::Relaxed).to_string(),
    );
    line(
        "keyspace_hits",
        stat.keyspace_hits.load(Ordering::Relaxed).to_string(),
    );
    line(
        "keyspace_misses",
        stat.keyspace_misses.load(Ordering::Relaxed).to_string(),
    );
    line(
        "keyspace_wrong_versionep",
        stat.keyspace_incorrect_ep.load(Ordering::Relaxed).to_string(),
    );
    out
}

/// Emit the requested stat sections as JSON, keyed by
/// `{network, request, req_pool}`.
pub fn json_stat(
    sections: &HashSet<String>,
    net: &NetworkMatrix,
    pool: &PoolMatrix,
    req: &RequestMatrix,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    if sections.contains("network") {
        let net = net.snapshot();
        out.insert(
            "network".to_string(),
            json!({
                "sticky_packets": net.sticky_packets,
                "conn_created": net.conn_created,
                "conn_released": net.conn_released,
                "invalid_packets": net.invalid_packets,
            }),
        );
    }
    if sections.contains("request") {
        let req = req.snapshot();
        out.insert(
            "request".to_string(),
            json!({
                "processed": req.processed,
                "process_cost": req.process_cost_ns,
                "send_packet_cost": req.send_packet_cost_ns,
            }),
        );
    }
    if sections.contains("req_pool") {
        let pool = pool.snapshot();
        out.insert(
            "req_pool".to_string(),
            json!({
                "in_queue": pool.in_queue,
                "executed": pool.executed,
                "queue_time": pool.queue_time_ns,
                "execute_time": pool.execute_time_ns,
            }),
        );
    }
    serde_json::Value::Object(out)
}
