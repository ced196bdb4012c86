#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries in microseconds.
const BUCKET_BOUNDS_US: [u64; 10] = [
    500,        // 0.5ms
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    50_000,     // 50ms
    100_000,    // 100ms
    500_000,    // 500ms
    1_000_000,  // 1s
    5_000_000,  // 5s
    20_000_000, // 20s
];

const BUCKET_LABELS: [&str; 10] = [
    "0.0005", "0.001", "0.005", "0.01", "0.05", "0.1", "0.5", "1", "5", "20",
];

/// Cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// On-demand gauges read from the live tables at scrape time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveGauges {
    pub rooms: usize,
    pub occupants: usize,
    pub streams: usize,
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    messages_relayed_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    streams_started_total: AtomicU64,
    stream_failures_total: AtomicU64,
    chunks_received_total: AtomicU64,
    chunks_busy_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
    stream_startup: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                messages_relayed_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                streams_started_total: AtomicU64::new(0),
                stream_failures_total: AtomicU64::new(0),
                chunks_received_total: AtomicU64::new(0),
                chunks_busy_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
                stream_startup: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_relayed(&self) {
        self.inner.messages_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_streams_started(&self) {
        self.inner.streams_started_total.fetch_add(1, Relaxed);
    }

    pub fn inc_stream_failures(&self) {
        self.inner.stream_failures_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chunks_received(&self) {
        self.inner.chunks_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chunks_busy(&self) {
        self.inner.chunks_busy_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Increments connections_active and returns a guard that decrements it on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    // --- Histograms ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Time from spawn to first playlist.
    pub fn observe_stream_startup(&self, duration: Duration) {
        self.inner.stream_startup.observe(duration);
    }

    // --- Prometheus rendering ---

    pub fn render_prometheus(&self, live: LiveGauges) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "castrelay_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "castrelay_messages_received_total", "Total text frames received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "castrelay_messages_sent_total", "Total text frames sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "castrelay_messages_relayed_total", "Total messages relayed between peers", i.messages_relayed_total.load(Relaxed));
        render_counter(&mut out, "castrelay_errors_total", "Total errors reported to clients", i.errors_total.load(Relaxed));
        render_counter(&mut out, "castrelay_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "castrelay_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "castrelay_leaves_total", "Total explicit room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "castrelay_streams_started_total", "Total transcoder sessions that produced a playlist", i.streams_started_total.load(Relaxed));
        render_counter(&mut out, "castrelay_stream_failures_total", "Total failed or crashed transcoder sessions", i.stream_failures_total.load(Relaxed));
        render_counter(&mut out, "castrelay_chunks_received_total", "Total binary media chunks received", i.chunks_received_total.load(Relaxed));
        render_counter(&mut out, "castrelay_chunks_busy_total", "Total media chunks that hit transcoder backpressure", i.chunks_busy_total.load(Relaxed));

        render_gauge(&mut out, "castrelay_connections_active", "Currently open WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "castrelay_rooms_active", "Rooms in the table", live.rooms as u64);
        render_gauge(&mut out, "castrelay_occupants_active", "Occupied room slots", live.occupants as u64);
        render_gauge(&mut out, "castrelay_streams_active", "Transcoder sessions starting or streaming", live.streams as u64);

        i.message_handling.render(
            "castrelay_message_handling_seconds",
            "Text frame handling latency in seconds",
            &mut out,
        );
        i.stream_startup.render(
            "castrelay_stream_startup_seconds",
            "Time from transcoder spawn to first playlist in seconds",
            &mut out,
        );

        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
