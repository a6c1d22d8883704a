//! Hub metrics
//!
//! Engine and task gauges, heartbeat and traffic counters and the query
//! latency histogram. [`gather_hub_metrics`] renders them in the Prometheus
//! text format; the binary logs it on exit.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Event total such as pongs seen or hearts lost
pub struct Counter {
    name: &'static str,
    help: &'static str,
    total: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            total: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Counter split by message tag, e.g. one series per query kind
pub struct TaggedCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    series: Mutex<BTreeMap<&'static str, u64>>,
}

impl TaggedCounter {
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            series: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, tag: &'static str) {
        *self.series.lock().entry(tag).or_insert(0) += 1;
    }

    pub fn get(&self, tag: &str) -> u64 {
        self.series.lock().get(tag).copied().unwrap_or(0)
    }

    pub fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        for (tag, n) in self.series.lock().iter() {
            let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", self.name, self.label, tag, n);
        }
    }
}

/// Current level, overwritten from the registry or ledger after each change
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    level: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            level: AtomicI64::new(0),
        }
    }

    pub fn set(&self, level: i64) {
        self.level.store(level, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Upper bounds in seconds; queries are answered in-process so most land
/// well under a millisecond
const QUERY_BOUNDS: [f64; 10] = [
    0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.01, 0.05, 0.25, 1.0,
];

/// Latency histogram
///
/// Each observation lands in exactly one slot; the cumulative `le` counts
/// are computed when rendering. The last slot is `+Inf`.
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: &'static [f64],
    slots: Vec<AtomicU64>,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn for_queries(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, &QUERY_BOUNDS)
    }

    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            help,
            bounds,
            slots: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, secs: f64) {
        let slot = self.bounds.partition_point(|bound| *bound < secs);
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((secs * 1e6) as u64, Ordering::Relaxed);
    }

    /// Run `f`, recording how long it took
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let out = f();
        self.observe(started.elapsed().as_secs_f64());
        out
    }

    pub fn count(&self) -> u64 {
        self.slots.iter().map(|slot| slot.load(Ordering::Relaxed)).sum()
    }

    pub fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "histogram");
        let mut seen = 0;
        for (bound, slot) in self.bounds.iter().zip(&self.slots) {
            seen += slot.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, seen);
        }
        let total = self.count();
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, total);
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, total);
    }
}

/// Process-wide hub metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static REGISTERED_ENGINES: Gauge =
        Gauge::new("parhub_registered_engines", "Engines past registration");

    pub static PENDING_TASKS: Gauge =
        Gauge::new("parhub_pending_tasks", "Tasks submitted but not completed");

    pub static PONGS_RECEIVED: Counter =
        Counter::new("parhub_pongs_received_total", "Valid heartbeat replies received");

    pub static HEART_FAILURES: Counter =
        Counter::new("parhub_heart_failures_total", "Hearts declared failed");

    pub static STRANDED_TASKS: Counter =
        Counter::new("parhub_stranded_tasks_total", "Tasks failed because their engine died");

    pub static REGISTRATIONS_REJECTED: Counter = Counter::new(
        "parhub_registrations_rejected_total",
        "Registrations refused or timed out",
    );

    pub static QUERIES: LazyLock<TaggedCounter> = LazyLock::new(|| {
        TaggedCounter::new("parhub_queries_total", "Client queries by kind", "kind")
    });

    pub static MONITOR_MESSAGES: LazyLock<TaggedCounter> = LazyLock::new(|| {
        TaggedCounter::new(
            "parhub_monitor_messages_total",
            "Scheduler traffic seen on the monitor socket",
            "kind",
        )
    });

    pub static QUERY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::for_queries("parhub_query_duration_seconds", "Client query handling latency")
    });
}

/// Render every hub metric
pub fn gather_hub_metrics() -> String {
    let mut out = String::new();
    standard::REGISTERED_ENGINES.render(&mut out);
    standard::PENDING_TASKS.render(&mut out);
    standard::PONGS_RECEIVED.render(&mut out);
    standard::HEART_FAILURES.render(&mut out);
    standard::STRANDED_TASKS.render(&mut out);
    standard::REGISTRATIONS_REJECTED.render(&mut out);
    standard::QUERIES.render(&mut out);
    standard::MONITOR_MESSAGES.render(&mut out);
    standard::QUERY_DURATION.render(&mut out);
    out
}
