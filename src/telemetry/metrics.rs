//! Lock-free instruments.  Every handle is safe to update from any number of
//! requests at once; nothing here allocates after construction.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::security::PiiCategory;

/// Histogram bucket upper bounds in milliseconds.
pub const LATENCY_BUCKETS_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

/// Dotted instrument name to exposition name, e.g. `llm.tokens.input` to
/// `llm_tokens_input`.
fn exposition_name(name: &str) -> String {
    name.replace('.', "_")
}

pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn metric_name(&self) -> String {
        let base = exposition_name(self.name);
        if base.ends_with("_total") {
            base
        } else {
            format!("{}_total", base)
        }
    }

    pub(crate) fn render(&self, buf: &mut String) {
        let metric = self.metric_name();
        writeln!(buf, "# HELP {} {}", metric, self.help).ok();
        writeln!(buf, "# TYPE {} counter", metric).ok();
        writeln!(buf, "{} {}", metric, self.get()).ok();
    }
}

/// Counter with one series per PII category.
pub struct CategoryCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: [AtomicU64; PiiCategory::ALL.len()],
}

impl CategoryCounter {
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: Default::default(),
        }
    }

    pub fn add(&self, category: PiiCategory, n: u64) {
        self.values[category.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, category: PiiCategory) -> u64 {
        self.values[category.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn render(&self, buf: &mut String) {
        let metric = format!("{}_by_type_total", exposition_name(self.name));
        writeln!(buf, "# HELP {} {}", metric, self.help).ok();
        writeln!(buf, "# TYPE {} counter", metric).ok();
        for cat in PiiCategory::ALL {
            writeln!(
                buf,
                "{}{{{}=\"{}\"}} {}",
                metric,
                self.label,
                cat.as_str(),
                self.get(cat)
            )
            .ok();
        }
    }
}

/// Fixed-bucket latency histogram.  The sum is kept as `f64` bits so
/// fractional milliseconds are not lost.
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    counts: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            counts: Default::default(),
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_ms: f64) {
        let value = if value_ms.is_finite() && value_ms > 0.0 {
            value_ms
        } else {
            0.0
        };
        // first bucket >= value; larger values only land in +Inf
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| value <= *ub) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn render(&self, buf: &mut String) {
        let metric = format!("{}_ms", exposition_name(self.name));
        writeln!(buf, "# HELP {} {}", metric, self.help).ok();
        writeln!(buf, "# TYPE {} histogram", metric).ok();
        let mut cumulative: u64 = 0;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            writeln!(buf, "{}_bucket{{le=\"{}\"}} {}", metric, ub, cumulative).ok();
        }
        let count = self.count();
        writeln!(buf, "{}_bucket{{le=\"+Inf\"}} {}", metric, count).ok();
        writeln!(buf, "{}_sum {}", metric, self.sum()).ok();
        writeln!(buf, "{}_count {}", metric, count).ok();
    }
}
