//! Bound Metric Fields
//!
//! Lock-free value cells handed out by a scope. Each is bound to one
//! (series, field name) and safe to update from any thread. Gather
//! semantics differ per kind:
//!
//! - **gauge**: reports the last set value
//! - **counter** (delta-sum): reports and resets the delta since last gather
//! - **min / max**: report and reset the extreme since last gather; an
//!   untouched cell emits nothing
//! - **histogram**: reports and resets per-bucket delta counts

use std::sync::atomic::{AtomicU64, Ordering};

fn load_f64(bits: &AtomicU64) -> f64 {
    f64::from_bits(bits.load(Ordering::Relaxed))
}

/// Adds `delta` to an f64 stored as atomic bits.
fn fetch_add_f64(bits: &AtomicU64, delta: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + delta).to_bits();
        match bits.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[derive(Debug)]
pub struct BoundGauge {
    name: String,
    bits: AtomicU64,
}

impl BoundGauge {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, delta: f64) {
        fetch_add_f64(&self.bits, delta);
    }

    pub fn get(&self) -> f64 {
        load_f64(&self.bits)
    }

    pub(crate) fn gather(&self) -> f64 {
        self.get()
    }
}

#[derive(Debug)]
pub struct BoundCounter {
    name: String,
    bits: AtomicU64,
}

impl BoundCounter {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn incr(&self) {
        self.add(1.0);
    }

    pub fn add(&self, delta: f64) {
        fetch_add_f64(&self.bits, delta);
    }

    pub fn get(&self) -> f64 {
        load_f64(&self.bits)
    }

    /// Takes the accumulated delta, resetting to zero.
    pub(crate) fn gather(&self) -> f64 {
        f64::from_bits(self.bits.swap(0f64.to_bits(), Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub struct BoundMax {
    name: String,
    bits: AtomicU64,
}

impl BoundMax {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bits: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update(&self, value: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        while value > f64::from_bits(current) {
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// `None` when nothing was observed since the last gather.
    pub(crate) fn gather(&self) -> Option<f64> {
        let bits = self.bits.swap(f64::NEG_INFINITY.to_bits(), Ordering::Relaxed);
        let value = f64::from_bits(bits);
        value.is_finite().then_some(value)
    }
}

#[derive(Debug)]
pub struct BoundMin {
    name: String,
    bits: AtomicU64,
}

impl BoundMin {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bits: AtomicU64::new(f64::INFINITY.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update(&self, value: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        while value < f64::from_bits(current) {
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn gather(&self) -> Option<f64> {
        let bits = self.bits.swap(f64::INFINITY.to_bits(), Ordering::Relaxed);
        let value = f64::from_bits(bits);
        value.is_finite().then_some(value)
    }
}

/// Fixed-bound delta histogram gathered as a compound field.
#[derive(Debug)]
pub struct BoundHistogram {
    upper_bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
}

impl BoundHistogram {
    /// Default upper bounds: exponential from 1 ms to ~16 s, plus +inf.
    pub(crate) fn with_default_bounds() -> Self {
        let mut bounds: Vec<f64> = (0..15).map(|i| 0.001 * 2f64.powi(i)).collect();
        bounds.push(f64::INFINITY);
        Self::with_bounds(bounds)
    }

    pub(crate) fn with_bounds(upper_bounds: Vec<f64>) -> Self {
        let counts = upper_bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            upper_bounds,
            counts,
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .upper_bounds
            .iter()
            .position(|upper| value <= *upper)
            .unwrap_or(self.upper_bounds.len() - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// (upper bound, delta count) per bucket, resetting the deltas.
    pub(crate) fn gather(&self) -> Vec<(f64, f64)> {
        self.upper_bounds
            .iter()
            .zip(&self.counts)
            .map(|(upper, count)| (*upper, count.swap(0, Ordering::Relaxed) as f64))
            .collect()
    }
}
