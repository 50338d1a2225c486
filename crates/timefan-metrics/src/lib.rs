//! Self-Telemetry: Scopes, Bound Fields and the Series Registry
//!
//! The broker observes itself with the same flat rows it ships for users. A
//! `Scope` is a nested namespace — `scope("broker").scope("write")` yields
//! the dot-joined metric name `broker.write` with inherited tags — and bound
//! fields are lock-free atomics registered once per (series, field, type).
//!
//! The registry keys series by the same xxhash64 the row builder uses, so a
//! gathered telemetry row routes through the shard path exactly like any
//! ingested row.
//!
//! Misuse (empty names, odd tag lists, re-registering a field under another
//! type) is a programmer error: it returns a typed error and logs loudly,
//! it never panics.

pub mod error;
pub mod fields;
pub mod registry;
pub mod scope;

pub use error::{MetricError, Result};
pub use fields::{BoundCounter, BoundGauge, BoundHistogram, BoundMax, BoundMin};
pub use registry::{default_registry, Registry};
pub use scope::Scope;
