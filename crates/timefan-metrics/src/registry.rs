//! Series Registry
//!
//! Concurrent map of every registered series, keyed by the same xxhash64 the
//! row builder stamps into flat rows. Registration is racy-safe with
//! single-winner insertion: two threads building the same (name, tags) both
//! end up holding the one registered series.
//!
//! The registry is an explicitly constructed value threaded through the
//! broker; `default_registry()` is a process-wide convenience on top, not a
//! requirement.

use crate::error::Result;
use crate::scope::{Scope, TaggedSeries};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use timefan_core::row::RowBuilder;
use timefan_core::timeutil::now_ms;
use tracing::debug;

#[derive(Default)]
pub struct Registry {
    series: Mutex<HashMap<u64, Arc<TaggedSeries>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Root scope under this registry.
    pub fn scope(self: &Arc<Self>, name: &str, tags: &[&str]) -> Result<Scope> {
        Scope::root(self.clone(), name, tags)
    }

    /// Inserts `series` unless an equal key is already registered; returns
    /// the winning series either way.
    pub(crate) fn register(&self, series: TaggedSeries) -> Arc<TaggedSeries> {
        let mut map = self.series.lock().expect("registry lock");
        let id = series.series_id();
        map.entry(id)
            .or_insert_with(|| {
                debug!(series = series.metric_name(), id, "series registered");
                Arc::new(series)
            })
            .clone()
    }

    pub fn series_count(&self) -> usize {
        self.series.lock().expect("registry lock").len()
    }

    /// Renders every registered series into flat rows, concatenated as
    /// size-prefixed frames — the exact payload shape the ingestion boundary
    /// accepts, so telemetry self-scrapes through the normal write path.
    pub fn gather_payload(&self) -> Result<Bytes> {
        let all: Vec<Arc<TaggedSeries>> = {
            let map = self.series.lock().expect("registry lock");
            map.values().cloned().collect()
        };
        let timestamp = now_ms();
        let mut payload = BytesMut::new();
        let mut builder = RowBuilder::new();
        for series in all {
            builder.reset();
            if series.build_row(&mut builder, timestamp) {
                builder.build_into(&mut payload)?;
            }
        }
        Ok(payload.freeze())
    }
}

static DEFAULT_REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// Process-wide registry for callers that do not thread their own.
pub fn default_registry() -> &'static Arc<Registry> {
    DEFAULT_REGISTRY.get_or_init(Registry::new)
}
