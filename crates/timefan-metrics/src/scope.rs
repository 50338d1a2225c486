//! Scopes and Tagged Series
//!
//! A scope wraps one tagged series: the dot-joined metric name plus the
//! inherited tag set. Child scopes append `.segment` to the name and overlay
//! extra tags (keys unique, latest wins). Bound fields register exactly once
//! per (series, field name, type); asking for the same name under a
//! different type is a caller bug and fails loudly.

use crate::error::{MetricError, Result};
use crate::fields::{BoundCounter, BoundGauge, BoundHistogram, BoundMax, BoundMin};
use crate::registry::Registry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use timefan_core::row::{series_hash, RowBuilder, SimpleFieldType};
use tracing::error;

enum SimpleField {
    Gauge(Arc<BoundGauge>),
    Counter(Arc<BoundCounter>),
    Min(Arc<BoundMin>),
    Max(Arc<BoundMax>),
}

impl SimpleField {
    fn name(&self) -> &str {
        match self {
            SimpleField::Gauge(f) => f.name(),
            SimpleField::Counter(f) => f.name(),
            SimpleField::Min(f) => f.name(),
            SimpleField::Max(f) => f.name(),
        }
    }

    fn field_type(&self) -> SimpleFieldType {
        match self {
            SimpleField::Gauge(_) => SimpleFieldType::Gauge,
            SimpleField::Counter(_) => SimpleFieldType::DeltaSum,
            SimpleField::Min(_) => SimpleFieldType::Min,
            SimpleField::Max(_) => SimpleFieldType::Max,
        }
    }
}

#[derive(Default)]
struct SeriesPayload {
    simple_fields: Vec<SimpleField>,
    histogram: Option<Arc<BoundHistogram>>,
}

/// One registered series: canonical name + tags + its bound fields.
pub struct TaggedSeries {
    series_id: u64,
    metric_name: String,
    tags: BTreeMap<String, String>,
    payload: Mutex<SeriesPayload>,
}

impl TaggedSeries {
    fn new(metric_name: String, tags: BTreeMap<String, String>) -> Self {
        let series_id = series_hash(
            metric_name.as_bytes(),
            tags.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())),
        );
        Self {
            series_id,
            metric_name,
            tags,
            payload: Mutex::new(SeriesPayload::default()),
        }
    }

    pub fn series_id(&self) -> u64 {
        self.series_id
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    fn find_simple_field<T, F, G>(
        &self,
        field_name: &str,
        field_type: SimpleFieldType,
        create: F,
        extract: G,
    ) -> Result<Arc<T>>
    where
        F: FnOnce(&str) -> SimpleField,
        G: Fn(&SimpleField) -> Option<Arc<T>>,
    {
        if field_name.is_empty() {
            return Err(MetricError::EmptyFieldName);
        }
        let mut payload = self.payload.lock().expect("payload lock");
        for field in &payload.simple_fields {
            if field.name() == field_name {
                if field.field_type() != field_type {
                    let conflict = MetricError::FieldTypeConflict {
                        field: field_name.to_string(),
                        registered: field.field_type(),
                        requested: field_type,
                    };
                    error!(
                        series = %self.metric_name,
                        error = %conflict,
                        "metric field registered under conflicting types"
                    );
                    return Err(conflict);
                }
                return Ok(extract(field).expect("type checked above"));
            }
        }
        let field = create(field_name);
        let bound = extract(&field).expect("freshly created field");
        payload.simple_fields.push(field);
        Ok(bound)
    }

    /// Renders this series into `builder`. False when there is nothing to
    /// emit (only untouched min/max cells and no other fields).
    pub(crate) fn build_row(&self, builder: &mut RowBuilder, timestamp: i64) -> bool {
        builder
            .metric_name(self.metric_name.as_bytes())
            .timestamp(timestamp);
        for (key, value) in &self.tags {
            builder.tag(key.as_bytes(), value.as_bytes());
        }

        let payload = self.payload.lock().expect("payload lock");
        let mut emitted = false;
        for field in &payload.simple_fields {
            let wrote = match field {
                SimpleField::Gauge(f) => builder
                    .simple_field(f.name().as_bytes(), SimpleFieldType::Gauge, f.gather())
                    .is_ok(),
                SimpleField::Counter(f) => builder
                    .simple_field(f.name().as_bytes(), SimpleFieldType::DeltaSum, f.gather())
                    .is_ok(),
                SimpleField::Min(f) => match f.gather() {
                    Some(value) => builder
                        .simple_field(f.name().as_bytes(), SimpleFieldType::Min, value)
                        .is_ok(),
                    None => false,
                },
                SimpleField::Max(f) => match f.gather() {
                    Some(value) => builder
                        .simple_field(f.name().as_bytes(), SimpleFieldType::Max, value)
                        .is_ok(),
                    None => false,
                },
            };
            emitted |= wrote;
        }
        if let Some(histogram) = &payload.histogram {
            let buckets: Vec<_> = histogram
                .gather()
                .into_iter()
                .map(|(upper, count)| timefan_core::row::HistogramBucket { upper, count })
                .collect();
            builder.compound_field(&buckets);
            emitted = true;
        }
        emitted
    }
}

/// A namespace handle; cheap to clone, all clones share the series.
#[derive(Clone)]
pub struct Scope {
    registry: Arc<Registry>,
    series: Arc<TaggedSeries>,
}

impl Scope {
    pub(crate) fn root(registry: Arc<Registry>, name: &str, tags: &[&str]) -> Result<Self> {
        if name.is_empty() {
            return Err(MetricError::EmptyMetricName);
        }
        let tags = tag_pairs(BTreeMap::new(), tags)?;
        let series = registry.register(TaggedSeries::new(name.to_string(), tags));
        Ok(Self { registry, series })
    }

    /// Child scope: `parent.name`, parent tags overlaid with `tags`.
    pub fn scope(&self, name: &str, tags: &[&str]) -> Result<Self> {
        if name.is_empty() {
            return Err(MetricError::EmptyMetricName);
        }
        let child_name = format!("{}.{}", self.series.metric_name, name);
        let child_tags = tag_pairs(self.series.tags.clone(), tags)?;
        let series = self
            .registry
            .register(TaggedSeries::new(child_name, child_tags));
        Ok(Self {
            registry: self.registry.clone(),
            series,
        })
    }

    pub fn metric_name(&self) -> &str {
        self.series.metric_name()
    }

    pub fn series_id(&self) -> u64 {
        self.series.series_id()
    }

    pub fn gauge(&self, field_name: &str) -> Result<Arc<BoundGauge>> {
        self.series.find_simple_field(
            field_name,
            SimpleFieldType::Gauge,
            |name| SimpleField::Gauge(Arc::new(BoundGauge::new(name))),
            |field| match field {
                SimpleField::Gauge(f) => Some(f.clone()),
                _ => None,
            },
        )
    }

    pub fn counter(&self, field_name: &str) -> Result<Arc<BoundCounter>> {
        self.series.find_simple_field(
            field_name,
            SimpleFieldType::DeltaSum,
            |name| SimpleField::Counter(Arc::new(BoundCounter::new(name))),
            |field| match field {
                SimpleField::Counter(f) => Some(f.clone()),
                _ => None,
            },
        )
    }

    pub fn min(&self, field_name: &str) -> Result<Arc<BoundMin>> {
        self.series.find_simple_field(
            field_name,
            SimpleFieldType::Min,
            |name| SimpleField::Min(Arc::new(BoundMin::new(name))),
            |field| match field {
                SimpleField::Min(f) => Some(f.clone()),
                _ => None,
            },
        )
    }

    pub fn max(&self, field_name: &str) -> Result<Arc<BoundMax>> {
        self.series.find_simple_field(
            field_name,
            SimpleFieldType::Max,
            |name| SimpleField::Max(Arc::new(BoundMax::new(name))),
            |field| match field {
                SimpleField::Max(f) => Some(f.clone()),
                _ => None,
            },
        )
    }

    /// The series' delta histogram, created on first use.
    pub fn histogram(&self) -> Arc<BoundHistogram> {
        let mut payload = self.series.payload.lock().expect("payload lock");
        payload
            .histogram
            .get_or_insert_with(|| Arc::new(BoundHistogram::with_default_bounds()))
            .clone()
    }
}

fn tag_pairs(mut base: BTreeMap<String, String>, tags: &[&str]) -> Result<BTreeMap<String, String>> {
    if tags.len() % 2 != 0 {
        let err = MetricError::TagListOdd(tags.len());
        error!(error = %err, "bad tag list");
        return Err(err);
    }
    for pair in tags.chunks(2) {
        base.insert(pair[0].to_string(), pair[1].to_string());
    }
    Ok(base)
}
