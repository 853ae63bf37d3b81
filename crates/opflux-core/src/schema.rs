//! Per-namespace measurement specs.
//!
//! Loaded once at startup from configuration and immutable afterwards; the
//! registry is shared read-only across every writer worker.

use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;
use crate::point::Precision;

/// How documents from one source namespace map onto sink points.
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Source `database.collection`; unique key into the registry.
    pub namespace: String,
    /// Document field holding the point time. `None` means "use the event's
    /// replication timestamp".
    pub time_field: Option<String>,
    /// Target measurement name override. `None` means the source collection
    /// name.
    pub measurement: Option<String>,
    /// Target retention policy; empty means the sink's default.
    pub retention_policy: String,
    /// Timestamp precision for this namespace's batches.
    pub precision: Precision,
    /// Dotted field names projected as tags.
    pub tags: HashSet<String>,
    /// Dotted field names projected as fields. Never empty after
    /// [`MeasurementRegistry::new`].
    pub fields: HashSet<String>,
}

impl Measurement {
    /// A spec with no tags and no fields; callers fill in the sets before
    /// registry construction validates them.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            time_field: None,
            measurement: None,
            retention_policy: String::new(),
            precision: Precision::default(),
            tags: HashSet::new(),
            fields: HashSet::new(),
        }
    }

    /// The effective measurement name for a point from `collection`.
    #[must_use]
    pub fn measurement_name<'a>(&'a self, collection: &'a str) -> &'a str {
        match self.measurement.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => collection,
        }
    }
}

/// All configured measurement specs, keyed by namespace.
#[derive(Debug)]
pub struct MeasurementRegistry {
    specs: HashMap<String, Measurement>,
}

impl MeasurementRegistry {
    /// Validates and indexes the configured specs.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoMeasurements`] for an empty list,
    /// [`ConfigError::EmptyFields`] when a spec has no fields, and
    /// [`ConfigError::DuplicateNamespace`] when two specs share a namespace.
    pub fn new(measurements: Vec<Measurement>) -> Result<Self, ConfigError> {
        if measurements.is_empty() {
            return Err(ConfigError::NoMeasurements);
        }
        let mut specs = HashMap::with_capacity(measurements.len());
        for spec in measurements {
            if spec.fields.is_empty() {
                return Err(ConfigError::EmptyFields {
                    namespace: spec.namespace.clone(),
                });
            }
            let namespace = spec.namespace.clone();
            if specs.insert(namespace.clone(), spec).is_some() {
                return Err(ConfigError::DuplicateNamespace { namespace });
            }
        }
        Ok(Self { specs })
    }

    /// The spec for a namespace, if one is configured.
    #[must_use]
    pub fn spec_for(&self, namespace: &str) -> Option<&Measurement> {
        self.specs.get(namespace)
    }

    /// All configured namespaces, for wiring direct reads.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Number of configured measurements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Always false: construction rejects empty registries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
