//! In-process metric registry.
//!
//! Instruments are registered once by name and handed out as cheap clones;
//! every clone observes and mutates the same underlying state. A [`Metric`]
//! fans out into one observer per distinct [`Attributes`] set, which is how
//! callers separate e.g. consolidation outcomes without registering a metric
//! per outcome.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    borrow::Cow,
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A set of key-value pairs distinguishing observers within one [`Metric`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace a single attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

/// Types that can act as the per-attribute-set observer of a [`Metric`].
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {
    /// The value reported when this observer is read.
    type Observation;

    /// Read the current value.
    fn observe(&self) -> Self::Observation;
}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current count.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    type Observation = u64;

    fn observe(&self) -> u64 {
        self.fetch()
    }
}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to an absolute value.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    type Observation = u64;

    fn observe(&self) -> u64 {
        self.fetch()
    }
}

/// Anything storable in a [`Registry`].
pub trait Instrument: Debug + Send + Sync + 'static {
    /// Downcast support for [`Registry::get_instrument`].
    fn as_any(&self) -> &dyn Any;
}

/// A named family of observers of type `T`, one per [`Attributes`] set.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The registered name of this metric.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The registered help text of this metric.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns the observer for `attributes`, creating it on first use.
    ///
    /// The returned handle is a clone sharing state with the stored observer,
    /// so it can be held and updated without further registry access.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let mut observers = self.observers.lock();
        observers.entry(attributes.into()).or_default().clone()
    }

    /// Returns the observer for `attributes` if one was ever recorded.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The process-wide collection of instruments.
///
/// Registration is idempotent: registering the same name twice returns the
/// existing instrument. Registering the same name at a different observer
/// type is a programmer error and panics.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Arc<dyn Instrument>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register (or look up) the metric `name` with observers of type `T`.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let instrument = instruments
            .entry(name)
            .or_insert_with(|| Arc::new(Metric::<T>::new(name, description)));

        instrument
            .as_any()
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric \"{}\" registered at a different type", name))
            .clone()
    }

    /// Look up a previously registered instrument by name.
    pub fn get_instrument<T: Instrument + Clone>(&self, name: &'static str) -> Option<T> {
        let instruments = self.instruments.lock();
        instruments
            .get(name)
            .and_then(|instrument| instrument.as_any().downcast_ref::<T>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_shared_across_clones() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("writes", "write count");

        let a = metric.recorder(&[("outcome", "ok")]);
        let b = metric.recorder(&[("outcome", "ok")]);
        a.inc(2);
        b.inc(3);

        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("outcome", "ok")]))
                .unwrap()
                .fetch(),
            5
        );
    }

    #[test]
    fn attributes_partition_observers() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("rounds", "rounds by outcome");

        metric.recorder(&[("outcome", "ok")]).inc(1);
        metric.recorder(&[("outcome", "error")]).inc(7);

        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("outcome", "ok")]))
                .unwrap()
                .fetch(),
            1
        );
        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("outcome", "error")]))
                .unwrap()
                .fetch(),
            7
        );
        assert!(metric
            .get_observer(&Attributes::from(&[("outcome", "skipped")]))
            .is_none());
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("x", "x");
        let b: Metric<U64Counter> = registry.register_metric("x", "x");
        a.recorder(&[("k", "v")]).inc(1);
        assert_eq!(
            b.get_observer(&Attributes::from(&[("k", "v")])).unwrap().fetch(),
            1
        );

        let found: Option<Metric<U64Counter>> = registry.get_instrument("x");
        assert!(found.is_some());
        let missing: Option<Metric<U64Counter>> = registry.get_instrument("y");
        assert!(missing.is_none());
    }

    #[test]
    fn gauge_sets_absolute_values() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("live", "live chunks");
        let g = metric.recorder(&[("aggregate", "a1")]);
        g.set(4);
        g.set(2);
        assert_eq!(g.fetch(), 2);
    }

    #[test]
    #[should_panic(expected = "registered at a different type")]
    fn type_mismatch_panics() {
        let registry = Registry::new();
        let _: Metric<U64Counter> = registry.register_metric("x", "x");
        let _: Metric<U64Gauge> = registry.register_metric("x", "x");
    }
}
