//! Compiled-plan cache.
//!
//! Plans are cheap to execute but involve schema validation to build; they
//! are compiled once per fingerprint and shared. No plan is ever
//! re-synthesised for a repeated query shape.

use crate::{
    reducer::{FinaliseMode, PlanFingerprint, ReducePlan, SourceKind},
    Result,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use schema::Schema;
use std::sync::Arc;

/// Process-wide cache of compiled [`ReducePlan`]s.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: Mutex<HashMap<PlanFingerprint, Arc<ReducePlan>>>,
}

impl PlanCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the cached plan for the given shape, compiling it on first
    /// use.
    pub fn get_or_compile(
        &self,
        schema: &Schema,
        key_len: usize,
        measures: &[usize],
        source: SourceKind,
        finalise: FinaliseMode,
    ) -> Result<Arc<ReducePlan>> {
        let fingerprint = PlanFingerprint {
            schema: schema.fingerprint(),
            key_len,
            measures: measures.to_vec(),
            source,
            finalise,
        };

        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get(&fingerprint) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(ReducePlan::new(schema, key_len, measures, source, finalise)?);
        plans.insert(fingerprint, Arc::clone(&plan));
        Ok(plan)
    }

    /// Number of cached plans.
    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    /// True if nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{KeyType, MeasureKind, NumType};

    fn schema() -> Schema {
        Schema::builder()
            .dimension("d", KeyType::I32)
            .measure("m", MeasureKind::Sum(NumType::I64))
            .build()
            .unwrap()
    }

    #[test]
    fn identical_shapes_share_a_plan() {
        let cache = PlanCache::new();
        let schema = schema();
        let a = cache
            .get_or_compile(&schema, 1, &[0], SourceKind::Raw, FinaliseMode::Identity)
            .unwrap();
        let b = cache
            .get_or_compile(&schema, 1, &[0], SourceKind::Raw, FinaliseMode::Identity)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn source_kind_splits_the_cache() {
        let cache = PlanCache::new();
        let schema = schema();
        cache
            .get_or_compile(&schema, 1, &[0], SourceKind::Raw, FinaliseMode::Identity)
            .unwrap();
        cache
            .get_or_compile(
                &schema,
                1,
                &[0],
                SourceKind::PreAggregated,
                FinaliseMode::Identity,
            )
            .unwrap();
        cache
            .get_or_compile(
                &schema,
                1,
                &[0],
                SourceKind::PreAggregated,
                FinaliseMode::Summary,
            )
            .unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn bad_shapes_do_not_poison_the_cache() {
        let cache = PlanCache::new();
        let schema = schema();
        assert!(cache
            .get_or_compile(&schema, 9, &[0], SourceKind::Raw, FinaliseMode::Identity)
            .is_err());
        assert!(cache.is_empty());
    }
}
