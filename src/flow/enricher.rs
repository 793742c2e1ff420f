// Flow enrichment: classification, hop tracing and the per-pair flow cache

use super::classifier::classify;
use super::{AugmentedFlow, FlowRecord, PairKey, TraceStatus};
use crate::cache::BoundedCache;
use crate::geo::GeoResolver;
use crate::trace::HopDiscovery;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Turns flow records into shared augmented flows
///
/// Each directional pair key maps to at most one [`AugmentedFlow`]. A flow
/// crossing the network boundary is also stored under its traced pair
/// (internal → external) so either lookup order reuses the same record and
/// its hop trace.
pub struct FlowEnricher {
    resolver: Arc<GeoResolver>,
    tracer: Arc<dyn HopDiscovery>,
    cache: Mutex<BoundedCache<PairKey, Arc<AugmentedFlow>>>,
}

impl FlowEnricher {
    pub fn new(resolver: Arc<GeoResolver>, tracer: Arc<dyn HopDiscovery>) -> Self {
        Self::with_cache_policy(resolver, tracer, None, None)
    }

    pub fn with_cache_policy(
        resolver: Arc<GeoResolver>,
        tracer: Arc<dyn HopDiscovery>,
        capacity: Option<usize>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            tracer,
            cache: Mutex::new(BoundedCache::new(capacity, ttl)),
        }
    }

    /// Augmented flow for `record`, creating it (and its trace) on first sight
    pub fn enrich(&self, record: &FlowRecord) -> Arc<AugmentedFlow> {
        let key = PairKey::new(&record.out_ip, &record.in_ip);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = cache.get(&key) {
            tracing::trace!("Flow {} in cache", key);
            return existing;
        }

        let direction = classify(&record.out_ip, &record.in_ip);
        let endpoints = direction.trace_endpoints(&record.out_ip, &record.in_ip);
        let traced = endpoints.map(|(from, to)| PairKey::new(from, to));

        // The opposite direction of an already traced pair
        if let Some(traced) = traced.as_ref().filter(|traced| **traced != key) {
            if let Some(existing) = cache.get(traced) {
                tracing::trace!("Flow {} shares {}", key, traced);
                cache.insert(key, existing.clone());
                return existing;
            }
        }

        let status = match endpoints {
            Some(_) => TraceStatus::Running,
            None => TraceStatus::NotRequired,
        };

        let flow = Arc::new(AugmentedFlow::new(
            record,
            self.resolver.resolve(&record.out_ip),
            self.resolver.resolve(&record.in_ip),
            direction.is_internal(),
            status,
        ));

        cache.insert(key.clone(), flow.clone());
        if let Some(traced) = traced.filter(|traced| *traced != key) {
            cache.insert_if_absent(traced, flow.clone());
        }
        drop(cache);

        tracing::debug!("New {} flow {}", direction, key);

        if let Some((from, to)) = endpoints {
            self.tracer.trace(from, to, flow.clone());
        }

        flow
    }

    /// Number of cached pair keys
    pub fn cached_flows(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn resolver(&self) -> &Arc<GeoResolver> {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Sizes;
    use crate::geo::testing::MemoryStore;
    use crate::geo::NoLookup;
    use crate::trace::testing::RecordingTracer;

    fn enricher() -> (FlowEnricher, Arc<RecordingTracer>) {
        let resolver = Arc::new(GeoResolver::new(
            Arc::new(MemoryStore::default()),
            Arc::new(NoLookup),
        ));
        let tracer = Arc::new(RecordingTracer::default());
        (FlowEnricher::new(resolver, tracer.clone()), tracer)
    }

    fn record(out_ip: &str, in_ip: &str) -> FlowRecord {
        FlowRecord {
            out_ip: out_ip.to_string(),
            out_port: Some(80),
            in_ip: in_ip.to_string(),
            in_port: Some(443),
            in_size: Sizes::default(),
            out_size: Sizes::default(),
        }
    }

    #[tokio::test]
    async fn test_enrich_twice_returns_same_flow() {
        let (enricher, tracer) = enricher();

        let first = enricher.enrich(&record("192.168.1.1", "8.8.8.8"));
        let second = enricher.enrich(&record("192.168.1.1", "8.8.8.8"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tracer.calls(), vec![("192.168.1.1".to_string(), "8.8.8.8".to_string())]);
    }

    #[tokio::test]
    async fn test_internal_flow_is_not_traced() {
        let (enricher, tracer) = enricher();

        let flow = enricher.enrich(&record("192.168.1.1", "10.0.0.5"));

        assert!(flow.is_internal());
        assert!(flow.routes().is_empty());
        assert_eq!(flow.trace_status(), TraceStatus::NotRequired);
        assert!(tracer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_external_flow_is_not_traced() {
        let (enricher, tracer) = enricher();

        let flow = enricher.enrich(&record("8.8.8.8", "1.1.1.1"));

        assert!(!flow.is_internal());
        assert_eq!(flow.trace_status(), TraceStatus::NotRequired);
        assert!(tracer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_flow_traced_from_internal_side() {
        let (enricher, tracer) = enricher();

        let flow = enricher.enrich(&record("8.8.8.8", "192.168.1.1"));

        assert!(!flow.is_internal());
        assert_eq!(flow.trace_status(), TraceStatus::Running);
        assert_eq!(tracer.calls(), vec![("192.168.1.1".to_string(), "8.8.8.8".to_string())]);
    }

    #[tokio::test]
    async fn test_both_directions_share_one_flow() {
        let (enricher, tracer) = enricher();

        let inbound = enricher.enrich(&record("8.8.8.8", "192.168.1.1"));
        let outbound = enricher.enrich(&record("192.168.1.1", "8.8.8.8"));

        assert!(Arc::ptr_eq(&inbound, &outbound));
        assert_eq!(tracer.calls().len(), 1);
        assert_eq!(enricher.cached_flows(), 2);
    }

    #[tokio::test]
    async fn test_outbound_then_inbound_share_one_flow() {
        let (enricher, tracer) = enricher();

        let outbound = enricher.enrich(&record("192.168.1.1", "8.8.8.8"));
        let inbound = enricher.enrich(&record("8.8.8.8", "192.168.1.1"));

        assert!(Arc::ptr_eq(&outbound, &inbound));
        assert_eq!(tracer.calls().len(), 1);
        assert_eq!(enricher.cached_flows(), 2);
    }

    #[tokio::test]
    async fn test_endpoints_share_resolved_addresses() {
        let (enricher, _tracer) = enricher();

        let a = enricher.enrich(&record("192.168.1.1", "8.8.8.8"));
        let b = enricher.enrich(&record("192.168.1.1", "1.1.1.1"));

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(a.out_ip(), b.out_ip()));
        assert_eq!(enricher.resolver().cached_addresses(), 3);
    }
}
