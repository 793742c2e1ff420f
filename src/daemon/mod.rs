// Daemon module: wires configuration into the enrichment pipeline

mod signals;

pub use signals::SignalHandler;

use crate::config::Config;
use crate::error::Result;
use crate::flow::FlowEnricher;
use crate::geo::{GeoLookup, GeoResolver, IpstackClient, NoLookup, SqliteGeoStore};
use crate::pipeline::{AmqpBroker, DriverStats, PipelineDriver};
use crate::trace::HopTracer;
use std::sync::Arc;

/// Owns the long-lived components shared by every message
pub struct Daemon {
    config: Config,
    resolver: Arc<GeoResolver>,
    tracer: Arc<HopTracer>,
    enricher: Arc<FlowEnricher>,
}

impl Daemon {
    /// Open the store and build the resolver, tracer and enricher
    ///
    /// A store that cannot be opened or migrated is fatal.
    pub fn new(config: Config) -> Result<Self> {
        let store_path = config.store_path();
        let store = Arc::new(SqliteGeoStore::open(&store_path)?);

        let lookup: Arc<dyn GeoLookup> = match config.geo.api_key() {
            Some(key) => Arc::new(IpstackClient::new(
                &config.geo.api_url,
                &key,
                config.geo_request_timeout(),
            )?),
            None => {
                tracing::warn!(
                    "No geolocation API key (set geo.api_key or {}), only stored locations will be used",
                    config.geo.api_key_env
                );
                Arc::new(NoLookup)
            }
        };

        let resolver = Arc::new(GeoResolver::with_cache_policy(
            store,
            lookup,
            config.cache.max_addresses,
            config.address_ttl(),
        ));

        let tracer = Arc::new(HopTracer::new(
            config.tracer.command.clone(),
            config.tracer.flags.clone(),
            config.tracer_timeout(),
            resolver.clone(),
        )?);

        let enricher = Arc::new(FlowEnricher::with_cache_policy(
            resolver.clone(),
            tracer.clone(),
            config.cache.max_flows,
            config.flow_ttl(),
        ));

        Ok(Self {
            config,
            resolver,
            tracer,
            enricher,
        })
    }

    pub fn resolver(&self) -> &Arc<GeoResolver> {
        &self.resolver
    }

    pub fn tracer(&self) -> &Arc<HopTracer> {
        &self.tracer
    }

    /// Connect to the broker and consume until a shutdown signal arrives
    pub async fn run(&self) -> Result<DriverStats> {
        let signals = SignalHandler::new()?;
        let mut broker = AmqpBroker::connect(&self.config.broker).await?;

        let mut driver = PipelineDriver::new(
            self.enricher.clone(),
            self.config.pipeline.publish_mode,
            self.config.publish_wait(),
        );

        let stats = driver.run(&mut broker, signals.shutdown()).await?;

        tracing::info!(
            "{} flows and {} addresses cached at shutdown",
            self.enricher.cached_flows(),
            self.resolver.cached_addresses()
        );

        Ok(stats)
    }
}
