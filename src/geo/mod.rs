//! Geolocation resolution for flow endpoints and hops
//!
//! Every address is resolved at most once per process: the first caller gets
//! a pending placeholder back immediately while a background task consults
//! the persistent store and then the external API. Every later caller shares
//! the same `Arc<ResolvedIp>`, so a location found later becomes visible to
//! every flow and route holding it.

pub mod ipstack;
pub mod store;

pub use ipstack::IpstackClient;
pub use store::SqliteGeoStore;

use crate::cache::BoundedCache;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Resolution progress of a single address
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoState {
    /// Lookup still in flight
    Pending,
    Located(GeoLocation),
    /// Lookup finished without a location (not found or failed)
    Unavailable,
}

impl GeoState {
    pub fn location(&self) -> Option<GeoLocation> {
        match self {
            GeoState::Located(location) => Some(*location),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, GeoState::Pending)
    }
}

/// An address with its lazily populated geolocation
pub struct ResolvedIp {
    address: String,
    state: watch::Sender<GeoState>,
}

impl ResolvedIp {
    pub fn pending(address: impl Into<String>) -> Self {
        let (state, _) = watch::channel(GeoState::Pending);
        Self {
            address: address.into(),
            state,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> GeoState {
        *self.state.borrow()
    }

    pub fn geolocation(&self) -> Option<GeoLocation> {
        self.state().location()
    }

    /// Wait until the lookup for this address has finished
    pub async fn settled(&self) -> GeoState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(GeoState::is_settled).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    pub fn snapshot(&self) -> IpSnapshot {
        IpSnapshot {
            address: self.address.clone(),
            geolocation: self.geolocation(),
        }
    }

    fn settle(&self, state: GeoState) {
        self.state.send_replace(state);
    }
}

impl fmt::Debug for ResolvedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedIp")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Wire form of a resolved address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpSnapshot {
    pub address: String,
    pub geolocation: Option<GeoLocation>,
}

/// Persistent geolocation store, keyed by address
pub trait GeoStore: Send + Sync {
    fn find(&self, address: &str) -> Result<Option<GeoLocation>>;

    fn save(&self, address: &str, location: GeoLocation) -> Result<()>;
}

/// External geolocation source
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn locate(&self, address: &str) -> Result<Option<GeoLocation>>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// Lookup used when no API key is configured: nothing is ever found
pub struct NoLookup;

#[async_trait]
impl GeoLookup for NoLookup {
    async fn locate(&self, _address: &str) -> Result<Option<GeoLocation>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Deduplicating address resolver
pub struct GeoResolver {
    cache: Mutex<BoundedCache<String, Arc<ResolvedIp>>>,
    store: Arc<dyn GeoStore>,
    lookup: Arc<dyn GeoLookup>,
}

impl GeoResolver {
    pub fn new(store: Arc<dyn GeoStore>, lookup: Arc<dyn GeoLookup>) -> Self {
        Self::with_cache_policy(store, lookup, None, None)
    }

    pub fn with_cache_policy(
        store: Arc<dyn GeoStore>,
        lookup: Arc<dyn GeoLookup>,
        capacity: Option<usize>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            cache: Mutex::new(BoundedCache::new(capacity, ttl)),
            store,
            lookup,
        }
    }

    /// Return the shared record for `address`, starting a lookup on first sight
    ///
    /// Must be called from within a tokio runtime.
    pub fn resolve(&self, address: &str) -> Arc<ResolvedIp> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = cache.get(&address.to_string()) {
            tracing::trace!("Address {} in cache", address);
            return existing;
        }

        let ip = Arc::new(ResolvedIp::pending(address));
        cache.insert(address.to_string(), ip.clone());
        drop(cache);

        let store = self.store.clone();
        let lookup = self.lookup.clone();
        let target = ip.clone();
        tokio::spawn(async move {
            let state = lookup_location(target.address(), store, lookup).await;
            target.settle(state);
        });

        ip
    }

    /// Number of addresses currently cached
    pub fn cached_addresses(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn lookup_location(
    address: &str,
    store: Arc<dyn GeoStore>,
    lookup: Arc<dyn GeoLookup>,
) -> GeoState {
    tracing::debug!("Looking up {} in geolocation store", address);

    let key = address.to_string();
    let reader = store.clone();
    match tokio::task::spawn_blocking(move || reader.find(&key)).await {
        Ok(Ok(Some(location))) => {
            tracing::debug!("Got location of {} from store", address);
            return GeoState::Located(location);
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => {
            tracing::warn!("Geolocation store lookup failed for {}: {}", address, e);
            return GeoState::Unavailable;
        }
        Err(e) => {
            tracing::warn!("Geolocation store task failed for {}: {}", address, e);
            return GeoState::Unavailable;
        }
    }

    let location = match lookup.locate(address).await {
        Ok(Some(location)) => location,
        Ok(None) => {
            tracing::debug!("No location for {} from {}", address, lookup.name());
            return GeoState::Unavailable;
        }
        Err(e) => {
            tracing::warn!(
                "Geolocation lookup via {} failed for {}: {}",
                lookup.name(),
                address,
                e
            );
            return GeoState::Unavailable;
        }
    };

    tracing::debug!("Got location of {} from {}", address, lookup.name());

    let key = address.to_string();
    match tokio::task::spawn_blocking(move || store.save(&key, location)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Failed to store location of {}: {}", address, e),
        Err(e) => tracing::warn!("Geolocation store task failed for {}: {}", address, e),
    }

    GeoState::Located(location)
}
