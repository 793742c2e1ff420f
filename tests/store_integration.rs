use async_trait::async_trait;
use hopscope::error::Result;
use hopscope::geo::{GeoLocation, GeoLookup, GeoResolver, GeoState, GeoStore, SqliteGeoStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Slow lookup so concurrent callers overlap with the first request
#[derive(Default)]
struct SlowLookup {
    calls: AtomicUsize,
}

#[async_trait]
impl GeoLookup for SlowLookup {
    async fn locate(&self, address: &str) -> Result<Option<GeoLocation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if address.starts_with("203.0.113.") {
            // Documentation range: the API knows nothing about it
            return Ok(None);
        }
        Ok(Some(GeoLocation {
            latitude: 51.5,
            longitude: -0.12,
        }))
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[test]
fn test_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store").join("geolocations.sqlite");

    {
        let store = SqliteGeoStore::open(&db_path).unwrap();
        store
            .save(
                "1.1.1.1",
                GeoLocation {
                    latitude: -33.49,
                    longitude: 143.21,
                },
            )
            .unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    let store = SqliteGeoStore::open(&db_path).unwrap();
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(
        store.find("1.1.1.1").unwrap(),
        Some(GeoLocation {
            latitude: -33.49,
            longitude: 143.21,
        })
    );
    assert_eq!(store.find("9.9.9.9").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_share_one_lookup() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteGeoStore::open(&temp_dir.path().join("geo.sqlite")).unwrap());
    let lookup = Arc::new(SlowLookup::default());
    let resolver = Arc::new(GeoResolver::new(store.clone(), lookup.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("8.8.4.4") })
        })
        .collect();

    let mut resolved = Vec::new();
    for handle in handles {
        resolved.push(handle.await.unwrap());
    }

    let first = &resolved[0];
    assert!(resolved.iter().all(|ip| Arc::ptr_eq(ip, first)));

    let state = first.settled().await;
    assert_eq!(
        state,
        GeoState::Located(GeoLocation {
            latitude: 51.5,
            longitude: -0.12,
        })
    );
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.count().unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_address_not_stored() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteGeoStore::open(&temp_dir.path().join("geo.sqlite")).unwrap());
    let resolver = GeoResolver::new(store.clone(), Arc::new(SlowLookup::default()));

    let ip = resolver.resolve("203.0.113.9");
    assert_eq!(ip.settled().await, GeoState::Unavailable);
    assert_eq!(ip.snapshot().geolocation, None);
    assert_eq!(store.count().unwrap(), 0);
}
