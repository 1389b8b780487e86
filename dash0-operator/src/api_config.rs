use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Connection settings for the Dash0 API, taken from the operator configuration resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ApiConfig {
    pub endpoint: String,
    pub dataset: String,
}

impl ApiConfig {
    pub(crate) fn is_valid(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Whether `config` can be used to talk to the Dash0 API at all.
pub(crate) fn is_valid_api_config(config: Option<&ApiConfig>) -> bool {
    config.map_or(false, ApiConfig::is_valid)
}

/// Single slot holding the current [`ApiConfig`], shared by everything that talks to
/// the Dash0 API.
///
/// The value is only ever replaced as a whole. Readers take a snapshot with
/// [`ApiConfigStore::load`] at the start of an operation and keep using that snapshot,
/// so a configuration change is observed by the next operation, not by one in flight.
/// Loads and stores never block each other.
#[derive(Clone, Default)]
pub(crate) struct ApiConfigStore {
    current: Arc<ArcSwapOption<ApiConfig>>,
}

impl ApiConfigStore {
    pub(crate) fn load(&self) -> Option<Arc<ApiConfig>> {
        self.current.load_full()
    }

    pub(crate) fn store(&self, config: Option<ApiConfig>) {
        self.current.store(config.map(Arc::new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> ApiConfig {
        ApiConfig {
            endpoint: endpoint.to_string(),
            dataset: "default".to_string(),
        }
    }

    #[test]
    fn snapshots_are_not_affected_by_later_writes() {
        let store = ApiConfigStore::default();
        assert!(store.load().is_none());
        store.store(Some(config("https://api.dash0.com")));
        let snapshot = store.load();
        store.store(Some(config("https://api.eu.dash0.com")));
        assert_eq!("https://api.dash0.com", snapshot.unwrap().endpoint);
        assert_eq!("https://api.eu.dash0.com", store.load().unwrap().endpoint);
        store.store(None);
        assert!(store.load().is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let store = ApiConfigStore::default();
        let other = store.clone();
        other.store(Some(config("https://api.dash0.com")));
        assert!(is_valid_api_config(store.load().as_deref()));
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let store = ApiConfigStore::default();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    store.store(Some(ApiConfig {
                        endpoint: format!("https://{}.dash0.com", i),
                        dataset: format!("dataset-{}", i),
                    }));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(config) = store.load() {
                            let i = config.dataset.trim_start_matches("dataset-");
                            assert_eq!(format!("https://{}.dash0.com", i), config.endpoint);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!("https://999.dash0.com", store.load().unwrap().endpoint);
    }

    #[test]
    fn validity() {
        assert!(!is_valid_api_config(None));
        assert!(!is_valid_api_config(Some(&config(""))));
        assert!(is_valid_api_config(Some(&config("https://api.dash0.com"))));
    }
}
