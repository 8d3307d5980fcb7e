//! Process-wide cache of gateways keyed by profile and region
//!
//! The registry is an ordinary value: create one at startup, hand it (or the
//! gateways it returns) to the components that need them, and call
//! [`GatewayRegistry::clear`] on teardown.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::KinesisGateway;

/// Identity of a cached gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub profile: Option<String>,
    pub region: Option<String>,
}

impl ClientKey {
    pub fn new(profile: Option<&str>, region: Option<&str>) -> Self {
        Self {
            profile: profile.map(String::from),
            region: region.map(String::from),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}",
            self.profile.as_deref().unwrap_or("default"),
            self.region.as_deref().unwrap_or("default")
        )
    }
}

pub struct GatewayRegistry<G> {
    gateways: Mutex<HashMap<ClientKey, Arc<G>>>,
}

impl<G> Default for GatewayRegistry<G> {
    fn default() -> Self {
        Self {
            gateways: Mutex::new(HashMap::new()),
        }
    }
}

impl<G> GatewayRegistry<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the gateway for `key`, creating it with `factory` on first use
    ///
    /// Creation happens under the registry lock, so concurrent callers for the
    /// same key share one instance.
    pub async fn get_or_create<F, Fut>(&self, key: ClientKey, factory: F) -> Arc<G>
    where
        F: FnOnce(ClientKey) -> Fut,
        Fut: Future<Output = G>,
    {
        let mut gateways = self.gateways.lock().await;
        if let Some(existing) = gateways.get(&key) {
            return existing.clone();
        }

        debug!(key = %key, "Creating gateway");
        let gateway = Arc::new(factory(key.clone()).await);
        gateways.insert(key, gateway.clone());
        gateway
    }

    pub async fn get(&self, key: &ClientKey) -> Option<Arc<G>> {
        self.gateways.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &ClientKey) -> Option<Arc<G>> {
        self.gateways.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.gateways.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.gateways.lock().await.is_empty()
    }

    /// Drop every cached gateway
    pub async fn clear(&self) {
        let mut gateways = self.gateways.lock().await;
        debug!(count = gateways.len(), "Clearing gateway registry");
        gateways.clear();
    }
}

impl GatewayRegistry<KinesisGateway> {
    /// Kinesis gateway for the given profile and region, loaded from the AWS config chain
    pub async fn kinesis(&self, profile: Option<&str>, region: Option<&str>) -> Arc<KinesisGateway> {
        self.get_or_create(ClientKey::new(profile, region), |key| async move {
            KinesisGateway::from_profile(key.profile.as_deref(), key.region.as_deref()).await
        })
        .await
    }
}
