//! The router trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vane_state::{HeaderRoute, MirrorRoute};

use crate::error::RouterResult;
use crate::proxy::ProxyRouter;

/// The rollout whose traffic is being shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTarget {
    /// `{namespace}/{name}` of the rollout.
    pub rollout: String,
    pub stable_service: Option<String>,
    pub canary_service: Option<String>,
    /// Router-specific settings from `trafficRouting.config`.
    pub config: serde_json::Value,
}

/// The routing a router currently has in effect for a rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRouting {
    pub canary_weight: u32,
    /// Whether the data plane has confirmed `canary_weight`. `None` means
    /// the router applies changes synchronously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_routes: Vec<HeaderRoute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirror_routes: Vec<MirrorRoute>,
}

impl AppliedRouting {
    /// The router reports `weight` as in effect (and not unverified).
    pub fn confirms(&self, weight: u32) -> bool {
        self.canary_weight == weight && self.verified != Some(false)
    }

    pub fn header_route(&self, name: &str) -> Option<&HeaderRoute> {
        self.header_routes.iter().find(|r| r.name == name)
    }

    pub fn mirror_route(&self, name: &str) -> Option<&MirrorRoute> {
        self.mirror_routes.iter().find(|r| r.name == name)
    }
}

/// Shapes traffic between the stable and canary revisions of a rollout.
///
/// All calls must be idempotent: setting the weight already in effect is a
/// no-op.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Route `weight` percent of traffic to the canary.
    async fn set_weight(&self, target: &RoutingTarget, weight: u32) -> RouterResult<()>;

    /// Add or replace a header-based route. A route without matches is removed.
    async fn set_header_route(&self, target: &RoutingTarget, route: &HeaderRoute)
    -> RouterResult<()>;

    /// Add or replace a mirror route. A route without matches is removed.
    async fn set_mirror_route(&self, target: &RoutingTarget, route: &MirrorRoute)
    -> RouterResult<()>;

    /// Drop every header and mirror route managed for the rollout.
    async fn remove_managed_routes(&self, target: &RoutingTarget) -> RouterResult<()>;

    /// Report the routing currently in effect.
    async fn applied(&self, target: &RoutingTarget) -> RouterResult<AppliedRouting>;
}

/// Router name → implementation.
#[derive(Clone, Default)]
pub struct RouterRegistry {
    routers: HashMap<String, Arc<dyn TrafficRouter>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `proxy` router.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("proxy", Arc::new(ProxyRouter::new()));
        registry
    }

    pub fn register(&mut self, name: &str, router: Arc<dyn TrafficRouter>) {
        self.routers.insert(name.to_string(), router);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TrafficRouter>> {
        self.routers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRegistry")
            .field("routers", &self.names())
            .finish()
    }
}
