//! In-process weighted router.
//!
//! Keeps one routing table per rollout: the canary weight plus header and
//! mirror routes. Requests are resolved to the stable or canary backend by
//! header routes first and weighted selection otherwise. Selection is a
//! deterministic rotation over 100 slots, so `weight` of every 100
//! consecutive requests reach the canary.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use vane_state::{HeaderMatch, HeaderRoute, MatchType, MirrorRoute, RequestMatch};

use crate::error::{RouterError, RouterResult};
use crate::router::{AppliedRouting, RoutingTarget, TrafficRouter};

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Stable,
    Canary,
}

/// The parts of a request the router matches on.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Header names are matched case-insensitively.
    pub headers: BTreeMap<String, String>,
}

impl RequestInfo {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Internal state for a single rollout.
#[derive(Default)]
struct RouteEntry {
    weight: u32,
    verified: bool,
    header_routes: Vec<HeaderRoute>,
    mirror_routes: Vec<MirrorRoute>,
    counter: AtomicUsize,
    mirror_counter: AtomicUsize,
    /// Every distinct weight applied, in order.
    history: Vec<u32>,
}

#[derive(Clone)]
pub struct ProxyRouter {
    routes: Arc<RwLock<HashMap<String, RouteEntry>>>,
    /// Weight changes stay unverified until `verify` is called.
    require_verification: bool,
}

impl ProxyRouter {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            require_verification: false,
        }
    }

    /// A router whose weight changes must be confirmed with [`verify`](Self::verify).
    pub fn with_verification() -> Self {
        Self {
            require_verification: true,
            ..Self::new()
        }
    }

    /// Confirm the current weight for a rollout has reached the data plane.
    pub fn verify(&self, rollout: &str) {
        let mut routes = self.routes.write().expect("routes lock");
        if let Some(entry) = routes.get_mut(rollout) {
            entry.verified = true;
        }
    }

    /// Resolve a request for `rollout` to a backend.
    pub fn select(&self, rollout: &str, req: &RequestInfo) -> Backend {
        let routes = self.routes.read().expect("routes lock");
        let Some(entry) = routes.get(rollout) else {
            return Backend::Stable;
        };

        if entry
            .header_routes
            .iter()
            .any(|route| route.matches.iter().all(|m| header_matches(m, req)))
        {
            return Backend::Canary;
        }

        let slot = entry.counter.fetch_add(1, Ordering::Relaxed) % 100;
        if (slot as u32) < entry.weight {
            Backend::Canary
        } else {
            Backend::Stable
        }
    }

    /// Whether a copy of `req` should also be sent to the canary.
    pub fn should_mirror(&self, rollout: &str, req: &RequestInfo) -> bool {
        let routes = self.routes.read().expect("routes lock");
        let Some(entry) = routes.get(rollout) else {
            return false;
        };
        let Some(route) = entry
            .mirror_routes
            .iter()
            .find(|route| route.matches.iter().any(|m| request_matches(m, req)))
        else {
            return false;
        };
        let slot = entry.mirror_counter.fetch_add(1, Ordering::Relaxed) % 100;
        (slot as u32) < route.percentage
    }

    /// Weights applied to a rollout so far, in order.
    pub fn weight_history(&self, rollout: &str) -> Vec<u32> {
        let routes = self.routes.read().expect("routes lock");
        routes
            .get(rollout)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    /// List all rollouts with routing state.
    pub fn list_rollouts(&self) -> Vec<String> {
        let routes = self.routes.read().expect("routes lock");
        routes.keys().cloned().collect()
    }
}

impl Default for ProxyRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn header_matches(m: &HeaderMatch, req: &RequestInfo) -> bool {
    match req.header(&m.header_name) {
        Some(value) => match m.match_type {
            MatchType::Exact => value == m.value,
            MatchType::Prefix => value.starts_with(&m.value),
        },
        None => false,
    }
}

fn request_matches(m: &RequestMatch, req: &RequestInfo) -> bool {
    m.method
        .as_deref()
        .is_none_or(|method| method.eq_ignore_ascii_case(&req.method))
        && m
            .path_prefix
            .as_deref()
            .is_none_or(|prefix| req.path.starts_with(prefix))
        && m.headers.iter().all(|h| header_matches(h, req))
}

#[async_trait]
impl TrafficRouter for ProxyRouter {
    async fn set_weight(&self, target: &RoutingTarget, weight: u32) -> RouterResult<()> {
        if weight > 100 {
            return Err(RouterError::Rejected(format!("weight {weight} exceeds 100")));
        }
        let mut routes = self.routes.write().expect("routes lock");
        let entry = routes.entry(target.rollout.clone()).or_default();
        if entry.weight == weight && !entry.history.is_empty() {
            return Ok(());
        }
        info!(rollout = %target.rollout, from = entry.weight, to = weight, "canary weight changed");
        entry.weight = weight;
        entry.verified = !self.require_verification;
        entry.history.push(weight);
        Ok(())
    }

    async fn set_header_route(
        &self,
        target: &RoutingTarget,
        route: &HeaderRoute,
    ) -> RouterResult<()> {
        let mut routes = self.routes.write().expect("routes lock");
        let entry = routes.entry(target.rollout.clone()).or_default();
        entry.header_routes.retain(|r| r.name != route.name);
        if !route.matches.is_empty() {
            entry.header_routes.push(route.clone());
        }
        debug!(rollout = %target.rollout, route = %route.name, matches = route.matches.len(), "header route set");
        Ok(())
    }

    async fn set_mirror_route(
        &self,
        target: &RoutingTarget,
        route: &MirrorRoute,
    ) -> RouterResult<()> {
        if route.percentage > 100 {
            return Err(RouterError::Rejected(format!(
                "mirror percentage {} exceeds 100",
                route.percentage
            )));
        }
        let mut routes = self.routes.write().expect("routes lock");
        let entry = routes.entry(target.rollout.clone()).or_default();
        entry.mirror_routes.retain(|r| r.name != route.name);
        if !route.matches.is_empty() {
            entry.mirror_routes.push(route.clone());
        }
        debug!(rollout = %target.rollout, route = %route.name, "mirror route set");
        Ok(())
    }

    async fn remove_managed_routes(&self, target: &RoutingTarget) -> RouterResult<()> {
        let mut routes = self.routes.write().expect("routes lock");
        if let Some(entry) = routes.get_mut(&target.rollout) {
            if !entry.header_routes.is_empty() || !entry.mirror_routes.is_empty() {
                debug!(rollout = %target.rollout, "managed routes removed");
            }
            entry.header_routes.clear();
            entry.mirror_routes.clear();
        }
        Ok(())
    }

    async fn applied(&self, target: &RoutingTarget) -> RouterResult<AppliedRouting> {
        let routes = self.routes.read().expect("routes lock");
        let applied = match routes.get(&target.rollout) {
            Some(entry) => AppliedRouting {
                canary_weight: entry.weight,
                verified: self.require_verification.then_some(entry.verified),
                header_routes: entry.header_routes.clone(),
                mirror_routes: entry.mirror_routes.clone(),
            },
            None => AppliedRouting::default(),
        };
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RoutingTarget {
        RoutingTarget {
            rollout: "default/web".to_string(),
            stable_service: Some("web-stable".to_string()),
            canary_service: Some("web-canary".to_string()),
            config: serde_json::Value::Null,
        }
    }

    fn request(headers: &[(&str, &str)]) -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            path: "/api/items".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn canary_share(router: &ProxyRouter, n: usize) -> usize {
        (0..n)
            .filter(|_| router.select("default/web", &request(&[])) == Backend::Canary)
            .count()
    }

    #[tokio::test]
    async fn weighted_selection_follows_weight() {
        let router = ProxyRouter::new();
        assert_eq!(canary_share(&router, 100), 0);

        router.set_weight(&target(), 20).await.unwrap();
        assert_eq!(canary_share(&router, 100), 20);

        router.set_weight(&target(), 100).await.unwrap();
        assert_eq!(canary_share(&router, 100), 100);
    }

    #[tokio::test]
    async fn history_records_distinct_changes() {
        let router = ProxyRouter::new();
        for w in [20, 20, 50, 100, 0] {
            router.set_weight(&target(), w).await.unwrap();
        }
        assert_eq!(router.weight_history("default/web"), vec![20, 50, 100, 0]);
        assert!(router.set_weight(&target(), 101).await.is_err());
    }

    #[tokio::test]
    async fn header_route_overrides_weight() {
        let router = ProxyRouter::new();
        let route = HeaderRoute {
            name: "beta".to_string(),
            matches: vec![HeaderMatch {
                header_name: "X-Beta".to_string(),
                value: "on".to_string(),
                match_type: MatchType::Exact,
            }],
        };
        router.set_header_route(&target(), &route).await.unwrap();

        assert_eq!(
            router.select("default/web", &request(&[("x-beta", "on")])),
            Backend::Canary
        );
        assert_eq!(router.select("default/web", &request(&[])), Backend::Stable);

        let applied = router.applied(&target()).await.unwrap();
        assert!(applied.header_route("beta").is_some());

        // Empty matches removes the route.
        let removal = HeaderRoute {
            name: "beta".to_string(),
            matches: vec![],
        };
        router.set_header_route(&target(), &removal).await.unwrap();
        assert!(router.applied(&target()).await.unwrap().header_routes.is_empty());
    }

    #[tokio::test]
    async fn mirror_percentage_and_removal() {
        let router = ProxyRouter::new();
        let route = MirrorRoute {
            name: "shadow".to_string(),
            percentage: 50,
            matches: vec![RequestMatch {
                method: Some("get".to_string()),
                path_prefix: Some("/api".to_string()),
                headers: vec![],
            }],
        };
        router.set_mirror_route(&target(), &route).await.unwrap();
        let mirrored = (0..100)
            .filter(|_| router.should_mirror("default/web", &request(&[])))
            .count();
        assert_eq!(mirrored, 50);

        router.remove_managed_routes(&target()).await.unwrap();
        assert!(!router.should_mirror("default/web", &request(&[])));
    }

    #[tokio::test]
    async fn verification_gates_confirmation() {
        let router = ProxyRouter::with_verification();
        router.set_weight(&target(), 30).await.unwrap();

        let applied = router.applied(&target()).await.unwrap();
        assert_eq!(applied.verified, Some(false));
        assert!(!applied.confirms(30));

        router.verify("default/web");
        assert!(router.applied(&target()).await.unwrap().confirms(30));
    }

    #[tokio::test]
    async fn synchronous_router_reports_no_verification() {
        let router = ProxyRouter::new();
        router.set_weight(&target(), 10).await.unwrap();
        let applied = router.applied(&target()).await.unwrap();
        assert_eq!(applied.verified, None);
        assert!(applied.confirms(10));
        assert_eq!(router.list_rollouts(), vec!["default/web"]);
    }
}
