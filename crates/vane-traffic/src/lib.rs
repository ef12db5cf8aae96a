//! vane-traffic — the Traffic Router Interface.
//!
//! The rollout controller shifts traffic only through `dyn TrafficRouter`.
//! Routers are registered by name and selected by
//! `spec.strategy.canary.trafficRouting.router`. The built-in `proxy`
//! router keeps weighted stable/canary routing tables in process.

pub mod error;
pub mod proxy;
pub mod router;

pub use error::{RouterError, RouterResult};
pub use proxy::{Backend, ProxyRouter, RequestInfo};
pub use router::{AppliedRouting, RouterRegistry, RoutingTarget, TrafficRouter};
