//! Shared harness for controller integration tests: a real store, the full
//! worker pool, readiness simulation and a manual clock.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use vane_analysis::{
    MeasureContext, MeasurementOutcome, MetricProvider, ProviderError, ProviderRegistry,
};
use vane_controller::{Controller, ControllerOptions};
use vane_core::{ManualClock, template_hash};
use vane_metrics::ControllerMetrics;
use vane_state::{
    AnalysisTemplate, AnalysisTemplateSpec, BlueGreenStrategy, CanaryStep, CanaryStrategy,
    Container, Metric, ObjectMeta, PodTemplate, ReplicaSet, Rollout, RolloutAnalysis,
    RolloutSpec, RolloutStatus, RolloutStrategy, Service, ServiceSpec, StateStore,
    TrafficRouting,
};
use vane_traffic::{ProxyRouter, RouterRegistry};

pub const ROLLOUT: &str = "default/web";

/// Metric provider whose verdict the test flips.
pub struct Verdict(AtomicBool);

impl Verdict {
    pub fn set(&self, healthy: bool) {
        self.0.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricProvider for Verdict {
    async fn run(
        &self,
        _ctx: &MeasureContext,
        _metric: &Metric,
    ) -> Result<MeasurementOutcome, ProviderError> {
        Ok(MeasurementOutcome::value(serde_json::json!(
            self.0.load(Ordering::SeqCst)
        )))
    }
}

pub struct Harness {
    pub store: StateStore,
    pub clock: ManualClock,
    pub proxy: Arc<ProxyRouter>,
    pub verdict: Arc<Verdict>,
    pub controller: Controller,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(
            StateStore::open_in_memory().unwrap(),
            ManualClock::new(1_000),
            Arc::new(ProxyRouter::new()),
        )
    }

    pub fn start_on_disk(path: &Path) -> Self {
        Self::start_with(
            StateStore::open(path).unwrap(),
            ManualClock::new(1_000),
            Arc::new(ProxyRouter::new()),
        )
    }

    /// Start a controller over existing state, as a restarted daemon would.
    pub fn start_with(store: StateStore, clock: ManualClock, proxy: Arc<ProxyRouter>) -> Self {
        let verdict = Arc::new(Verdict(AtomicBool::new(true)));
        let mut providers = ProviderRegistry::new();
        providers.register("job", verdict.clone());
        let mut routers = RouterRegistry::new();
        routers.register("proxy", proxy.clone());

        let options = ControllerOptions {
            workers: 2,
            resync_interval: Duration::from_secs(3600),
            measurement_timeout: Duration::from_secs(1),
            router_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            simulate_readiness: true,
        };
        let controller = Controller::new(
            store.clone(),
            providers,
            routers,
            Arc::new(clock.clone()),
            ControllerMetrics::new(),
            options,
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = controller.spawn(shutdown_rx).unwrap();
        Self {
            store,
            clock,
            proxy,
            verdict,
            controller,
            shutdown,
            handles,
        }
    }

    /// Stop every task and hand back the pieces that outlive a controller.
    pub async fn stop(self) -> (ManualClock, Arc<ProxyRouter>) {
        self.shutdown.send(true).unwrap();
        for handle in self.handles {
            handle.await.unwrap();
        }
        (self.clock, self.proxy)
    }

    pub async fn wait_for<T>(&self, what: &str, mut check: impl FnMut(&Self) -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(value) = check(self) {
                return value;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}: {:#?}", self.rollout().status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Move the controller clock and wake everything up.
    pub fn advance(&self, secs: u64) {
        self.clock.advance(secs);
        self.controller.resync().unwrap();
    }

    pub fn rollout(&self) -> Rollout {
        self.store.get(ROLLOUT).unwrap().unwrap()
    }

    pub fn status(&self) -> RolloutStatus {
        self.rollout().status
    }

    pub fn replica_sets(&self) -> Vec<ReplicaSet> {
        self.store.list().unwrap()
    }

    pub fn rs(&self, pod_hash: &str) -> Option<ReplicaSet> {
        self.replica_sets().into_iter().find(|rs| rs.pod_hash() == pod_hash)
    }

    pub fn selector(&self, service: &str) -> Option<String> {
        let svc: Service = self
            .store
            .get(&format!("default/{service}"))
            .unwrap()
            .unwrap();
        svc.selected_hash().map(str::to_string)
    }

    pub fn weights(&self) -> Vec<u32> {
        self.proxy.weight_history(ROLLOUT)
    }

    /// Point the rollout at a new image; returns the new pod template hash.
    pub fn set_image(&self, image: &str) -> String {
        let template = pod_template(image);
        let hash = template_hash(&template);
        self.edit(|r| r.spec.template = template.clone(), false);
        hash
    }

    /// Change the rollout spec, retrying on conflicts.
    pub fn update_spec(&self, change: impl Fn(&mut Rollout)) {
        self.edit(change, false);
    }

    /// Apply a user action to the rollout status, retrying on conflicts
    /// with the controller's own writes.
    pub fn act(&self, action: impl Fn(&mut Rollout)) {
        self.edit(action, true);
    }

    fn edit(&self, change: impl Fn(&mut Rollout), status: bool) {
        for _ in 0..50 {
            let mut rollout = self.rollout();
            change(&mut rollout);
            let result = if status {
                self.store.update_status(&rollout)
            } else {
                self.store.update(rollout)
            };
            match result {
                Ok(_) => return,
                Err(e) if e.is_conflict() => continue,
                Err(e) => panic!("rollout write failed: {e}"),
            }
        }
        panic!("rollout write kept conflicting");
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

pub fn pod_template(image: &str) -> PodTemplate {
    PodTemplate {
        labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        containers: vec![Container {
            name: "app".to_string(),
            image: image.to_string(),
            ..Default::default()
        }],
    }
}

fn rollout(replicas: u32, strategy: RolloutStrategy) -> Rollout {
    Rollout {
        metadata: ObjectMeta::new("default", "web"),
        spec: RolloutSpec {
            replicas,
            template: pod_template("web:v1"),
            strategy,
            paused: false,
            revision_history_limit: 10,
            progress_deadline_seconds: 600,
            progress_deadline_abort: true,
        },
        status: RolloutStatus::default(),
    }
}

/// Canary routed through the `proxy` router with `web-stable`/`web-canary`.
pub fn routed_canary(replicas: u32, steps: Vec<CanaryStep>) -> Rollout {
    rollout(
        replicas,
        RolloutStrategy::Canary(CanaryStrategy {
            steps,
            traffic_routing: Some(TrafficRouting {
                router: "proxy".to_string(),
                config: serde_json::Value::Null,
            }),
            stable_service: Some("web-stable".to_string()),
            canary_service: Some("web-canary".to_string()),
            scale_down_delay_seconds: 30,
            ..Default::default()
        }),
    )
}

pub fn blue_green(replicas: u32, configure: impl FnOnce(&mut BlueGreenStrategy)) -> Rollout {
    let mut bg = BlueGreenStrategy {
        active_service: "web-active".to_string(),
        preview_service: Some("web-preview".to_string()),
        auto_promotion_enabled: true,
        scale_down_delay_seconds: 30,
        ..Default::default()
    };
    configure(&mut bg);
    rollout(replicas, RolloutStrategy::BlueGreen(bg))
}

pub fn analysis_ref(template: &str) -> RolloutAnalysis {
    RolloutAnalysis {
        templates: vec![template.to_string()],
        ..Default::default()
    }
}

/// Single-measurement template judged by the `job` provider.
pub fn template(name: &str) -> AnalysisTemplate {
    let mut metric = Metric::new(name, "job");
    metric.success_condition = Some("result == true".to_string());
    AnalysisTemplate {
        metadata: ObjectMeta::new("default", name),
        spec: AnalysisTemplateSpec {
            metrics: vec![metric],
            args: vec![],
        },
    }
}

pub fn service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta::new("default", name),
        spec: ServiceSpec {
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            port: None,
        },
    }
}
