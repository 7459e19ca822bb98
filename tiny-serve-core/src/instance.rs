//! Serving-instance registry and health checking.
//!
//! The registry owns the live set of prefill/decode instances. Selectors
//! only read; the router and the health checker are the only writers, each
//! touching disjoint fields under the registry-wide lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{InstanceDescriptor, InstancePoolConfig};

/// Which generation phase an instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Prefill,
    Decode,
    /// Serves both phases; eligible for either selection.
    Unified,
}

impl InstanceRole {
    pub fn serves(self, wanted: InstanceRole) -> bool {
        self == wanted || self == InstanceRole::Unified
    }
}

/// One physical serving instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub role: InstanceRole,
    pub host: String,
    pub port: u16,
    /// Auxiliary ports for the cache-transfer handshake and notification.
    pub handshake_port: u16,
    pub notify_port: u16,
    pub running: u32,
    pub waiting: u32,
    pub cache_utilization: f32,
    pub last_health_check: Instant,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub tp_size: u32,
    pub dp_size: u32,
    pub dp_rank: u32,
}

impl Instance {
    pub fn new(id: impl Into<String>, role: InstanceRole, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            role,
            host: host.into(),
            port,
            handshake_port: 0,
            notify_port: 0,
            running: 0,
            waiting: 0,
            cache_utilization: 0.0,
            last_health_check: Instant::now(),
            healthy: true,
            consecutive_failures: 0,
            tp_size: 1,
            dp_size: 1,
            dp_rank: 0,
        }
    }

    pub fn with_transfer_ports(mut self, handshake_port: u16, notify_port: u16) -> Self {
        self.handshake_port = handshake_port;
        self.notify_port = notify_port;
        self
    }

    pub fn with_parallelism(mut self, tp_size: u32, dp_size: u32, dp_rank: u32) -> Self {
        self.tp_size = tp_size;
        self.dp_size = dp_size;
        self.dp_rank = dp_rank;
        self
    }

    /// Load score used by least-loaded selection; lower is better.
    pub fn load_score(&self) -> f64 {
        f64::from(self.running) + 0.5 * f64::from(self.waiting)
    }
}

impl From<&InstanceDescriptor> for Instance {
    fn from(desc: &InstanceDescriptor) -> Self {
        Instance::new(desc.id.clone(), desc.role, desc.host.clone(), desc.port)
            .with_transfer_ports(desc.handshake_port, desc.notify_port)
            .with_parallelism(desc.tp_size, desc.dp_size, desc.dp_rank)
    }
}

/// Live set of serving instances, shared between the router, the selectors
/// and the health checker.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Instance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from operator configuration.
    pub fn from_pool_config(config: &InstancePoolConfig) -> Self {
        let registry = Self::new();
        for desc in config
            .prefill_instances
            .iter()
            .chain(config.decode_instances.iter())
        {
            registry.register(Instance::from(desc));
        }
        registry
    }

    pub fn register(&self, instance: Instance) {
        tracing::info!(instance_id = %instance.id, role = ?instance.role, "registering instance");
        self.instances
            .write()
            .expect("registry lock poisoned")
            .insert(instance.id.clone(), instance);
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .instances
            .write()
            .expect("registry lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(instance_id = %id, "removed instance");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.instances.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Healthy instances serving `role`, sorted by id so hash routing stays
    /// sticky across calls.
    pub fn healthy_instances(&self, role: InstanceRole) -> Vec<Instance> {
        let mut list: Vec<Instance> = self
            .instances
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|i| i.healthy && i.role.serves(role))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// All registered instances, healthy or not.
    pub fn all_instances(&self) -> Vec<Instance> {
        self.instances
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn incr_running(&self, id: &str) {
        self.update(id, |i| i.running += 1);
    }

    pub fn decr_running(&self, id: &str) {
        self.update(id, |i| i.running = i.running.saturating_sub(1));
    }

    pub fn incr_waiting(&self, id: &str) {
        self.update(id, |i| i.waiting += 1);
    }

    pub fn decr_waiting(&self, id: &str) {
        self.update(id, |i| i.waiting = i.waiting.saturating_sub(1));
    }

    pub fn set_cache_utilization(&self, id: &str, fraction: f32) {
        self.update(id, |i| i.cache_utilization = fraction.clamp(0.0, 1.0));
    }

    /// Record a health probe outcome. Returns the consecutive failure count
    /// after the update.
    pub fn record_health(&self, id: &str, healthy: bool, now: Instant) -> u32 {
        let mut failures = 0;
        self.update(id, |i| {
            i.last_health_check = now;
            i.healthy = healthy;
            if healthy {
                i.consecutive_failures = 0;
            } else {
                i.consecutive_failures += 1;
            }
            failures = i.consecutive_failures;
        });
        failures
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Instance)) {
        if let Some(instance) = self
            .instances
            .write()
            .expect("registry lock poisoned")
            .get_mut(id)
        {
            f(instance);
        }
    }
}

/// Transport-level health probe; the actual ping is out of scope.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> bool;
}

/// Periodic health checker running as an independent background task.
pub struct HealthChecker {
    registry: Arc<InstanceRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            registry,
            probe,
            interval,
            timeout,
            failure_threshold,
        }
    }

    /// Spawn the check loop; it stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check_all().await,
                }
            }
            tracing::debug!("health checker stopped");
        })
    }

    async fn check_all(&self) {
        for instance in self.registry.all_instances() {
            let healthy = tokio::time::timeout(self.timeout, self.probe.probe(&instance))
                .await
                .unwrap_or(false);
            let failures = self
                .registry
                .record_health(&instance.id, healthy, Instant::now());
            if !healthy {
                tracing::warn!(
                    instance_id = %instance.id,
                    failures,
                    "health check failed"
                );
                if failures >= self.failure_threshold {
                    tracing::error!(
                        instance_id = %instance.id,
                        "failure threshold reached, deregistering instance"
                    );
                    self.registry.remove(&instance.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_load_score() {
        let mut inst = Instance::new("i0", InstanceRole::Decode, "10.0.0.1", 8000);
        inst.running = 3;
        inst.waiting = 4;
        assert_eq!(inst.load_score(), 5.0);
    }

    #[test]
    fn test_unified_serves_both_roles() {
        assert!(InstanceRole::Unified.serves(InstanceRole::Prefill));
        assert!(InstanceRole::Unified.serves(InstanceRole::Decode));
        assert!(!InstanceRole::Prefill.serves(InstanceRole::Decode));
    }

    #[test]
    fn test_registry_filters_unhealthy() {
        let registry = InstanceRegistry::new();
        registry.register(Instance::new("p0", InstanceRole::Prefill, "h0", 1));
        registry.register(Instance::new("p1", InstanceRole::Prefill, "h1", 2));
        registry.record_health("p1", false, Instant::now());

        let healthy = registry.healthy_instances(InstanceRole::Prefill);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "p0");
        // unhealthy instances stay registered until removed
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let registry = InstanceRegistry::new();
        registry.register(Instance::new("d0", InstanceRole::Decode, "h", 1));
        registry.decr_running("d0");
        assert_eq!(registry.get("d0").unwrap().running, 0);
        registry.incr_running("d0");
        registry.incr_running("d0");
        registry.decr_running("d0");
        assert_eq!(registry.get("d0").unwrap().running, 1);
    }

    #[test]
    fn test_health_failures_reset_on_success() {
        let registry = InstanceRegistry::new();
        registry.register(Instance::new("d0", InstanceRole::Decode, "h", 1));
        let now = Instant::now();
        assert_eq!(registry.record_health("d0", false, now), 1);
        assert_eq!(registry.record_health("d0", false, now), 2);
        assert_eq!(registry.record_health("d0", true, now), 0);
        assert!(registry.get("d0").unwrap().healthy);
    }

    struct FlakyProbe {
        ok: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self, _instance: &Instance) -> bool {
            self.ok.load(Ordering::Relaxed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_deregisters_after_threshold() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.register(Instance::new("d0", InstanceRole::Decode, "h", 1));

        let probe = Arc::new(FlakyProbe { ok: AtomicBool::new(false) });
        let checker = HealthChecker::new(
            registry.clone(),
            probe,
            Duration::from_millis(10),
            Duration::from_millis(5),
            2,
        );
        let cancel = CancellationToken::new();
        let handle = checker.spawn(cancel.clone());

        // three intervals are plenty for two consecutive failures
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("d0").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
