//! Async serving engine: the scheduling loop plus the ingress surface.
//!
//! The engine owns the queue and the scheduler, drives one scheduling cycle
//! per tick, publishes each non-empty batch on a watch channel and keeps a
//! short rolling history of outputs and cycle latencies. Execution feedback
//! (progress, completion, failure, preemption) comes back through explicit
//! callbacks so the loop itself never blocks on the model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{settings, ConfigError, InstancePoolConfig, ServeConfig};
use crate::instance::{HealthChecker, HealthProbe, Instance, InstanceRegistry};
use crate::queue::{PriorityRequestQueue, QueueError};
use crate::request::{PreemptionReason, Request, RequestId, SavedState, SharedRequest};
use crate::scheduler::{Scheduler, SchedulerOutput};

/// Point-in-time engine counters for observability.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub cycles: u64,
    pub running: usize,
    pub waiting: usize,
    pub last_cycle: Duration,
    pub mean_cycle: Duration,
}

/// Top-level serving engine.
pub struct SchedulingEngine {
    config: ServeConfig,
    queue: Arc<PriorityRequestQueue>,
    scheduler: Mutex<Scheduler>,
    /// Every request ever submitted, for `status()`; terminal entries are
    /// purged after the retention window.
    requests: Mutex<HashMap<RequestId, SharedRequest>>,
    output_tx: watch::Sender<SchedulerOutput>,
    recent_outputs: Mutex<VecDeque<(Instant, SchedulerOutput)>>,
    latencies: Mutex<VecDeque<Duration>>,
    cycles: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulingEngine {
    /// Build an engine. A bad configuration is rejected here, before any
    /// request can be accepted.
    pub fn new(config: ServeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let queue = Arc::new(PriorityRequestQueue::new(
            config.queue_capacity,
            config.max_queue_age(),
        ));
        let scheduler = Scheduler::new(config.clone(), queue.clone());
        let (output_tx, _) = watch::channel(SchedulerOutput::default());
        Ok(Self {
            config,
            queue,
            scheduler: Mutex::new(scheduler),
            requests: Mutex::new(HashMap::new()),
            output_tx,
            recent_outputs: Mutex::new(VecDeque::new()),
            latencies: Mutex::new(VecDeque::new()),
            cycles: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self) -> &Arc<PriorityRequestQueue> {
        &self.queue
    }

    /// Receiver for scheduled batches; the executor drives from this.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerOutput> {
        self.output_tx.subscribe()
    }

    /// Enqueue a request for scheduling, returning its id.
    pub fn submit(&self, request: Request) -> Result<RequestId, QueueError> {
        let shared = request.shared();
        self.queue.push(&shared)?;
        let id = shared.read().expect("request lock poisoned").id().clone();
        self.requests
            .lock()
            .expect("request table poisoned")
            .insert(id.clone(), shared);
        tracing::debug!(request_id = %id, "request submitted");
        Ok(id)
    }

    /// Abort a request in any non-terminal state. Returns false when the
    /// request is unknown or already terminal.
    pub fn cancel(&self, id: &str) -> bool {
        let now = Instant::now();
        self.queue.remove(id);
        if self
            .scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .abort_request(id, now)
        {
            tracing::debug!(request_id = %id, "running request aborted");
            return true;
        }
        match self.requests.lock().expect("request table poisoned").get(id) {
            Some(request) => {
                let aborted = request.write().expect("request lock poisoned").abort(now);
                if aborted {
                    tracing::debug!(request_id = %id, "queued request aborted");
                }
                aborted
            }
            None => false,
        }
    }

    /// Read-only snapshot of a request, terminal or not.
    pub fn status(&self, id: &str) -> Option<Request> {
        self.requests
            .lock()
            .expect("request table poisoned")
            .get(id)
            .map(|r| r.read().expect("request lock poisoned").snapshot())
    }

    pub fn stats(&self) -> EngineStats {
        let latencies = self.latencies.lock().expect("latency window poisoned");
        let mean_cycle = if latencies.is_empty() {
            Duration::ZERO
        } else {
            latencies.iter().sum::<Duration>() / latencies.len() as u32
        };
        EngineStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            running: self
                .scheduler
                .lock()
                .expect("scheduler lock poisoned")
                .running_len(),
            waiting: self.queue.len(),
            last_cycle: latencies.back().copied().unwrap_or(Duration::ZERO),
            mean_cycle,
        }
    }

    /// Batches produced within the retention window, oldest first.
    pub fn recent_outputs(&self) -> Vec<SchedulerOutput> {
        self.recent_outputs
            .lock()
            .expect("output cache poisoned")
            .iter()
            .map(|(_, out)| out.clone())
            .collect()
    }

    /// Run one scheduling cycle immediately. The background loop calls this
    /// on every tick; tests call it directly.
    pub fn run_cycle(&self) -> SchedulerOutput {
        let started = Instant::now();
        let out = self
            .scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .schedule(started);

        self.cycles.fetch_add(1, Ordering::Relaxed);
        {
            let mut latencies = self.latencies.lock().expect("latency window poisoned");
            latencies.push_back(started.elapsed());
            while latencies.len() > settings::LATENCY_WINDOW {
                latencies.pop_front();
            }
        }

        if !out.is_empty() {
            let retention = Duration::from_millis(settings::OUTPUT_RETENTION_MS);
            let mut cache = self.recent_outputs.lock().expect("output cache poisoned");
            cache.push_back((started, out.clone()));
            while cache
                .front()
                .is_some_and(|(at, _)| started.duration_since(*at) > retention)
            {
                cache.pop_front();
            }
            let _ = self.output_tx.send(out.clone());
        }

        self.purge_finished(started);
        out
    }

    /// Drop terminal requests that outlived the retention window.
    fn purge_finished(&self, now: Instant) {
        let retention = Duration::from_millis(settings::OUTPUT_RETENTION_MS);
        self.requests
            .lock()
            .expect("request table poisoned")
            .retain(|_, request| {
                let req = request.read().expect("request lock poisoned");
                if !req.state().is_terminal() {
                    return true;
                }
                match req.metrics().completed_at {
                    Some(at) => now.duration_since(at) <= retention,
                    None => true,
                }
            });
    }

    /// Spawn the background scheduling loop.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.cycle_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_aging = Instant::now();
            tracing::info!(
                cycle_interval_ms = engine.config.cycle_interval_ms,
                "scheduling loop started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        if engine.config.starvation_prevention
                            && now.duration_since(last_aging) >= engine.config.aging_interval()
                        {
                            engine.queue.age_requests(now);
                            last_aging = now;
                        }
                        engine.run_cycle();
                    }
                }
            }
            tracing::info!("scheduling loop stopped");
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Register the configured instances and spawn periodic health checks
    /// against them.
    pub fn start_health_checks(
        &self,
        pool: &InstancePoolConfig,
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) {
        for descriptor in pool.prefill_instances.iter().chain(&pool.decode_instances) {
            registry.register(Instance::from(descriptor));
        }
        let checker = HealthChecker::new(
            registry,
            probe,
            pool.health_check_interval(),
            pool.health_check_timeout(),
            pool.health_failure_threshold,
        );
        let handle = checker.spawn(self.cancel.clone());
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Stop all background tasks and wait for them to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "background task panicked during shutdown");
            }
        }
        tracing::info!("engine shut down");
    }

    // Execution feedback, forwarded to the scheduler.

    pub fn record_progress(&self, id: &str, tokens: usize) {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .record_progress(id, tokens);
    }

    pub fn mark_completed(&self, id: &str) -> bool {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .mark_completed(id, Instant::now())
    }

    pub fn mark_failed(&self, id: &str, reason: &str) -> bool {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .mark_failed(id, reason, Instant::now())
    }

    pub fn preempt(&self, id: &str, reason: PreemptionReason) -> bool {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .preempt_request(id, reason, Instant::now())
    }

    pub fn store_saved_state(&self, request: &SharedRequest, state: SavedState) -> bool {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .store_saved_state(request, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, RequestState};

    fn tokens(n: usize) -> Vec<i64> {
        (0..n as i64).collect()
    }

    fn engine() -> Arc<SchedulingEngine> {
        Arc::new(SchedulingEngine::new(ServeConfig::default()).unwrap())
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let cfg = ServeConfig {
            max_tokens_per_batch: 0,
            ..Default::default()
        };
        assert!(SchedulingEngine::new(cfg).is_err());
    }

    #[test]
    fn test_submit_schedule_complete() {
        let engine = engine();
        let id = engine
            .submit(Request::new("r0", "p", 8).with_prompt_tokens(tokens(16)))
            .unwrap();
        assert_eq!(id, "r0");

        let out = engine.run_cycle();
        assert_eq!(out.scheduled.len(), 1);
        assert_eq!(out.scheduled[0].id, "r0");
        assert_eq!(engine.status("r0").unwrap().state(), RequestState::Running);

        engine.record_progress("r0", 8);
        assert!(engine.mark_completed("r0"));
        let status = engine.status("r0").unwrap();
        assert_eq!(status.state(), RequestState::Completed);
        assert_eq!(status.generated_tokens(), 8);
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let engine = engine();
        engine
            .submit(Request::new("queued", "p", 8).with_prompt_tokens(tokens(4)))
            .unwrap();
        engine
            .submit(
                Request::new("running", "p", 8)
                    .with_prompt_tokens(tokens(4))
                    .with_priority(Priority::High),
            )
            .unwrap();

        // cancel before any cycle: the request never ran
        assert!(engine.cancel("queued"));
        assert_eq!(
            engine.status("queued").unwrap().state(),
            RequestState::Aborted
        );

        engine.run_cycle();
        assert!(engine.cancel("running"));
        assert_eq!(
            engine.status("running").unwrap().state(),
            RequestState::Aborted
        );

        // double-cancel is a no-op
        assert!(!engine.cancel("running"));
        assert!(!engine.cancel("never-submitted"));
    }

    #[test]
    fn test_queue_capacity_rejects_submit() {
        let cfg = ServeConfig {
            queue_capacity: Some(1),
            ..Default::default()
        };
        let engine = Arc::new(SchedulingEngine::new(cfg).unwrap());
        engine.submit(Request::new("r0", "p", 8)).unwrap();
        assert!(matches!(
            engine.submit(Request::new("r1", "p", 8)),
            Err(QueueError::CapacityExceeded(1))
        ));
    }

    #[test]
    fn test_stats_and_output_cache() {
        let engine = engine();
        engine
            .submit(Request::new("r0", "p", 8).with_prompt_tokens(tokens(4)))
            .unwrap();
        engine.run_cycle();
        engine.run_cycle();

        let stats = engine.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.waiting, 0);

        // only non-empty batches are cached: admission plus one decode step
        let cached = engine.recent_outputs();
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_schedules_and_publishes() {
        let engine = engine();
        let mut rx = engine.subscribe();
        engine
            .submit(Request::new("r0", "p", 8).with_prompt_tokens(tokens(4)))
            .unwrap();

        engine.start();
        tokio::time::sleep(engine.config.cycle_interval() * 3).await;

        rx.changed().await.unwrap();
        let out = rx.borrow_and_update().clone();
        assert!(out.scheduled.iter().any(|s| s.id == "r0"));

        engine.shutdown().await;
        assert!(engine.stats().cycles >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let engine = engine();
        engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;
        let cycles = engine.stats().cycles;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.stats().cycles, cycles);
    }
}
