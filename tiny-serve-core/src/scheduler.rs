//! Batch scheduler converting queue contents into execution batches.
//!
//! Each cycle pulls eligible requests from the admission queue under a
//! token/request budget, slices long prompts into chunks, preempts
//! lower-priority running work when a higher-priority arrival cannot fit,
//! and force-admits requests whose deadline is about to expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{PreemptionMode, ServeConfig};
use crate::queue::PriorityRequestQueue;
use crate::request::{
    Priority, PreemptionReason, RequestId, RequestState, SavedState, SharedRequest,
};

/// One scheduled request slice handed to the execution engine.
#[derive(Debug, Clone)]
pub struct ScheduledSequence {
    pub id: RequestId,
    pub prompt_len: usize,
    pub output_len: usize,
    /// Token ids covered by this cycle (a prompt chunk, or the tail token
    /// for a decode step).
    pub tokens: Vec<i64>,
    pub spec_tokens: Option<Vec<i64>>,
    pub priority: Priority,
}

/// The batch produced by one scheduling cycle.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOutput {
    pub scheduled: Vec<ScheduledSequence>,
    /// Requests rejected this cycle (e.g. unreachable deadlines).
    pub ignored: Vec<RequestId>,
    /// Saved-state blocks the engine must restore before running a resumed
    /// request.
    pub blocks_to_swap_in: HashMap<RequestId, Vec<u32>>,
    /// Requests whose engine state must be swapped out (swap-mode
    /// preemption); the engine hands the handle back via
    /// [`Scheduler::store_saved_state`].
    pub blocks_to_swap_out: Vec<RequestId>,
    /// Source -> destination block copies requested by the engine contract.
    pub blocks_to_copy: HashMap<u32, u32>,
    /// Ceiling the engine must respect when executing this batch.
    pub max_num_batched_tokens: usize,
}

impl SchedulerOutput {
    fn new(max_num_batched_tokens: usize) -> Self {
        Self {
            max_num_batched_tokens,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.ignored.is_empty()
    }
}

/// Core scheduler responsible for admission, chunking and preemption.
pub struct Scheduler {
    config: ServeConfig,
    queue: Arc<PriorityRequestQueue>,
    running: HashMap<RequestId, SharedRequest>,
    /// Consecutive cycles a deadline-bearing request went unadmitted.
    missed_cycles: HashMap<RequestId, (u32, SharedRequest)>,
}

impl Scheduler {
    pub fn new(config: ServeConfig, queue: Arc<PriorityRequestQueue>) -> Self {
        Self {
            config,
            queue,
            running: HashMap::new(),
            missed_cycles: HashMap::new(),
        }
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Whether there is no active or queued work.
    pub fn is_finished(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    /// Produce one batch. Never fails: non-admission is silent re-queue and
    /// every error is reflected in request state, not propagated.
    pub fn schedule(&mut self, now: Instant) -> SchedulerOutput {
        let mut out = SchedulerOutput::new(self.config.max_tokens_per_batch);
        let mut budget = self.config.max_tokens_per_batch;

        // Ongoing decodes each consume one token of this cycle's budget.
        budget = budget.saturating_sub(self.decode_step(&mut out));

        // Deadline-protected admission runs before ordinary admission and
        // ignores the budget; this is the only path that can exceed
        // max_tokens_per_batch.
        if self.config.deadline_scheduling {
            self.admit_due(now, &mut out, &mut budget);
        }

        // Requests that received a chunk this cycle go back to the queue
        // only once the cycle ends, so a single prompt cannot absorb the
        // whole budget chunk by chunk. Deferred requests likewise, so the
        // loop never re-pops them within the same cycle.
        let mut chunked: Vec<SharedRequest> = Vec::new();
        let mut deferred: Vec<SharedRequest> = Vec::new();

        // Admit new work while slots and tokens remain.
        while self.running.len() < self.config.max_running_requests && budget > 0 {
            let Some(request) = self.queue.pop() else {
                break;
            };

            let (cost, is_chunk) = self.admission_cost(&request);
            if cost <= budget {
                budget -= self.admit(&request, cost, is_chunk, now, &mut out);
                if is_chunk {
                    chunked.push(request);
                }
                continue;
            }

            // A cost beyond the whole cycle budget can never be satisfied,
            // no matter how many victims are preempted. Step past it so the
            // work queued behind it still runs this cycle.
            if cost > self.config.max_tokens_per_batch {
                let id = request.read().expect("request lock poisoned").id().clone();
                tracing::warn!(
                    request_id = %id,
                    cost,
                    budget = self.config.max_tokens_per_batch,
                    "admission cost exceeds the cycle budget, deferring"
                );
                deferred.push(request);
                continue;
            }

            // Budget exhausted: try to free some by preempting the
            // lowest-priority running request, never Critical.
            let mut freed = 0;
            if self.config.preemption_enabled {
                let candidate_priority = request.read().expect("request lock poisoned").priority();
                while freed < cost.saturating_sub(budget) {
                    let Some(reclaimed) = self.preempt_victim(candidate_priority, now, &mut out)
                    else {
                        break;
                    };
                    freed += reclaimed;
                }
            }
            budget += freed;

            if cost <= budget && self.running.len() < self.config.max_running_requests {
                budget -= self.admit(&request, cost, is_chunk, now, &mut out);
                if is_chunk {
                    chunked.push(request);
                }
            } else {
                // silent re-queue, retried next cycle
                self.requeue(&request);
                break;
            }
        }

        for request in chunked.into_iter().chain(deferred) {
            if let Err(e) = self.queue.push(&request) {
                let id = request.read().expect("request lock poisoned").id().clone();
                tracing::warn!(request_id = %id, error = %e, "failed to re-queue request");
            }
        }

        self.expire_unreachable_deadlines(now, &mut out);
        out
    }

    /// Force-admit every queued request whose deadline falls within one
    /// scheduling cycle, ahead of budget accounting.
    fn admit_due(&mut self, now: Instant, out: &mut SchedulerOutput, budget: &mut usize) {
        let horizon = now + self.config.cycle_interval();
        for request in self.queue.pop_due(horizon) {
            let cost = {
                let req = request.read().expect("request lock poisoned");
                req.remaining_prompt().max(1)
            };
            tracing::debug!(
                request_id = %request.read().expect("request lock poisoned").id(),
                cost,
                "deadline override admission"
            );
            let spent = self.admit(&request, cost, false, now, out);
            *budget = budget.saturating_sub(spent);
        }
    }

    /// Emit a decode step for every running request.
    fn decode_step(&self, out: &mut SchedulerOutput) -> usize {
        let mut tokens = 0;
        for request in self.running.values() {
            let req = request.read().expect("request lock poisoned");
            if req.state() != RequestState::Running {
                continue;
            }
            out.scheduled.push(ScheduledSequence {
                id: req.id().clone(),
                prompt_len: req.prompt_len(),
                output_len: req.generated_tokens(),
                tokens: Vec::new(),
                spec_tokens: None,
                priority: req.priority(),
            });
            tokens += 1;
        }
        tokens
    }

    /// Tokens this request would consume if admitted now, and whether that
    /// is a prompt chunk rather than the full remainder.
    fn admission_cost(&self, request: &SharedRequest) -> (usize, bool) {
        let req = request.read().expect("request lock poisoned");
        let remaining = req.remaining_prompt();
        if remaining == 0 {
            // resumed swap-mode request, decode-only
            return (1, false);
        }
        let full = remaining.min(self.config.max_prompt_tokens);
        if self.config.chunked_prefill_enabled && remaining > self.config.chunk_token_threshold {
            (self.config.chunk_token_threshold, true)
        } else {
            (full, false)
        }
    }

    /// Admit a request for `cost` tokens. A chunk admission processes part
    /// of the prompt and goes straight back to the front of its priority
    /// class; a full admission joins the running set. Returns the tokens
    /// actually spent.
    fn admit(
        &mut self,
        request: &SharedRequest,
        cost: usize,
        is_chunk: bool,
        now: Instant,
        out: &mut SchedulerOutput,
    ) -> usize {
        let mut req = request.write().expect("request lock poisoned");
        let id = req.id().clone();

        // resumption hands the saved state back to the engine exactly once
        if req.state() == RequestState::Preempted {
            if let Some(saved) = req.resume(now) {
                out.blocks_to_swap_in.insert(id.clone(), saved.block_ids);
            }
        }

        let start = req.prefilled_tokens();
        if start < req.prompt_len() {
            req.advance_prefill(cost);
        }
        if is_chunk {
            req.record_chunk();
        }

        out.scheduled.push(ScheduledSequence {
            id: id.clone(),
            prompt_len: req.prompt_len(),
            output_len: req.generated_tokens(),
            tokens: req.prompt_slice(start, cost),
            spec_tokens: None,
            priority: req.priority(),
        });

        self.missed_cycles.remove(&id);

        if !is_chunk {
            // a chunk remainder re-queues at the front of its priority class
            // via the preserved sequence number; a full admission runs
            req.mark_running(now);
            drop(req);
            self.running.insert(id, request.clone());
        }
        cost
    }

    /// Preempt the lowest-priority running request with a priority strictly
    /// below `candidate`, never `Critical`. Returns the tokens reclaimed
    /// from this cycle's batch, or `None` when no victim qualifies.
    fn preempt_victim(
        &mut self,
        candidate: Priority,
        now: Instant,
        out: &mut SchedulerOutput,
    ) -> Option<usize> {
        let victim_id = self
            .running
            .iter()
            .filter_map(|(id, request)| {
                let req = request.read().expect("request lock poisoned");
                let p = req.priority();
                (p != Priority::Critical && p.ordinal() > candidate.ordinal())
                    .then(|| (id.clone(), p.ordinal()))
            })
            .max_by_key(|(_, ordinal)| *ordinal)
            .map(|(id, _)| id)?;

        let request = self.running.remove(&victim_id)?;
        {
            let mut req = request.write().expect("request lock poisoned");
            req.preempt(PreemptionReason::HigherPriority, now);
            match self.config.preemption_mode {
                PreemptionMode::Swap => out.blocks_to_swap_out.push(victim_id.clone()),
                PreemptionMode::Recompute => req.reset_prefill(),
            }
        }
        tracing::debug!(request_id = %victim_id, "preempted for higher-priority arrival");

        // reclaim whatever the victim was scheduled for this cycle
        let reclaimed = match out.scheduled.iter().position(|s| s.id == victim_id) {
            Some(idx) => {
                let seq = out.scheduled.swap_remove(idx);
                seq.tokens.len().max(1)
            }
            None => 1,
        };

        if let Err(e) = self.queue.push(&request) {
            tracing::warn!(request_id = %victim_id, error = %e, "failed to re-queue preempted request");
        }
        Some(reclaimed)
    }

    fn requeue(&mut self, request: &SharedRequest) {
        if let Err(e) = self.queue.push(request) {
            let id = request.read().expect("request lock poisoned").id().clone();
            tracing::warn!(request_id = %id, error = %e, "failed to re-queue request");
        }
    }

    /// Fail deadline-bearing requests that went unadmitted for too many
    /// consecutive cycles. An admission clears the counter, so only
    /// consecutive misses accumulate.
    fn expire_unreachable_deadlines(&mut self, now: Instant, out: &mut SchedulerOutput) {
        if !self.config.deadline_scheduling {
            return;
        }
        // a tracked request can leave the queue sideways (cancelled,
        // force-admitted, failed); drop its entry instead of holding the
        // handle forever
        self.missed_cycles.retain(|_, (_, request)| {
            request
                .read()
                .expect("request lock poisoned")
                .state()
                .is_schedulable()
        });
        for request in self.queue.deadline_waiters() {
            let id = request.read().expect("request lock poisoned").id().clone();
            self.missed_cycles
                .entry(id)
                .or_insert_with(|| (0, request))
                .0 += 1;
        }
        let limit = self.config.deadline_fail_cycles;
        let expired: Vec<RequestId> = self
            .missed_cycles
            .iter()
            .filter(|(_, (misses, _))| *misses >= limit)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some((_, request)) = self.missed_cycles.remove(&id) else {
                continue;
            };
            if !self.queue.remove(&id) {
                continue;
            }
            tracing::warn!(request_id = %id, "deadline unreachable, failing request");
            request
                .write()
                .expect("request lock poisoned")
                .fail("deadline unreachable", now);
            out.ignored.push(id);
        }
    }

    /// Engine callback: the request produced `tokens` new output tokens.
    pub fn record_progress(&mut self, id: &str, tokens: usize) {
        if let Some(request) = self.running.get(id) {
            request
                .write()
                .expect("request lock poisoned")
                .record_generated(tokens);
        }
    }

    /// Engine callback: the request finished successfully.
    pub fn mark_completed(&mut self, id: &str, now: Instant) -> bool {
        let Some(request) = self.running.remove(id) else {
            return false;
        };
        let done = request.write().expect("request lock poisoned").complete(now);
        done
    }

    /// Engine callback: the request failed during execution.
    pub fn mark_failed(&mut self, id: &str, reason: &str, now: Instant) -> bool {
        let Some(request) = self.running.remove(id) else {
            return false;
        };
        let done = request
            .write()
            .expect("request lock poisoned")
            .fail(reason, now);
        done
    }

    /// Ingress callback: the client cancelled a running request.
    pub fn abort_request(&mut self, id: &str, now: Instant) -> bool {
        let Some(request) = self.running.remove(id) else {
            return false;
        };
        let done = request.write().expect("request lock poisoned").abort(now);
        done
    }

    /// Engine callback: preempt a specific running request (e.g. under
    /// memory pressure reported by the engine). Idempotent.
    pub fn preempt_request(&mut self, id: &str, reason: PreemptionReason, now: Instant) -> bool {
        let Some(request) = self.running.remove(id) else {
            return false;
        };
        let preempted = {
            let mut req = request.write().expect("request lock poisoned");
            let done = req.preempt(reason, now);
            if done && self.config.preemption_mode == PreemptionMode::Recompute {
                req.reset_prefill();
            }
            done
        };
        if preempted {
            if let Err(e) = self.queue.push(&request) {
                tracing::warn!(request_id = %id, error = %e, "failed to re-queue preempted request");
            }
        }
        preempted
    }

    /// Engine callback: swap-mode preemption handback.
    pub fn store_saved_state(&mut self, request: &SharedRequest, state: SavedState) -> bool {
        request
            .write()
            .expect("request lock poisoned")
            .store_saved_state(state)
    }
}
