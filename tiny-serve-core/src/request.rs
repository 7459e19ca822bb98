//! Request identity and lifecycle management.
//!
//! Tracks priority, deadline, token counters and the admission state machine
//! for a single generation request. Only the scheduler side transitions
//! state; everything else holds read-only snapshots.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Opaque request identifier chosen by the caller.
pub type RequestId = String;

/// A request shared between the queue, the scheduler and the ingress API.
pub type SharedRequest = Arc<RwLock<Request>>;

/// Request priority, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    /// Numeric ordinal used by the queue score; lower sorts first.
    pub fn ordinal(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }
}

/// Possible states for a request during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Waiting,
    Running,
    Preempted,
    /// Awaiting a remote cache transfer in disaggregated mode.
    WaitingKvCache,
    Completed,
    Aborted,
    Failed,
}

impl RequestState {
    /// Terminal states are immutable once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Aborted | RequestState::Failed
        )
    }

    /// Only these states are eligible for dequeue.
    pub fn is_schedulable(self) -> bool {
        matches!(self, RequestState::Waiting | RequestState::Preempted)
    }
}

/// Why a running request was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionReason {
    HigherPriority,
    MemoryPressure,
    Timeout,
    TokenBudgetExhausted,
    DeadlineProtection,
}

/// Opaque handle to engine-owned resources captured at preemption time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    pub block_ids: Vec<u32>,
}

/// Per-request timing and accounting record.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub created_at: Instant,
    pub first_scheduled_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub preemption_count: u32,
    pub preempted_duration: Duration,
    pub tokens_processed: usize,
    pub chunk_count: u32,
}

impl RequestMetrics {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            first_scheduled_at: None,
            completed_at: None,
            preemption_count: 0,
            preempted_duration: Duration::ZERO,
            tokens_processed: 0,
            chunk_count: 0,
        }
    }
}

/// Main structure for a single generation request.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    prompt: String,
    prompt_tokens: Vec<i64>,
    max_tokens: usize,
    priority: Priority,
    state: RequestState,
    deadline: Option<Instant>,
    arrival_time: Instant,
    prefilled_tokens: usize,
    generated_tokens: usize,
    preemption_reason: Option<PreemptionReason>,
    preempted_at: Option<Instant>,
    failure_reason: Option<String>,
    saved_state: Option<SavedState>,
    metrics: RequestMetrics,
    /// Queue sequence number, assigned once on first push.
    pub(crate) queue_seq: Option<u64>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, prompt: impl Into<String>, max_tokens: usize) -> Self {
        let now = Instant::now();
        let prompt = prompt.into();
        Self {
            id: id.into(),
            prompt,
            prompt_tokens: Vec::new(),
            max_tokens,
            priority: Priority::Normal,
            state: RequestState::Waiting,
            deadline: None,
            arrival_time: now,
            prefilled_tokens: 0,
            generated_tokens: 0,
            preemption_reason: None,
            preempted_at: None,
            failure_reason: None,
            saved_state: None,
            metrics: RequestMetrics::new(now),
            queue_seq: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_prompt_tokens(mut self, tokens: Vec<i64>) -> Self {
        self.prompt_tokens = tokens;
        self
    }

    pub fn shared(self) -> SharedRequest {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated_tokens
    }

    pub fn preemption_reason(&self) -> Option<PreemptionReason> {
        self.preemption_reason
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn saved_state(&self) -> Option<&SavedState> {
        self.saved_state.as_ref()
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Total prompt length in tokens. Falls back to a whitespace estimate
    /// when the caller submitted untokenized text.
    pub fn prompt_len(&self) -> usize {
        if self.prompt_tokens.is_empty() {
            self.prompt.split_whitespace().count().max(1)
        } else {
            self.prompt_tokens.len()
        }
    }

    /// Prompt tokens not yet processed by a prefill chunk.
    pub fn remaining_prompt(&self) -> usize {
        self.prompt_len().saturating_sub(self.prefilled_tokens)
    }

    pub fn prefilled_tokens(&self) -> usize {
        self.prefilled_tokens
    }

    /// Token ids for the prompt slice `[start, start + len)`.
    pub fn prompt_slice(&self, start: usize, len: usize) -> Vec<i64> {
        let end = (start + len).min(self.prompt_tokens.len());
        if start >= end {
            return Vec::new();
        }
        self.prompt_tokens[start..end].to_vec()
    }

    fn valid_transition(from: RequestState, to: RequestState) -> bool {
        use RequestState::*;
        match (from, to) {
            (Waiting, Running) => true,
            (Waiting, Aborted) | (Waiting, Failed) => true,
            (Running, Preempted) => true,
            (Running, WaitingKvCache) => true,
            (Running, Completed) | (Running, Aborted) | (Running, Failed) => true,
            (Preempted, Waiting) => true,
            (Preempted, Aborted) | (Preempted, Failed) => true,
            (WaitingKvCache, Running) => true,
            (WaitingKvCache, Aborted) | (WaitingKvCache, Failed) => true,
            _ => false,
        }
    }

    /// Apply a state transition. Invalid edges are a programming error and
    /// must never crash the scheduling loop: they are logged and ignored.
    pub(crate) fn transition(&mut self, to: RequestState) -> bool {
        if !Self::valid_transition(self.state, to) {
            tracing::warn!(
                request_id = %self.id,
                from = ?self.state,
                to = ?to,
                "ignoring invalid state transition"
            );
            return false;
        }
        self.state = to;
        true
    }

    /// Record first admission into the running set.
    pub(crate) fn mark_running(&mut self, now: Instant) -> bool {
        if !self.transition(RequestState::Running) {
            return false;
        }
        if self.metrics.first_scheduled_at.is_none() {
            self.metrics.first_scheduled_at = Some(now);
        }
        true
    }

    /// Suspend a running request. Preempting an already-preempted request is
    /// a no-op.
    pub(crate) fn preempt(&mut self, reason: PreemptionReason, now: Instant) -> bool {
        if self.state == RequestState::Preempted {
            return false;
        }
        if !self.transition(RequestState::Preempted) {
            return false;
        }
        self.preemption_reason = Some(reason);
        self.preempted_at = Some(now);
        self.metrics.preemption_count += 1;
        true
    }

    /// Discard all prefill progress (recompute preemption mode).
    pub(crate) fn reset_prefill(&mut self) {
        self.prefilled_tokens = 0;
        self.saved_state = None;
    }

    pub(crate) fn store_saved_state(&mut self, state: SavedState) -> bool {
        // saved_state is only meaningful while preempted
        if self.state != RequestState::Preempted {
            tracing::warn!(
                request_id = %self.id,
                state = ?self.state,
                "dropping saved state handed back for non-preempted request"
            );
            return false;
        }
        self.saved_state = Some(state);
        true
    }

    /// Bring a preempted request back to `Waiting`, handing out the saved
    /// state exactly once.
    pub(crate) fn resume(&mut self, now: Instant) -> Option<SavedState> {
        if !self.transition(RequestState::Waiting) {
            return None;
        }
        if let Some(start) = self.preempted_at.take() {
            self.metrics.preempted_duration += now.duration_since(start);
        }
        self.saved_state.take()
    }

    pub(crate) fn advance_prefill(&mut self, tokens: usize) {
        self.prefilled_tokens = (self.prefilled_tokens + tokens).min(self.prompt_len());
        self.metrics.tokens_processed += tokens;
    }

    pub(crate) fn record_chunk(&mut self) {
        self.metrics.chunk_count += 1;
    }

    /// Record newly generated tokens, clamped so that
    /// `generated_tokens <= max_tokens` always holds.
    pub(crate) fn record_generated(&mut self, tokens: usize) {
        self.generated_tokens = (self.generated_tokens + tokens).min(self.max_tokens);
        self.metrics.tokens_processed += tokens;
    }

    pub(crate) fn complete(&mut self, now: Instant) -> bool {
        if !self.transition(RequestState::Completed) {
            return false;
        }
        self.metrics.completed_at = Some(now);
        true
    }

    pub(crate) fn abort(&mut self, now: Instant) -> bool {
        if !self.transition(RequestState::Aborted) {
            return false;
        }
        self.metrics.completed_at = Some(now);
        true
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>, now: Instant) -> bool {
        if !self.transition(RequestState::Failed) {
            return false;
        }
        self.failure_reason = Some(reason.into());
        self.metrics.completed_at = Some(now);
        true
    }

    /// Read-only copy for the ingress `status()` call.
    pub fn snapshot(&self) -> Request {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Request {
        Request::new("r0", "hello world", 16)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical.ordinal() < Priority::High.ordinal());
        assert!(Priority::High.ordinal() < Priority::Normal.ordinal());
        assert!(Priority::Low.ordinal() < Priority::Background.ordinal());
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let now = Instant::now();
        let mut r = req();
        assert_eq!(r.state(), RequestState::Waiting);
        assert!(r.mark_running(now));
        assert!(r.complete(now));
        assert!(r.state().is_terminal());
        assert!(r.metrics().completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let now = Instant::now();
        let mut r = req();
        r.mark_running(now);
        r.complete(now);
        assert!(!r.mark_running(now));
        assert!(!r.abort(now));
        assert_eq!(r.state(), RequestState::Completed);
    }

    #[test]
    fn test_no_waiting_to_completed_shortcut() {
        let mut r = req();
        assert!(!r.complete(Instant::now()));
        assert_eq!(r.state(), RequestState::Waiting);
    }

    #[test]
    fn test_preempt_is_idempotent() {
        let now = Instant::now();
        let mut r = req();
        r.mark_running(now);
        assert!(r.preempt(PreemptionReason::MemoryPressure, now));
        assert!(!r.preempt(PreemptionReason::HigherPriority, now));
        assert_eq!(r.metrics().preemption_count, 1);
        assert_eq!(r.preemption_reason(), Some(PreemptionReason::MemoryPressure));
    }

    #[test]
    fn test_resume_clears_saved_state_once() {
        let now = Instant::now();
        let mut r = req();
        r.mark_running(now);
        r.preempt(PreemptionReason::HigherPriority, now);
        r.store_saved_state(SavedState { block_ids: vec![1, 2, 3] });
        assert!(r.saved_state().is_some());

        let saved = r.resume(now);
        assert_eq!(saved.unwrap().block_ids, vec![1, 2, 3]);
        assert_eq!(r.state(), RequestState::Waiting);
        assert!(r.saved_state().is_none());

        // second cycle has nothing left to hand out
        r.mark_running(now);
        r.preempt(PreemptionReason::HigherPriority, now);
        assert!(r.resume(now).is_none());
    }

    #[test]
    fn test_generated_tokens_clamped_to_max() {
        let now = Instant::now();
        let mut r = req();
        r.mark_running(now);
        r.record_generated(10);
        r.record_generated(10);
        assert_eq!(r.generated_tokens(), 16);
    }

    #[test]
    fn test_kv_cache_wait_cycle() {
        let now = Instant::now();
        let mut r = req();
        r.mark_running(now);
        assert!(r.transition(RequestState::WaitingKvCache));
        assert!(r.transition(RequestState::Running));
        assert!(r.complete(now));
    }

    #[test]
    fn test_fail_records_reason() {
        let mut r = req();
        r.fail("deadline unreachable", Instant::now());
        assert_eq!(r.state(), RequestState::Failed);
        assert_eq!(r.failure_reason(), Some("deadline unreachable"));
    }
}
