//! Disaggregated prefill/decode routing.
//!
//! Sequences a request through a prefill instance and a decode instance,
//! carrying the transfer parameters the decode instance needs to locate and
//! pull the prefill instance's cache state. The network calls themselves
//! happen behind the [`InstanceClient`] seam; all failure is returned as
//! values, never thrown across the ingress boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::instance::{Instance, InstanceRegistry, InstanceRole};
use crate::request::{PreemptionReason, RequestId, RequestState, SharedRequest};
use crate::selector::Selector;

/// Errors produced while routing a request across instances.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no healthy {0:?} instance available")]
    NoHealthyInstance(InstanceRole),
    #[error("request {0} has no recorded prefill leg")]
    UnknownRequest(RequestId),
    #[error("prefill call failed: {0}")]
    PrefillFailed(String),
    #[error("decode call failed: {0}")]
    DecodeFailed(String),
}

/// Cache-transfer addressing for one leg of a disaggregated request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvTransferParams {
    pub do_remote_prefill: bool,
    pub do_remote_decode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_engine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub remote_block_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_handshake_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_notify_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_tp_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dp_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dp_rank: Option<u32>,
}

impl KvTransferParams {
    /// Prefill-leg params: this prefill will push its cache to `decode`.
    fn push_to(decode: &Instance) -> Self {
        Self {
            do_remote_prefill: false,
            do_remote_decode: true,
            remote_engine_id: Some(decode.id.clone()),
            remote_host: Some(decode.host.clone()),
            remote_port: Some(decode.port),
            remote_block_ids: Vec::new(),
            remote_handshake_port: Some(decode.handshake_port),
            remote_notify_port: Some(decode.notify_port),
            remote_tp_size: Some(decode.tp_size),
            remote_dp_size: Some(decode.dp_size),
            remote_dp_rank: Some(decode.dp_rank),
        }
    }

    /// Decode-leg params: pull cache from `prefill`, blocks `block_ids`.
    fn pull_from(prefill: &Instance, engine_id: String, block_ids: Vec<u32>) -> Self {
        Self {
            do_remote_prefill: true,
            do_remote_decode: false,
            remote_engine_id: Some(engine_id),
            remote_host: Some(prefill.host.clone()),
            remote_port: Some(prefill.port),
            remote_block_ids: block_ids,
            remote_handshake_port: Some(prefill.handshake_port),
            remote_notify_port: Some(prefill.notify_port),
            remote_tp_size: Some(prefill.tp_size),
            remote_dp_size: Some(prefill.dp_size),
            remote_dp_rank: Some(prefill.dp_rank),
        }
    }
}

/// JSON-serializable body for one scheduled leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub kv_transfer_params: KvTransferParams,
}

/// The prefill instance's reply, carrying its resolved engine id and the
/// cache blocks the decode instance must fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefillResponse {
    pub engine_id: String,
    pub block_ids: Vec<u32>,
    #[serde(default)]
    pub first_token: Option<i64>,
    /// Fraction of the instance's cache in use, reported with the reply.
    #[serde(default)]
    pub cache_utilization: Option<f32>,
}

/// Terminal reply from the decode instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeResponse {
    pub text: String,
    #[serde(default)]
    pub token_ids: Vec<i64>,
    #[serde(default)]
    pub cache_utilization: Option<f32>,
}

/// Transport seam; the HTTP calls themselves are out of scope.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn prefill(
        &self,
        instance: &Instance,
        body: InstanceRequest,
    ) -> anyhow::Result<PrefillResponse>;

    async fn decode(
        &self,
        instance: &Instance,
        body: InstanceRequest,
    ) -> anyhow::Result<DecodeResponse>;
}

#[derive(Debug, Clone)]
struct LegAssignment {
    prefill_id: String,
    /// Decode instance reserved at prefill time; holds a waiting slot until
    /// the decode leg is confirmed or the request rolls back.
    decode_candidate_id: String,
    decode_id: Option<String>,
}

/// Assigns each request a prefill and a decode instance and keeps the
/// per-instance running counters balanced: exactly one increment per
/// admission and one decrement per completion or failure.
pub struct DisaggRouter {
    registry: Arc<InstanceRegistry>,
    prefill_selector: Selector,
    decode_selector: Selector,
    inflight: Mutex<HashMap<RequestId, LegAssignment>>,
}

impl DisaggRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        prefill_selector: Selector,
        decode_selector: Selector,
    ) -> Self {
        Self {
            registry,
            prefill_selector,
            decode_selector,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Choose a prefill instance plus a candidate decode target and build
    /// the push-direction transfer params. Selection failure mutates
    /// nothing: counters and request state are untouched.
    pub fn schedule_prefill(
        &self,
        request: &SharedRequest,
    ) -> Result<(Instance, KvTransferParams), RouterError> {
        let id = request.read().expect("request lock poisoned").id().clone();

        let prefill_pool = self.registry.healthy_instances(InstanceRole::Prefill);
        let prefill = self
            .prefill_selector
            .select(&prefill_pool, &id)
            .ok_or(RouterError::NoHealthyInstance(InstanceRole::Prefill))?;

        let decode_pool = self.registry.healthy_instances(InstanceRole::Decode);
        let decode_candidate = self
            .decode_selector
            .select(&decode_pool, &id)
            .ok_or(RouterError::NoHealthyInstance(InstanceRole::Decode))?;

        let params = KvTransferParams::push_to(&decode_candidate);

        request
            .write()
            .expect("request lock poisoned")
            .mark_running(Instant::now());
        self.registry.incr_running(&prefill.id);
        // the candidate holds a waiting slot so least-loaded selection sees
        // the pending hand-off
        self.registry.incr_waiting(&decode_candidate.id);
        self.inflight.lock().expect("inflight lock poisoned").insert(
            id.clone(),
            LegAssignment {
                prefill_id: prefill.id.clone(),
                decode_candidate_id: decode_candidate.id.clone(),
                decode_id: None,
            },
        );

        tracing::debug!(
            request_id = %id,
            prefill_instance = %prefill.id,
            decode_candidate = %decode_candidate.id,
            "scheduled prefill leg"
        );
        Ok((prefill, params))
    }

    /// Confirm a decode instance from the prefill reply and build the
    /// pull-direction transfer params referencing the prefill instance.
    pub fn schedule_decode(
        &self,
        request: &SharedRequest,
        prefill_response: &PrefillResponse,
    ) -> Result<(Instance, KvTransferParams), RouterError> {
        let id = request.read().expect("request lock poisoned").id().clone();

        let (prefill_id, candidate_id) = {
            let inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight
                .get(&id)
                .map(|leg| (leg.prefill_id.clone(), leg.decode_candidate_id.clone()))
                .ok_or_else(|| RouterError::UnknownRequest(id.clone()))?
        };
        let prefill = self
            .registry
            .get(&prefill_id)
            .ok_or(RouterError::NoHealthyInstance(InstanceRole::Prefill))?;

        // release the reservation before selecting, so the final pick sees
        // accurate load
        self.registry.decr_waiting(&candidate_id);
        let decode_pool = self.registry.healthy_instances(InstanceRole::Decode);
        let decode = match self.decode_selector.select(&decode_pool, &id) {
            Some(decode) => decode,
            None => {
                // put the reservation back; the caller rolls back
                self.registry.incr_waiting(&candidate_id);
                return Err(RouterError::NoHealthyInstance(InstanceRole::Decode));
            }
        };

        let params = KvTransferParams::pull_from(
            &prefill,
            prefill_response.engine_id.clone(),
            prefill_response.block_ids.clone(),
        );

        // prefill leg is done; the request now waits for the cache pull
        request
            .write()
            .expect("request lock poisoned")
            .transition(RequestState::WaitingKvCache);
        self.registry.decr_running(&prefill_id);
        self.registry.incr_running(&decode.id);
        if let Some(utilization) = prefill_response.cache_utilization {
            self.registry.set_cache_utilization(&prefill_id, utilization);
        }
        if let Some(leg) = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .get_mut(&id)
        {
            leg.decode_id = Some(decode.id.clone());
        }

        tracing::debug!(
            request_id = %id,
            prefill_instance = %prefill_id,
            decode_instance = %decode.id,
            "scheduled decode leg"
        );
        Ok((decode, params))
    }

    /// The remote cache pull completed; the request is executing on the
    /// decode instance.
    pub fn mark_transfer_complete(&self, request: &SharedRequest) {
        request
            .write()
            .expect("request lock poisoned")
            .transition(RequestState::Running);
    }

    /// Release the decode instance's counter and clear leg bookkeeping.
    pub fn request_finished(&self, id: &str) -> bool {
        let leg = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(id);
        match leg {
            Some(LegAssignment {
                decode_id: Some(decode_id),
                ..
            }) => {
                self.registry.decr_running(&decode_id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Roll a request back to queue-eligibility after a transport failure,
    /// undoing its counter contribution. The caller decides whether to
    /// re-queue.
    fn rollback(&self, request: &SharedRequest, id: &str) {
        let leg = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(id);
        if let Some(leg) = leg {
            match leg.decode_id {
                Some(decode_id) => self.registry.decr_running(&decode_id),
                None => {
                    // failed before the decode leg: release both the prefill
                    // slot and the candidate's reservation
                    self.registry.decr_running(&leg.prefill_id);
                    self.registry.decr_waiting(&leg.decode_candidate_id);
                }
            }
        }
        let now = Instant::now();
        let mut req = request.write().expect("request lock poisoned");
        // a failed decode leg leaves the request parked on the cache
        // transfer; put it back on the running edge first
        if req.state() == RequestState::WaitingKvCache {
            req.transition(RequestState::Running);
        }
        // forcibly suspend and immediately resume: the request lands back in
        // the queue-eligible Waiting state
        if req.preempt(PreemptionReason::Timeout, now) {
            req.resume(now);
        }
    }
}

/// Composes the two routing legs into one end-to-end operation.
pub struct Orchestrator {
    router: Arc<DisaggRouter>,
    client: Arc<dyn InstanceClient>,
}

/// Optional hook invoked between the prefill and decode phases.
pub type PhaseHook = Box<dyn FnOnce(&PrefillResponse) + Send>;

impl Orchestrator {
    pub fn new(router: Arc<DisaggRouter>, client: Arc<dyn InstanceClient>) -> Self {
        Self { router, client }
    }

    /// Run a request through prefill and decode, returning the decode
    /// instance's terminal response.
    pub async fn process(
        &self,
        request: &SharedRequest,
        hook: Option<PhaseHook>,
    ) -> Result<DecodeResponse, RouterError> {
        let (id, prompt, max_tokens) = {
            let req = request.read().expect("request lock poisoned");
            (req.id().clone(), req.prompt().to_string(), req.max_tokens())
        };

        let (prefill_instance, prefill_params) = self.router.schedule_prefill(request)?;

        // the prefill leg produces exactly one token plus the cache state
        let prefill_body = InstanceRequest {
            prompt: prompt.clone(),
            max_tokens: 1,
            kv_transfer_params: prefill_params,
        };
        let prefill_response = match self.client.prefill(&prefill_instance, prefill_body).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "prefill leg failed");
                self.router.rollback(request, &id);
                return Err(RouterError::PrefillFailed(e.to_string()));
            }
        };

        if let Some(hook) = hook {
            hook(&prefill_response);
        }

        let (decode_instance, decode_params) =
            match self.router.schedule_decode(request, &prefill_response) {
                Ok(pair) => pair,
                Err(e) => {
                    self.router.rollback(request, &id);
                    return Err(e);
                }
            };

        let decode_body = InstanceRequest {
            prompt,
            max_tokens,
            kv_transfer_params: decode_params,
        };
        let decode_response = match self.client.decode(&decode_instance, decode_body).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "decode leg failed");
                self.router.rollback(request, &id);
                return Err(RouterError::DecodeFailed(e.to_string()));
            }
        };

        // a decode reply implies the cache transfer completed
        self.router.mark_transfer_complete(request);
        if let Some(utilization) = decode_response.cache_utilization {
            self.router
                .registry
                .set_cache_utilization(&decode_instance.id, utilization);
        }
        self.router.request_finished(&id);
        Ok(decode_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::selector::SelectionPolicy;

    fn registry() -> Arc<InstanceRegistry> {
        let registry = Arc::new(InstanceRegistry::new());
        registry.register(
            Instance::new("prefill-0", InstanceRole::Prefill, "10.0.0.1", 8000)
                .with_transfer_ports(9000, 9001),
        );
        registry.register(
            Instance::new("decode-0", InstanceRole::Decode, "10.0.0.2", 8100)
                .with_transfer_ports(9100, 9101)
                .with_parallelism(2, 1, 0),
        );
        registry
    }

    fn router(registry: Arc<InstanceRegistry>) -> DisaggRouter {
        DisaggRouter::new(
            registry,
            Selector::new(SelectionPolicy::RoundRobin),
            Selector::new(SelectionPolicy::LeastLoaded),
        )
    }

    fn request(id: &str) -> SharedRequest {
        Request::new(id, "the prompt", 32).shared()
    }

    #[test]
    fn test_prefill_leg_declares_push_target() {
        let registry = registry();
        let router = router(registry.clone());
        let req = request("r0");

        let (instance, params) = router.schedule_prefill(&req).unwrap();
        assert_eq!(instance.id, "prefill-0");
        assert!(params.do_remote_decode);
        assert!(!params.do_remote_prefill);
        assert_eq!(params.remote_host.as_deref(), Some("10.0.0.2"));
        assert_eq!(params.remote_port, Some(8100));
        assert_eq!(req.read().unwrap().state(), RequestState::Running);
        assert_eq!(registry.get("prefill-0").unwrap().running, 1);
        // the candidate holds a waiting reservation until the decode leg
        let decode = registry.get("decode-0").unwrap();
        assert_eq!(decode.running, 0);
        assert_eq!(decode.waiting, 1);
    }

    #[test]
    fn test_transfer_params_directionality_round_trip() {
        let registry = registry();
        let router = router(registry.clone());
        let req = request("r0");

        let (_, prefill_params) = router.schedule_prefill(&req).unwrap();
        let prefill_response = PrefillResponse {
            engine_id: "engine-uuid-7".to_string(),
            block_ids: vec![3, 4, 5],
            first_token: Some(11),
            cache_utilization: Some(0.4),
        };
        let (decode_instance, decode_params) =
            router.schedule_decode(&req, &prefill_response).unwrap();

        assert_eq!(decode_instance.id, "decode-0");
        // the decode leg pulls from the prefill instance, never the reverse
        assert!(decode_params.do_remote_prefill);
        assert!(!decode_params.do_remote_decode);
        assert_eq!(decode_params.remote_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(decode_params.remote_port, Some(8000));
        assert_eq!(decode_params.remote_handshake_port, Some(9000));
        assert_eq!(decode_params.remote_block_ids, vec![3, 4, 5]);
        assert_eq!(decode_params.remote_engine_id.as_deref(), Some("engine-uuid-7"));
        assert_ne!(prefill_params.remote_host, decode_params.remote_host);

        // counters moved from prefill to decode and the reservation cleared
        let prefill_inst = registry.get("prefill-0").unwrap();
        assert_eq!(prefill_inst.running, 0);
        assert_eq!(prefill_inst.cache_utilization, 0.4);
        let decode_inst = registry.get("decode-0").unwrap();
        assert_eq!(decode_inst.running, 1);
        assert_eq!(decode_inst.waiting, 0);
        assert_eq!(req.read().unwrap().state(), RequestState::WaitingKvCache);
    }

    #[test]
    fn test_all_unhealthy_returns_error_without_mutation() {
        let registry = registry();
        registry.record_health("prefill-0", false, Instant::now());
        registry.record_health("decode-0", false, Instant::now());
        let router = router(registry.clone());
        let req = request("r0");

        let err = router.schedule_prefill(&req).unwrap_err();
        assert!(matches!(
            err,
            RouterError::NoHealthyInstance(InstanceRole::Prefill)
        ));
        assert_eq!(req.read().unwrap().state(), RequestState::Waiting);
        assert_eq!(registry.get("prefill-0").unwrap().running, 0);
        assert_eq!(registry.get("decode-0").unwrap().running, 0);
    }

    #[test]
    fn test_no_decode_candidate_fails_before_any_mutation() {
        let registry = registry();
        registry.record_health("decode-0", false, Instant::now());
        let router = router(registry.clone());
        let req = request("r0");

        let err = router.schedule_prefill(&req).unwrap_err();
        assert!(matches!(
            err,
            RouterError::NoHealthyInstance(InstanceRole::Decode)
        ));
        assert_eq!(registry.get("prefill-0").unwrap().running, 0);
        assert_eq!(req.read().unwrap().state(), RequestState::Waiting);
    }

    #[test]
    fn test_request_finished_releases_decode_counter() {
        let registry = registry();
        let router = router(registry.clone());
        let req = request("r0");

        router.schedule_prefill(&req).unwrap();
        let resp = PrefillResponse {
            engine_id: "e".to_string(),
            block_ids: vec![1],
            first_token: None,
            cache_utilization: None,
        };
        router.schedule_decode(&req, &resp).unwrap();
        assert_eq!(registry.get("decode-0").unwrap().running, 1);

        assert!(router.request_finished("r0"));
        assert_eq!(registry.get("decode-0").unwrap().running, 0);
        assert!(!router.request_finished("r0"));
    }

    #[test]
    fn test_prefill_failure_releases_decode_reservation() {
        let registry = registry();
        let router = router(registry.clone());
        let req = request("r0");

        router.schedule_prefill(&req).unwrap();
        assert_eq!(registry.get("decode-0").unwrap().waiting, 1);

        router.rollback(&req, "r0");
        let decode = registry.get("decode-0").unwrap();
        assert_eq!(decode.waiting, 0);
        assert_eq!(registry.get("prefill-0").unwrap().running, 0);
        assert_eq!(req.read().unwrap().state(), RequestState::Waiting);
    }

    struct StubClient {
        fail_prefill: bool,
    }

    #[async_trait]
    impl InstanceClient for StubClient {
        async fn prefill(
            &self,
            _instance: &Instance,
            body: InstanceRequest,
        ) -> anyhow::Result<PrefillResponse> {
            if self.fail_prefill {
                anyhow::bail!("connection refused");
            }
            assert_eq!(body.max_tokens, 1);
            Ok(PrefillResponse {
                engine_id: "engine-0".to_string(),
                block_ids: vec![10, 11],
                first_token: Some(7),
                cache_utilization: Some(0.25),
            })
        }

        async fn decode(
            &self,
            _instance: &Instance,
            body: InstanceRequest,
        ) -> anyhow::Result<DecodeResponse> {
            assert!(body.kv_transfer_params.do_remote_prefill);
            Ok(DecodeResponse {
                text: "generated".to_string(),
                token_ids: vec![7, 8, 9],
                cache_utilization: Some(0.6),
            })
        }
    }

    #[tokio::test]
    async fn test_orchestrator_end_to_end() {
        let registry = registry();
        let router = Arc::new(router(registry.clone()));
        let client = Arc::new(StubClient { fail_prefill: false });
        let orchestrator = Orchestrator::new(router.clone(), client);

        let req = request("r0");
        let (hook_tx, hook_rx) = std::sync::mpsc::channel();
        let hook: PhaseHook = Box::new(move |resp: &PrefillResponse| {
            hook_tx.send(resp.engine_id.clone()).unwrap();
        });

        let resp = orchestrator.process(&req, Some(hook)).await.unwrap();
        assert_eq!(resp.text, "generated");
        assert_eq!(hook_rx.try_recv().unwrap(), "engine-0");
        assert_eq!(req.read().unwrap().state(), RequestState::Running);

        // all counters released at the end, utilization reports applied
        let prefill_inst = registry.get("prefill-0").unwrap();
        assert_eq!(prefill_inst.running, 0);
        assert_eq!(prefill_inst.cache_utilization, 0.25);
        let decode_inst = registry.get("decode-0").unwrap();
        assert_eq!(decode_inst.running, 0);
        assert_eq!(decode_inst.waiting, 0);
        assert_eq!(decode_inst.cache_utilization, 0.6);
    }

    #[tokio::test]
    async fn test_orchestrator_rolls_back_on_prefill_failure() {
        let registry = registry();
        let router = Arc::new(router(registry.clone()));
        let client = Arc::new(StubClient { fail_prefill: true });
        let orchestrator = Orchestrator::new(router.clone(), client);

        let req = request("r0");
        let err = orchestrator.process(&req, None).await.unwrap_err();
        assert!(matches!(err, RouterError::PrefillFailed(_)));

        // the request is queue-eligible again and counters are balanced
        assert_eq!(req.read().unwrap().state(), RequestState::Waiting);
        assert_eq!(registry.get("prefill-0").unwrap().running, 0);
        let decode = registry.get("decode-0").unwrap();
        assert_eq!(decode.running, 0);
        assert_eq!(decode.waiting, 0);
    }

    #[test]
    fn test_transfer_params_wire_field_names() {
        let registry = registry();
        let router = router(registry);
        let req = request("r0");
        let (_, params) = router.schedule_prefill(&req).unwrap();

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["do_remote_decode"], true);
        assert_eq!(value["remote_host"], "10.0.0.2");
        assert_eq!(value["remote_tp_size"], 2);
        // empty block list is omitted on the prefill leg
        assert!(value.get("remote_block_ids").is_none());
    }
}
