//! Admission control and request scheduling for a disaggregated LLM
//! serving deployment.

pub mod config;
pub mod engine;
pub mod instance;
pub mod queue;
pub mod request;
pub mod router;
pub mod scheduler;
pub mod selector;

pub use config::{ConfigError, InstancePoolConfig, PreemptionMode, ServeConfig};
pub use engine::{EngineStats, SchedulingEngine};
pub use instance::{HealthChecker, HealthProbe, Instance, InstanceRegistry, InstanceRole};
pub use queue::{PriorityRequestQueue, QueueError};
pub use request::{
    Priority, PreemptionReason, Request, RequestId, RequestState, SavedState, SharedRequest,
};
pub use router::{
    DecodeResponse, DisaggRouter, InstanceClient, InstanceRequest, KvTransferParams, Orchestrator,
    PhaseHook, PrefillResponse, RouterError,
};
pub use scheduler::{ScheduledSequence, Scheduler, SchedulerOutput};
pub use selector::{SelectionPolicy, Selector};
