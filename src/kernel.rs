//! `ServerKernel` is the single place request handlers and background loops
//! pull shared dependencies from — no ambient globals, lifecycle tied to
//! server start/stop.

use std::sync::Arc;

use crate::approval::ApprovalGate;
use crate::clock::Clock;
use crate::config::Config;
use crate::info_request::{Decryptor, InfoRequestChannel, XorStubDecryptor};
use crate::lease::LeaseManager;
use crate::log_bus::LogBus;
use crate::quota::QuotaMeter;
use crate::run_lifecycle::RunLifecycle;
use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Clone)]
pub struct ServerKernel {
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub bus: LogBus,
    pub approval_gate: ApprovalGate,
    pub quota_meter: QuotaMeter,
    pub lease_manager: LeaseManager,
    pub scheduler: Scheduler,
    pub run_lifecycle: RunLifecycle,
    pub info_requests: InfoRequestChannel,
    /// Fills the info-request response retrieval seam; swap for a real
    /// AEAD implementation at the deployment boundary without touching the
    /// core.
    pub decryptor: Arc<dyn Decryptor>,
    pub config: Config,
}

impl ServerKernel {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: Config) -> Self {
        let pool = store.pool().clone();
        let bus = LogBus::new();

        let approval_gate = ApprovalGate::new(pool.clone(), config.require_approval);
        let quota_meter = QuotaMeter::new(pool.clone());
        let lease_manager = LeaseManager::new(pool.clone(), bus.clone());
        let scheduler = Scheduler::new(pool.clone(), approval_gate.clone(), quota_meter.clone());
        let run_lifecycle = RunLifecycle::new(
            pool.clone(),
            bus.clone(),
            lease_manager.clone(),
            scheduler.clone(),
            config.default_retry_policy(),
        );
        let info_requests = InfoRequestChannel::new(pool.clone());

        Self {
            store,
            clock,
            bus,
            approval_gate,
            quota_meter,
            lease_manager,
            scheduler,
            run_lifecycle,
            info_requests,
            decryptor: Arc::new(XorStubDecryptor),
            config,
        }
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.default_claim_ttl_seconds)
    }
}
