//! The service provisioning saga.
//!
//! Validate, allocate, configure, activate. Allocation, configuration and
//! activation have external side effects and declare themselves idempotent;
//! each carries a compensation that semantically undoes it (release,
//! deconfigure, deactivate).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::context::SagaContext;
use crate::definition::SagaDefinition;
use crate::step::{SagaStep, StepError, StepOutput};

/// Definition name registered for the provisioning saga.
pub const SERVICE_PROVISIONING: &str = "service_provisioning";

const KNOWN_PLANS: &[&str] = &["basic", "standard", "premium"];

/// External provisioning backend the saga steps talk to.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    async fn allocate(&self, plan: &str) -> Result<String, StepError>;
    async fn release(&self, allocation_id: &str) -> Result<(), StepError>;
    async fn configure(&self, allocation_id: &str, plan: &str) -> Result<String, StepError>;
    async fn deconfigure(&self, config_id: &str) -> Result<(), StepError>;
    async fn activate(&self, config_id: &str) -> Result<String, StepError>;
    async fn deactivate(&self, service_id: &str) -> Result<(), StepError>;
}

/// Builds the provisioning saga definition over the given backend.
pub fn service_provisioning_definition(
    service: Arc<dyn ProvisioningService>,
) -> SagaDefinition {
    SagaDefinition::new(SERVICE_PROVISIONING)
        .step(Arc::new(ValidateStep))
        .step(Arc::new(AllocateStep {
            service: service.clone(),
        }))
        .step(Arc::new(ConfigureStep {
            service: service.clone(),
        }))
        .step(Arc::new(ActivateStep { service }))
}

fn required<'a>(context: &'a SagaContext, key: &str) -> Result<&'a str, StepError> {
    context
        .get_str(key)
        .ok_or_else(|| StepError::new(format!("missing required context key '{key}'")))
}

/// Validates the requested plan. Pure check, nothing to undo.
struct ValidateStep;

#[async_trait]
impl SagaStep for ValidateStep {
    fn name(&self) -> &str {
        "validate"
    }

    async fn execute(&self, context: &SagaContext) -> Result<StepOutput, StepError> {
        let plan = required(context, "plan")?;
        if !KNOWN_PLANS.contains(&plan) {
            return Err(StepError::new(format!("unknown plan '{plan}'")));
        }
        Ok(StepOutput::with("plan_validated", json!(true)))
    }

    async fn compensate(&self, _context: &SagaContext) -> Result<(), StepError> {
        Ok(())
    }
}

/// Reserves capacity for the service.
struct AllocateStep {
    service: Arc<dyn ProvisioningService>,
}

#[async_trait]
impl SagaStep for AllocateStep {
    fn name(&self) -> &str {
        "allocate"
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, context: &SagaContext) -> Result<StepOutput, StepError> {
        let plan = required(context, "plan")?;
        let allocation_id = self.service.allocate(plan).await?;
        Ok(StepOutput::with("allocation_id", json!(allocation_id)))
    }

    async fn compensate(&self, context: &SagaContext) -> Result<(), StepError> {
        let allocation_id = required(context, "allocation_id")?;
        self.service.release(allocation_id).await
    }
}

/// Applies plan configuration to the allocation.
struct ConfigureStep {
    service: Arc<dyn ProvisioningService>,
}

#[async_trait]
impl SagaStep for ConfigureStep {
    fn name(&self) -> &str {
        "configure"
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, context: &SagaContext) -> Result<StepOutput, StepError> {
        let plan = required(context, "plan")?;
        let allocation_id = required(context, "allocation_id")?;
        let config_id = self.service.configure(allocation_id, plan).await?;
        Ok(StepOutput::with("config_id", json!(config_id)))
    }

    async fn compensate(&self, context: &SagaContext) -> Result<(), StepError> {
        let config_id = required(context, "config_id")?;
        self.service.deconfigure(config_id).await
    }
}

/// Switches the configured service live.
struct ActivateStep {
    service: Arc<dyn ProvisioningService>,
}

#[async_trait]
impl SagaStep for ActivateStep {
    fn name(&self) -> &str {
        "activate"
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, context: &SagaContext) -> Result<StepOutput, StepError> {
        let config_id = required(context, "config_id")?;
        let service_id = self.service.activate(config_id).await?;
        Ok(StepOutput::with("service_id", json!(service_id)))
    }

    async fn compensate(&self, context: &SagaContext) -> Result<(), StepError> {
        let service_id = required(context, "service_id")?;
        self.service.deactivate(service_id).await
    }
}

/// In-memory backend with per-call failure switches, for tests and demos.
#[derive(Default)]
pub struct InMemoryProvisioningService {
    pub fail_allocate: AtomicBool,
    pub fail_configure: AtomicBool,
    pub fail_activate: AtomicBool,
    pub fail_release: AtomicBool,
    counter: AtomicUsize,
    calls: std::sync::Mutex<Vec<String>>,
}

impl InMemoryProvisioningService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend call in invocation order, for assertions.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ProvisioningService for InMemoryProvisioningService {
    async fn allocate(&self, plan: &str) -> Result<String, StepError> {
        self.record(format!("allocate:{plan}"));
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(StepError::new("capacity exhausted"));
        }
        Ok(self.next_id("alloc"))
    }

    async fn release(&self, allocation_id: &str) -> Result<(), StepError> {
        self.record(format!("release:{allocation_id}"));
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StepError::new("release rejected"));
        }
        Ok(())
    }

    async fn configure(&self, allocation_id: &str, plan: &str) -> Result<String, StepError> {
        self.record(format!("configure:{allocation_id}:{plan}"));
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(StepError::new("configuration template missing"));
        }
        Ok(self.next_id("cfg"))
    }

    async fn deconfigure(&self, config_id: &str) -> Result<(), StepError> {
        self.record(format!("deconfigure:{config_id}"));
        Ok(())
    }

    async fn activate(&self, config_id: &str) -> Result<String, StepError> {
        self.record(format!("activate:{config_id}"));
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err(StepError::new("activation handshake failed"));
        }
        Ok(self.next_id("svc"))
    }

    async fn deactivate(&self, service_id: &str) -> Result<(), StepError> {
        self.record(format!("deactivate:{service_id}"));
        Ok(())
    }
}
