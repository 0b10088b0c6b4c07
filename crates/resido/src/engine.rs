//! Composition root.
//!
//! [`Engine::new`] wires repositories, the dispatcher, processors, event
//! subscribers and the HTTP router from an [`EngineParts`]. Stores are
//! in-memory; the seams they sit behind are the traits in each module.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{self, ApiState};
use crate::audit::AuditTrail;
use crate::auth::{
    Authenticator, ContextState, DisabledIdentityProvider, HttpIdentityProvider, IdentityError,
    IdentityProvider, InMemoryUserDirectory, TenantKeyring, TokenIssuer, UserLookup,
};
use crate::clock::{self, Clock, SharedClock};
use crate::config::{
    AppConfig, AuthConfig, DispatcherConfig, NotificationConfig, ProcessConfig, ReconciliationConfig,
};
use crate::dispatch::{
    InMemoryBroker, PeriodicTable, ProcessorRegistry, ScheduleIntervals, Scheduler, TaskDispatcher,
    TaskWorker, WorkerContext, WorkerPool,
};
use crate::events::EventBus;
use crate::features::{codes, FeatureGate, Module, PermissionCatalog, PlanModuleComposition};
use crate::ids::PlanId;
use crate::notifications::{
    InMemoryNotificationStore, LoggingTransport, NotificationDeliveryProcessor,
    NotificationDispatcher, NotificationTransport, RefundNotificationProducer,
};
use crate::payments::gateway::{DeadlineGateway, GatewayError};
use crate::payments::{
    BillRefundProcessor, GatewayRouter, InMemoryPaymentRepository, PaymentGateway, PaymentService,
    ReconciliationProcessor, RefundOrchestrator, RefundProcessWatcher, RefundRequestService,
    SimulatedGateway, TransactionReconciler,
};
use crate::process::{InMemoryProcessRepository, ProcessRegistry, StaleSweepProcessor};
use crate::tenancy::{NewTenant, Tenant, TenantContext, TenantDirectory, TenantResolver, TenancyError};

const DEFAULT_PUBLIC_DOMAIN: &str = "admin.resido.local";
const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("{0} does not fit a signed duration")]
    Duration(&'static str),
}

/// Replaceable inputs of an [`Engine`].
pub struct EngineParts {
    pub public_domain: String,
    pub clock: SharedClock,
    pub gateways: GatewayRouter,
    pub identity: Arc<dyn IdentityProvider>,
    pub transport: Arc<dyn NotificationTransport>,
    pub processes: ProcessConfig,
    pub dispatcher: DispatcherConfig,
    pub reconciliation: ReconciliationConfig,
    pub notifications: NotificationConfig,
    pub auth: AuthConfig,
    gateway_timeout: Duration,
}

impl EngineParts {
    /// Defaults with a simulated card processor and a logging transport.
    pub fn in_memory(clock: SharedClock) -> Self {
        let timeout = crate::config::GatewayConfig::default().timeout;
        let simulated: Arc<dyn PaymentGateway> = Arc::new(SimulatedGateway::new());
        Self {
            public_domain: DEFAULT_PUBLIC_DOMAIN.to_string(),
            clock,
            gateways: GatewayRouter::new(Arc::new(DeadlineGateway::new(simulated, timeout))),
            identity: Arc::new(DisabledIdentityProvider),
            transport: Arc::new(LoggingTransport),
            processes: ProcessConfig::default(),
            dispatcher: DispatcherConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            notifications: NotificationConfig::default(),
            auth: AuthConfig::default(),
            gateway_timeout: timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, EngineError> {
        let identity: Arc<dyn IdentityProvider> = match (
            &config.auth.introspection_url,
            &config.auth.client_id,
            &config.auth.client_secret,
        ) {
            (Some(url), Some(client_id), Some(secret)) => Arc::new(HttpIdentityProvider::new(
                url.clone(),
                client_id.clone(),
                secret.clone(),
                INTROSPECTION_TIMEOUT,
            )?),
            _ => Arc::new(DisabledIdentityProvider),
        };

        Ok(Self {
            public_domain: DEFAULT_PUBLIC_DOMAIN.to_string(),
            clock: clock::system(),
            gateways: GatewayRouter::from_config(&config.gateway)?,
            identity,
            transport: Arc::new(LoggingTransport),
            processes: config.processes.clone(),
            dispatcher: config.dispatcher.clone(),
            reconciliation: config.reconciliation.clone(),
            notifications: config.notifications.clone(),
            auth: config.auth.clone(),
            gateway_timeout: config.gateway.timeout,
        })
    }

    /// Routes card and ACH traffic to `gateway`, behind the call deadline.
    pub fn with_card_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways = GatewayRouter::new(Arc::new(DeadlineGateway::new(gateway, self.gateway_timeout)));
        self
    }

    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_public_domain(mut self, domain: impl Into<String>) -> Self {
        self.public_domain = domain.into();
        self
    }
}

/// Every long-lived component of a running engine.
pub struct Engine {
    pub clock: SharedClock,
    pub directory: Arc<TenantDirectory>,
    pub keyring: Arc<TenantKeyring>,
    pub users: Arc<InMemoryUserDirectory>,
    pub authenticator: Arc<Authenticator>,
    pub features: Arc<FeatureGate>,
    pub permissions: Arc<PermissionCatalog>,
    pub events: Arc<EventBus>,
    pub audit: Arc<AuditTrail>,
    pub registry: Arc<ProcessRegistry>,
    pub broker: Arc<InMemoryBroker>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub processors: Arc<ProcessorRegistry>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundOrchestrator>,
    pub refund_requests: Arc<RefundRequestService>,
    pub reconciler: Arc<TransactionReconciler>,
    pub notifications: Arc<NotificationDispatcher>,
    pub scheduler: Arc<Scheduler>,
    default_plan: PlanId,
    intervals: ScheduleIntervals,
    stale_threshold: chrono::Duration,
    dispatcher_config: DispatcherConfig,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Result<Self, EngineError> {
        let clock = parts.clock.clone();
        let stale_threshold = chrono::Duration::from_std(parts.processes.running_threshold)
            .map_err(|_| EngineError::Duration("running threshold"))?;

        let directory = Arc::new(TenantDirectory::new(&parts.public_domain, clock.clone()));
        let keyring = Arc::new(TenantKeyring::new());
        let users = Arc::new(InMemoryUserDirectory::default());
        let issuer = Arc::new(TokenIssuer::new(keyring.clone(), clock.clone(), parts.auth.access_token_ttl));
        let authenticator = Arc::new(Authenticator::new(
            parts.identity.clone(),
            issuer,
            users.clone() as Arc<dyn UserLookup>,
        ));

        let features = Arc::new(FeatureGate::new(clock.clone()));
        let default_plan = seed_default_plan(&features);
        let permissions = Arc::new(PermissionCatalog::default());

        let events = Arc::new(EventBus::new());
        let audit = Arc::new(AuditTrail::new(clock.clone()));
        events.subscribe(audit.clone());

        let registry = Arc::new(ProcessRegistry::new(
            Arc::new(InMemoryProcessRepository::new()),
            events.clone(),
            clock.clone(),
        ));
        let broker = Arc::new(InMemoryBroker::new(clock.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            registry.clone(),
            broker.clone(),
            &parts.dispatcher,
        ));

        let payment_repository = Arc::new(InMemoryPaymentRepository::new());
        let payments = Arc::new(PaymentService::new(
            payment_repository.clone(),
            parts.gateways.clone(),
            clock.clone(),
        ));
        let refunds = Arc::new(RefundOrchestrator::new(
            payment_repository.clone(),
            parts.gateways.clone(),
            events.clone(),
            clock.clone(),
        ));
        events.subscribe(Arc::new(RefundProcessWatcher::new(refunds.clone())));
        let refund_requests = Arc::new(RefundRequestService::new(
            payment_repository.clone(),
            dispatcher.clone(),
            refunds.clone(),
            clock.clone(),
        ));
        let reconciler = Arc::new(TransactionReconciler::new(
            payment_repository,
            parts.gateways.clone(),
            refunds.clone(),
            events.clone(),
            clock.clone(),
            parts.reconciliation.window,
        ));

        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::new(InMemoryNotificationStore::new()),
            parts.transport.clone(),
            events.clone(),
            clock.clone(),
            &parts.notifications,
        ));
        events.subscribe(Arc::new(RefundNotificationProducer::new(
            notifications.clone(),
            users.clone() as Arc<dyn UserLookup>,
        )));

        let mut processors = ProcessorRegistry::new();
        processors
            .register(Arc::new(BillRefundProcessor::new(refunds.clone())))
            .register(Arc::new(ReconciliationProcessor::new(reconciler.clone())))
            .register(Arc::new(NotificationDeliveryProcessor::new(notifications.clone())))
            .register(Arc::new(StaleSweepProcessor::new(registry.clone(), stale_threshold)));

        let scheduler = Arc::new(Scheduler::new(
            Arc::new(PeriodicTable::new(clock.clone())),
            directory.clone(),
            dispatcher.clone(),
            clock.clone(),
        ));

        let intervals = ScheduleIntervals {
            reconciliation: parts.reconciliation.interval,
            notifications: parts.notifications.interval,
            sweep: parts.processes.sweep_interval,
        };

        let started_at = clock.now();
        tracing::info!(
            processors = ?processors.registered(),
            public_domain = %parts.public_domain,
            "engine assembled"
        );

        Ok(Self {
            clock,
            directory,
            keyring,
            users,
            authenticator,
            features,
            permissions,
            events,
            audit,
            registry,
            broker,
            dispatcher,
            processors: Arc::new(processors),
            payments,
            refunds,
            refund_requests,
            reconciler,
            notifications,
            scheduler,
            default_plan,
            intervals,
            stale_threshold,
            dispatcher_config: parts.dispatcher,
            started_at,
        })
    }

    /// Registers a tenant with a signing key, the default plan and its
    /// periodic task bindings.
    pub fn provision_tenant(&self, request: NewTenant) -> Result<Arc<Tenant>, TenancyError> {
        let tenant = self.directory.provision(request)?;
        self.keyring.ensure(tenant.id);
        self.features.subscribe(tenant.id, self.default_plan);
        self.scheduler.seed_tenant_tasks(tenant.id, self.intervals);
        Ok(tenant)
    }

    /// A tenant context for work outside a request, such as setup and tests.
    pub fn tenant_context(&self, tenant: Arc<Tenant>) -> TenantContext {
        self.directory.bind(tenant).context().clone()
    }

    pub fn default_plan(&self) -> PlanId {
        self.default_plan
    }

    pub fn router(&self) -> Router {
        let state = ApiState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            refunds: self.refund_requests.clone(),
            authenticator: self.authenticator.clone(),
            features: self.features.clone(),
            permissions: self.permissions.clone(),
            stale_threshold: self.stale_threshold,
            clock: self.clock.clone(),
            started_at: self.started_at,
        };
        let context = ContextState {
            resolver: self.directory.clone() as Arc<dyn TenantResolver>,
            authenticator: self.authenticator.clone(),
        };
        api::router(state, context)
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            processors: self.processors.clone(),
            resolver: self.directory.clone() as Arc<dyn TenantResolver>,
            max_attempts: self.dispatcher_config.max_attempts,
            retry_backoff: self.dispatcher_config.retry_backoff,
        }
    }

    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::new(self.worker_context(), self.dispatcher_config.worker_concurrency)
    }

    /// Runs every task currently visible on the broker on the calling task.
    /// Returns how many were handled.
    pub async fn run_due_tasks(&self) -> usize {
        let (worker, _shutdown_rx) = TaskWorker::new(self.worker_context(), "inline".to_string());
        let mut handled = 0;
        loop {
            match worker.run_once().await {
                Ok(Some(_)) => handled += 1,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "inline worker stopped on broker error");
                    break;
                }
            }
        }
        handled
    }

    /// Ticks the scheduler every `period` until the returned sender is
    /// signalled or dropped.
    pub fn spawn_scheduler(&self, period: Duration) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run(period, shutdown_rx).await });
        (handle, shutdown_tx)
    }
}

/// One plan carrying every module the engine gates its routes on.
fn seed_default_plan(features: &FeatureGate) -> PlanId {
    for (code, name) in [
        (codes::PAYMENTS, "Payments"),
        (codes::BILLING, "Billing"),
        (codes::PROCESSES, "Processes"),
    ] {
        features.upsert_module(Module {
            code: code.to_string(),
            name: name.to_string(),
            active: true,
        });
    }
    let plan = features.add_plan("Standard");
    for code in [codes::PAYMENTS, codes::BILLING, codes::PROCESSES] {
        features.set_composition(PlanModuleComposition {
            plan_id: plan.id,
            module_code: code.to_string(),
            submodule_code: None,
            active: true,
        });
    }
    plan.id
}
