use std::sync::Arc;

use previewctl_cluster::ClusterDriver;
use previewctl_core::ingestor::Dispatcher;
use previewctl_core::reclaim::AccessLog;
use previewctl_core::store::{
    BillingProvider, EnvVarProvider, EnvironmentsProvider, EventLog, PermanentBranchProvider,
    RegistryCredProvider, ServicesProvider, UsersProvider,
};
use previewctl_core::LifecycleOrchestrator;
use previewctl_forge::ForgeClient;

/// Shared application state, mirroring `eosin-meta`'s `AppState { pool }`
/// but widened to every `Arc<dyn Trait>` collaborator the teacher's server
/// would otherwise reach through a single pool handle.
#[derive(Clone)]
pub struct AppState {
    pub environments: Arc<dyn EnvironmentsProvider>,
    pub services: Arc<dyn ServicesProvider>,
    pub env_vars: Arc<dyn EnvVarProvider>,
    pub registry_creds: Arc<dyn RegistryCredProvider>,
    pub billing: Arc<dyn BillingProvider>,
    pub event_log: Arc<dyn EventLog>,
    pub permanent_branches: Arc<dyn PermanentBranchProvider>,
    pub users: Arc<dyn UsersProvider>,
    pub cluster: Arc<dyn ClusterDriver>,
    pub forge: Arc<dyn ForgeClient>,
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    pub marketplace_webhook_secret: Vec<u8>,
    pub stripe_webhook_secret: Option<Vec<u8>>,
    pub standard_product_id: Option<String>,
    pub professional_product_id: Option<String>,
    pub access_log: AccessLog,
    pub oauth: OAuthConfig,
    pub frontend_url: String,
}

#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub jwt_secret: String,
    pub allowed_origin: String,
}
