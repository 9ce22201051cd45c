use clap::{Parser, Subcommand};
use previewctl_common::args::PostgresArgs;

#[derive(Parser, Debug)]
#[command(name = "previewctl-api")]
#[command(about = "Preview-environment control plane API")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API, the stale/wake server, and the background controllers.
    Serve(ServeArgs),
    /// Apply embedded SQL migrations and exit.
    Migrate(MigrateArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct MigrateArgs {
    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Port for the primary HTTP API.
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Port for the secondary stale/wake server (§6.2).
    #[arg(long, env = "STALE_SERVER_PORT", default_value_t = 9090)]
    pub stale_server_port: u16,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub forge_app: ForgeAppArgs,

    #[clap(flatten)]
    pub oauth: OAuthArgs,

    #[clap(flatten)]
    pub encryption: EncryptionArgs,

    #[clap(flatten)]
    pub billing: BillingArgs,

    #[clap(flatten)]
    pub cluster: ClusterArgs,

    #[clap(flatten)]
    pub frontend: FrontendArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ForgeAppArgs {
    #[arg(long, env = "GITHUB_APP_ID")]
    pub app_id: String,

    /// Path to the GitHub App's private key PEM file.
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY_PATH")]
    pub private_key_path: String,

    #[arg(long, env = "GITHUB_WEBHOOK_SECRET")]
    pub webhook_secret: String,
}

#[derive(Parser, Debug, Clone)]
pub struct OAuthArgs {
    #[arg(long, env = "GITHUB_OAUTH_CLIENT_ID")]
    pub client_id: String,

    #[arg(long, env = "GITHUB_OAUTH_CLIENT_SECRET")]
    pub client_secret: String,

    #[arg(long, env = "AUTH_JWT_SECRET")]
    pub jwt_secret: String,

    #[arg(long, env = "ALLOWED_ORIGIN")]
    pub allowed_origin: String,
}

#[derive(Parser, Debug, Clone)]
pub struct EncryptionArgs {
    /// Hex-encoded 32-byte key used for env-var values.
    #[arg(long, env = "ENV_VAR_ENCRYPTION_KEY")]
    pub env_var_key: String,

    /// Hex-encoded 32-byte key used for private-registry credentials.
    #[arg(long, env = "REGISTRY_CRED_ENCRYPTION_KEY")]
    pub registry_cred_key: String,
}

#[derive(Parser, Debug, Clone)]
pub struct BillingArgs {
    #[arg(long, env = "STRIPE_SECRET_KEY")]
    pub stripe_secret_key: Option<String>,

    #[arg(long, env = "STRIPE_WEBHOOK_SECRET")]
    pub stripe_webhook_secret: Option<String>,

    #[arg(long, env = "STRIPE_STANDARD_PRODUCT_ID")]
    pub standard_product_id: Option<String>,

    #[arg(long, env = "STRIPE_PROFESSIONAL_PRODUCT_ID")]
    pub professional_product_id: Option<String>,

    /// Owners that get the raised (10) Standard active-environment limit.
    #[arg(long, env = "FRIEND_OWNERS", value_delimiter = ',')]
    pub friend_owners: Vec<String>,

    /// Owners blocked from dispatching any webhook (§9 owner block list).
    #[arg(long, env = "BLOCKED_OWNERS", value_delimiter = ',')]
    pub blocked_owners: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ClusterArgs {
    /// `minikube` or `eks`; only used for human-facing banners/logging.
    #[arg(long, env = "CLUSTER_KIND", default_value = "minikube")]
    pub kind: String,

    #[arg(long, env = "CLUSTER_DOMAIN")]
    pub domain: String,

    #[arg(long, env = "INTERNAL_REGISTRY_URL")]
    pub internal_registry_url: String,

    #[arg(long, env = "INGRESS_NAMESPACE", default_value = "ingress-nginx")]
    pub ingress_namespace: String,

    #[arg(long, env = "INGRESS_SERVICE_NAME", default_value = "ingress-nginx-controller")]
    pub ingress_service_name: String,

    #[arg(long, env = "DEFAULT_PULL_SECRET_NAME", default_value = "")]
    pub pull_secret_name: String,
}

#[derive(Parser, Debug, Clone)]
pub struct FrontendArgs {
    #[arg(long, env = "FRONTEND_URL")]
    pub frontend_url: String,
}
