//! Wires every collaborator into an `AppState`, builds the public/protected
//! router pair, and serves it alongside the background controllers and the
//! stale/wake server, following `meta/src/server.rs`'s shape.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use previewctl_cluster::KubeClusterDriver;
use previewctl_controller::Controllers;
use previewctl_core::ingestor::{owner_block_list, Dispatcher};
use previewctl_core::reclaim::{AccessLogTailer, StaleReclaimController, WakeOnRequest};
use previewctl_core::relaunch::RelaunchWatcher;
use previewctl_core::reconciler::BuildResultReconciler;
use previewctl_core::store::PgStore;
use previewctl_core::{builder::ImageBuilder, loader::ProjectLoader, quota::QuotaController, LifecycleOrchestrator};
use previewctl_forge::GithubForgeClient;
use tokio_util::sync::CancellationToken;

use crate::args::ServeArgs;
use crate::auth;
use crate::handlers;
use crate::state::AppState;

pub async fn run_server(args: ServeArgs) -> Result<()> {
    let pool = previewctl_common::postgres::create_pool(args.postgres).await;
    previewctl_core::migrate::run(&pool).await.context("failed to run database migrations")?;

    owner_block_list::init(args.billing.blocked_owners.clone());

    let store = Arc::new(PgStore::new(pool, args.encryption.registry_cred_key.clone()));

    let pem = std::fs::read_to_string(&args.forge_app.private_key_path)
        .context("failed to read GitHub App private key")?;
    let forge: Arc<dyn previewctl_forge::ForgeClient> =
        Arc::new(GithubForgeClient::new(args.forge_app.app_id.clone(), &pem).context("failed to build GitHub App client")?);

    let cluster: Arc<dyn previewctl_cluster::ClusterDriver> =
        Arc::new(KubeClusterDriver::try_default().await.context("failed to build kube client")?);

    let quota = QuotaController::new(store.clone(), store.clone());
    let loader = ProjectLoader::new(forge.clone(), args.cluster.domain.clone());
    let builder = ImageBuilder::new(forge.clone(), cluster.clone());

    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        quota,
        loader,
        builder,
        cluster.clone(),
        forge.clone(),
        args.cluster.internal_registry_url.clone(),
        args.cluster.pull_secret_name.clone(),
        args.frontend.frontend_url.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        args.forge_app.webhook_secret.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        orchestrator.clone(),
    ));

    let wake = Arc::new(WakeOnRequest::new(store.clone(), store.clone(), cluster.clone()));
    let access_log = previewctl_controller::access_log();

    let relaunch_quota = QuotaController::new(store.clone(), store.clone());
    let relaunch = RelaunchWatcher::new(store.clone(), relaunch_quota, forge.clone(), orchestrator.clone());

    let reclaim_quota = QuotaController::new(store.clone(), store.clone());
    let reclaim = StaleReclaimController::new(store.clone(), store.clone(), cluster.clone(), reclaim_quota, access_log.clone());

    let access_log_tailer = AccessLogTailer::new(cluster.clone(), access_log.clone());
    let reconciler = BuildResultReconciler::new(cluster.clone(), orchestrator.clone());

    let state = AppState {
        environments: store.clone(),
        services: store.clone(),
        env_vars: store.clone(),
        registry_creds: store.clone(),
        billing: store.clone(),
        event_log: store.clone(),
        permanent_branches: store.clone(),
        users: store.clone(),
        cluster: cluster.clone(),
        forge: forge.clone(),
        orchestrator: orchestrator.clone(),
        dispatcher,
        marketplace_webhook_secret: args.forge_app.webhook_secret.clone().into_bytes(),
        stripe_webhook_secret: args.billing.stripe_webhook_secret.clone().map(|s| s.into_bytes()),
        standard_product_id: args.billing.standard_product_id.clone(),
        professional_product_id: args.billing.professional_product_id.clone(),
        access_log: access_log.clone(),
        oauth: auth::oauth_config(&args.oauth),
        frontend_url: args.frontend.frontend_url.clone(),
    };

    let cancel = CancellationToken::new();

    Controllers { relaunch, reclaim, access_log_tailer, reconciler, wake: wake.clone() }.spawn(cancel.child_token());

    let stale_cancel = cancel.child_token();
    let stale_frontend_url = args.frontend.frontend_url.clone();
    let stale_port = args.stale_server_port;
    tokio::spawn(async move {
        if let Err(e) = previewctl_controller::run_stale_server(wake, stale_frontend_url, stale_port, stale_cancel).await {
            tracing::error!(error = %e, "stale/wake server exited");
        }
    });

    let cors = if args.oauth.allowed_origin == "*" {
        previewctl_common::cors::dev()
    } else {
        previewctl_common::cors::prod(&[args.oauth.allowed_origin.as_str()])
    };

    let public = Router::new()
        .route("/v2/health", get(handlers::health::health))
        .route("/v2/github/webhook", post(handlers::github::webhook))
        .route("/v2/github/marketplace/webhook", post(handlers::github::marketplace_webhook))
        .route("/v2/stripe/webhook", post(handlers::stripe::webhook))
        .route("/v2/auth/login", get(auth::login))
        .route("/v2/auth/callback", get(auth::callback))
        .route("/v2/auth/logout", get(auth::logout))
        .route("/v2/environments/{id}/public", get(handlers::environments::public))
        .route_layer(axum::middleware::from_fn(previewctl_common::access_log::public))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/v2/auth/profile", get(auth::profile))
        .route("/v2/github/user/organizations", get(handlers::github::user_organizations))
        .route("/v2/github/owner/{owner}/repos", get(handlers::github::owner_repos))
        .route("/v2/github/owner/{owner}/repos/{repo}/configure", post(handlers::github::configure_repo))
        .route(
            "/v2/owner/{owner}/registries",
            get(handlers::registries::list).post(handlers::registries::upsert),
        )
        .route("/v2/owner/{owner}/registries/{registry_host}", axum::routing::delete(handlers::registries::delete))
        .route(
            "/v2/owner/{owner}/repos/{repo}/variables",
            get(handlers::variables::list).post(handlers::variables::upsert),
        )
        .route(
            "/v2/owner/{owner}/repos/{repo}/permanent-branches",
            get(handlers::permanent_branches::list).post(handlers::permanent_branches::batch_upsert),
        )
        .route("/v2/environments", get(handlers::environments::list))
        .route("/v2/environments/{id}/logs/build", get(handlers::environments::build_logs))
        .route("/v2/environments/{id}/logs/live", get(handlers::environments::live_logs))
        .route("/v2/deploy", post(handlers::deploy::deploy))
        .route_layer(axum::middleware::from_fn(|req, next| previewctl_common::access_log::request("API", req, next)))
        .with_state(state);

    let app = public.merge(protected).layer(cors);

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    tracing::info!(%addr, "starting previewctl API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(previewctl_common::shutdown::shutdown_signal()).await?;
    cancel.cancel();
    tracing::info!("server stopped gracefully");
    Ok(())
}
