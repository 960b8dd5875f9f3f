use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runway_server::api::{make_router, RateLimits, RouterState};
use runway_server::args::Args;
use runway_server::credentials::CredentialService;
use runway_server::crypto::Encryptor;
use runway_server::deployments::{spawn_workers, DeploymentEngine, WorkerContext};
use runway_server::docker::{DockerDriver, DockerOps};
use runway_server::environments::EnvironmentService;
use runway_server::events::EventBus;
use runway_server::notifier::{ChatSink, Notifier, NullSink, TelegramSink};
use runway_server::persistence::Persistence;
use runway_server::proxy::ProxyConfig;
use runway_server::supervisor::RecoverySupervisor;

const WORK_QUEUE_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    let encryptor = match args.master_key.as_deref() {
        Some(key) => Encryptor::from_hex_key(key)?,
        None => {
            warn!("MASTER_KEY unset, sensitive columns are stored in plaintext");
            Encryptor::disabled()
        }
    };

    let store = Persistence::from_url(&args.database_url, encryptor).await?;

    let driver: Arc<dyn DockerOps> = Arc::new(DockerDriver::new(&args.docker_socket_path)?);
    driver
        .ensure_swarm(args.docker_swarm_advertise_addr.as_deref())
        .await?;

    let bus = EventBus::new();
    let proxy_config = ProxyConfig {
        letsencrypt_email: args.letsencrypt_email.clone(),
        letsencrypt_staging: args.letsencrypt_staging,
    };

    let chat_sink: Arc<dyn ChatSink> = match args.chat_bot_token.clone() {
        Some(token) => Arc::new(TelegramSink::new(args.chat_api_base.clone(), token)),
        None => {
            warn!("CHAT_BOT_TOKEN unset, notifications and chat replies are dropped");
            Arc::new(NullSink)
        }
    };
    let _notifier = Notifier::new(store.clone(), Arc::clone(&chat_sink)).spawn(&bus);

    // Reconcile before the handler surface opens.
    if args.enable_deployment_recovery {
        let supervisor = RecoverySupervisor::new(
            store.clone(),
            Arc::clone(&driver),
            bus.clone(),
            proxy_config.clone(),
        );
        supervisor.reconcile().await?;
    } else {
        info!("deployment recovery disabled");
    }

    let (queue, receiver) = mpsc::channel(WORK_QUEUE_DEPTH);
    let _workers = spawn_workers(
        args.worker_pool_size,
        receiver,
        WorkerContext {
            store: store.clone(),
            driver: Arc::clone(&driver),
            bus: bus.clone(),
            proxy_config: proxy_config.clone(),
        },
    );

    let credentials = CredentialService::new(store.clone());
    let environments = EnvironmentService::new(
        store.clone(),
        Arc::clone(&driver),
        bus.clone(),
        args.nginx_container_name.clone(),
        proxy_config,
    );
    let engine = DeploymentEngine::new(
        store.clone(),
        Arc::clone(&driver),
        bus.clone(),
        queue.clone(),
    );

    let state = RouterState {
        store,
        credentials,
        environments,
        engine,
        limits: Arc::new(RateLimits::new(
            args.throttle_limit,
            Duration::from_secs(args.throttle_ttl),
        )),
        chat_sink,
        base_url: args.public_base_url.clone(),
    };

    let router = make_router(state);
    let address = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%address, "control plane listening");

    axum::Server::bind(&address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Dropping the queue sender lets the workers drain and exit; anything
    // still in flight is reconciled by the supervisor on next boot.
    drop(queue);

    Ok(())
}
