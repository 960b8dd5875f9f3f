use clap::Parser;

/// Every knob is a flag with an environment-variable fallback, so the
/// process runs unchanged under systemd, compose, or a bare shell.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Uri of the state database
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://runway.sqlite")]
    pub database_url: String,

    /// Port to bind the HTTP surface to
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Path to the Docker Engine socket
    #[arg(long, env = "DOCKER_SOCKET_PATH", default_value = "/var/run/docker.sock")]
    pub docker_socket_path: String,

    /// Address to advertise if this process has to initialise the swarm
    #[arg(long, env = "DOCKER_SWARM_ADVERTISE_ADDR")]
    pub docker_swarm_advertise_addr: Option<String>,

    /// Name of the shared reverse-proxy container attached to public
    /// environments
    #[arg(long, env = "NGINX_CONTAINER_NAME", default_value = "nginx_proxy")]
    pub nginx_container_name: String,

    /// Account email handed to the proxy's ACME companion
    #[arg(long, env = "LETSENCRYPT_EMAIL")]
    pub letsencrypt_email: Option<String>,

    /// Ask the ACME companion for staging certificates
    #[arg(long, env = "LETSENCRYPT_STAGING", default_value_t = false, action = clap::ArgAction::Set)]
    pub letsencrypt_staging: bool,

    /// Window of the default per-key rate limit, in seconds
    #[arg(long, env = "THROTTLE_TTL", default_value_t = 60)]
    pub throttle_ttl: u64,

    /// Requests allowed per key inside one window
    #[arg(long, env = "THROTTLE_LIMIT", default_value_t = 100)]
    pub throttle_limit: usize,

    /// Reconcile RUNNING deployments against the live swarm at boot
    #[arg(long, env = "ENABLE_DEPLOYMENT_RECOVERY", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_deployment_recovery: bool,

    /// Log filter, e.g. `info` or `runway_server=debug`
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Number of deployment workers consuming the job queue
    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = 4)]
    pub worker_pool_size: usize,

    /// Base url magic links are rendered against
    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "http://localhost:3000")]
    pub public_base_url: String,

    /// Bot token for the chat channel; notifications are dropped when unset
    #[arg(long, env = "CHAT_BOT_TOKEN")]
    pub chat_bot_token: Option<String>,

    /// Base url of the chat bot API
    #[arg(long, env = "CHAT_API_BASE", default_value = "https://api.telegram.org")]
    pub chat_api_base: String,

    /// Hex-encoded 32-byte key sealing sensitive columns; plaintext when
    /// unset
    #[arg(long, env = "MASTER_KEY")]
    pub master_key: Option<String>,
}
