//! Sekretess business binary.
//!
//! # Usage
//!
//! ```bash
//! export BUSINESS_USER_NAME=acme
//! export SEKRETESS_BUSINESS_SERVER_URL=https://business.sekretess.io
//! export IDENTITY_PROVIDER_URL=https://auth.sekretess.io/realms/consumer/protocol/openid-connect/token
//!
//! # Direct message
//! sekretess-business send alice "Your order has shipped"
//!
//! # Broadcast to every subscriber
//! sekretess-business broadcast "20% off this weekend"
//!
//! # Forget the session with a consumer
//! sekretess-business delete-session alice
//! ```

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use sekretess_client::{ClientConfig, DEFAULT_CLIENT_ID, HttpServerChannel};
use sekretess_core::{
    DEFAULT_CONSUMER_DEVICE_ID, Dispatcher, DispatcherConfig, Persistence, RatchetEngine,
    RedbStorage, StoreInitializer, SystemEnv,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Sekretess business client
#[derive(Parser, Debug)]
#[command(name = "sekretess-business")]
#[command(about = "Send end-to-end encrypted messages and broadcasts as a Sekretess business")]
#[command(version)]
struct Args {
    /// Business name
    #[arg(long, env = "BUSINESS_USER_NAME")]
    name: String,

    /// Business device id
    #[arg(long, default_value_t = 1)]
    device_id: u32,

    /// Device id consumer sessions are keyed under
    #[arg(long, default_value_t = DEFAULT_CONSUMER_DEVICE_ID)]
    consumer_device_id: u32,

    /// Business server base URL
    #[arg(long, env = "SEKRETESS_BUSINESS_SERVER_URL")]
    server_url: String,

    /// Identity-provider token endpoint
    #[arg(long, env = "IDENTITY_PROVIDER_URL")]
    identity_provider_url: String,

    /// Identity-provider client id
    #[arg(long, default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// Identity-provider client secret
    #[arg(long, env = "SEKRETESS_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Path to the business database
    #[arg(long, env = "SEKRETESS_DB_PATH", default_value = "sekretess-business.redb")]
    db: PathBuf,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a direct message to a consumer
    Send {
        /// Consumer name
        consumer: String,
        /// Message text
        text: String,
    },

    /// Broadcast a message to every subscribed consumer
    Broadcast {
        /// Message text
        text: String,
    },

    /// Push the broadcast distribution message to a consumer
    DistributeKey {
        /// Consumer name
        consumer: String,
    },

    /// Delete the session with a consumer
    DeleteSession {
        /// Consumer name
        consumer: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let client_config = ClientConfig {
        server_url: args.server_url,
        identity_provider_url: args.identity_provider_url,
        client_id: args.client_id,
        client_secret: args.client_secret,
        request_timeout: Duration::from_secs(args.timeout_secs),
        ..ClientConfig::default()
    };
    let channel = HttpServerChannel::new(&client_config)?;

    let storage = RedbStorage::open(&args.db)?;
    tracing::info!(db = %args.db.display(), business = %args.name, "opened business store");

    let bridge = StoreInitializer::new(
        RatchetEngine::new(SystemEnv::new()),
        Persistence::from_backend(storage),
        SystemEnv::new(),
    )
    .initialize(&args.name, args.device_id)?;

    let dispatcher = Dispatcher::with_config(
        bridge,
        channel,
        DispatcherConfig { consumer_device_id: args.consumer_device_id },
    );

    let result = match &args.command {
        Command::Send { consumer, text } => dispatcher.send_message_to_consumer(text, consumer),
        Command::Broadcast { text } => dispatcher.send_ads_message(text),
        Command::DistributeKey { consumer } => {
            dispatcher.send_sender_key_distribution_message(consumer);
            Ok(())
        },
        Command::DeleteSession { consumer } => dispatcher.delete_user_session(consumer),
    };

    let drift = dispatcher.bridge().drift_count();
    if drift > 0 {
        tracing::warn!(drift, "durable state may lag in-memory state");
    }

    result?;
    Ok(())
}

