use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatpay_agent::config::Config;
use chatpay_agent::dispatcher::Dispatcher;
use chatpay_agent::factory::{FactorySettings, SessionFactory};
use chatpay_agent::llm::LlmReasoner;
use chatpay_agent::mqtt::MqttTransport;
use chatpay_agent::prompt;
use chatpay_agent::registry::SessionRegistry;
use chatpay_agent::signing;
use chatpay_agent::transport::Transport;
use chatpay_agent::wallet_gateway::WalletGateway;
use chatpay_agent::wallet_store::FileWalletStore;

/// ChatPay Agent - wallet assistant that answers payment requests over chat
#[derive(Parser, Debug)]
#[command(name = "chatpay-agent", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "chatpay.toml")]
    config: String,

    /// Log level used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let mut config = Config::from_file(&args.config)?;
    config.apply_env();
    config.validate()?;

    let signer = signing::parse_signer(&signing::load_private_key(&config.agent.private_key_path)?)?;
    let transport = Arc::new(MqttTransport::new(&config.mqtt, signer));

    info!(
        identity = %transport.identity(),
        broker = %config.mqtt.broker,
        network_id = %config.wallet.network_id,
        "ChatPay agent starting"
    );

    let store = Arc::new(FileWalletStore::new(&config.storage.wallet_dir));
    let gateway = Arc::new(WalletGateway::new(&config.wallet)?);
    let reasoner = Arc::new(LlmReasoner::new(&config.llm)?);

    let factory = SessionFactory::new(
        store,
        gateway,
        FactorySettings {
            credential_name: config.wallet.credential_name.clone(),
            credential_key: config.wallet.credential_key.clone(),
            network_id: config.wallet.network_id.clone(),
            max_history_turns: config.sessions.max_history_turns,
        },
        prompt::system_instruction(&config.wallet),
    );
    let registry = SessionRegistry::with_capacity(config.sessions.max_sessions);

    let inbound = transport.subscribe_all().await?;
    let mut dispatcher = Dispatcher::new(transport, factory, reasoner, registry);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
        on_signal.cancel();
    });

    dispatcher
        .run(
            inbound,
            cancel,
            Duration::from_secs(config.dispatch.heartbeat_secs),
        )
        .await;

    info!(metrics = ?dispatcher.metrics(), "ChatPay agent stopped");
    Ok(())
}
