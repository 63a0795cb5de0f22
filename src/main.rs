use anyhow::Result;
use bridge_agent::{AgentArgs, AgentConfig, ControlSession, SessionExit};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "bridge-agent", version)]
#[clap(about = "Expose a local service through a bridge broker", long_about = None)]
struct Cli {
    /// エージェントID (環境変数 `id` が優先)
    #[clap(long)]
    id: Option<String>,

    /// エージェントのシークレット (環境変数 `secret` が優先)
    #[clap(long)]
    secret: Option<String>,

    /// ブローカーのURL (環境変数 `url` が優先)
    #[clap(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();
    let args = AgentArgs {
        id: cli.id,
        secret: cli.secret,
        url: cli.url,
    }
    .with_env_overrides(|key| std::env::var(key).ok());

    let config = AgentConfig::from_args(args)?;
    if config.agent_id.is_empty() || config.agent_secret.is_empty() {
        warn!("Agent id or secret is empty, the broker will likely reject the connection");
    }
    info!("Broker endpoint: {}", config.endpoint);

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match ControlSession::new(config).run(shutdown_rx).await? {
        SessionExit::Shutdown => {
            info!("Shutting down...");
        }
        SessionExit::Fatal(reason) => {
            std::process::exit(reason.exit_code());
        }
    }

    Ok(())
}
