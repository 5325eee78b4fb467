use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;

use session_gate::config::Config;
use session_gate::daemon;
use session_gate::security::session_token::{AuthPhase, NewSession};
use session_gate::utils;

#[derive(Parser)]
#[command(name = "session-gate", version, about = "Session token authority and edge gate")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "gate.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the edge gate (default)
    Serve {
        /// Listen port; overrides the config file
        #[arg(long)]
        port: Option<u16>,
    },
    /// Sign a session token and print it
    Issue {
        #[arg(long)]
        sub: String,
        #[arg(long)]
        nickname: String,
        #[arg(long, value_enum, default_value_t = PhaseArg::Full)]
        phase: PhaseArg,
    },
    /// Verify a token and print its claims
    Verify { token: String },
    /// Print the known signing key versions
    Keys,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    Full,
    PendingNickname,
    PendingSecondFactor,
}

impl From<PhaseArg> for AuthPhase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Full => AuthPhase::Full,
            PhaseArg::PendingNickname => AuthPhase::PendingNickname,
            PhaseArg::PendingSecondFactor => AuthPhase::PendingSecondFactor,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::load(&args.config)?;

    match args.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            info!("Starting session gate {} on port {port}", session_gate::VERSION);
            daemon::run(config, port).await?;
        }
        Commands::Issue {
            sub,
            nickname,
            phase,
        } => {
            let authority = daemon::build_authority(&config).await?;
            let token = authority
                .authority
                .sign(&NewSession {
                    sub,
                    nickname,
                    phase: phase.into(),
                })
                .await?;
            println!("{token}");
        }
        Commands::Verify { token } => {
            let authority = daemon::build_authority(&config).await?;
            let claims = authority.authority.verify(&token).await?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Commands::Keys => {
            let authority = daemon::build_authority(&config).await?;
            let cache = authority.authority.key_cache();
            let listing = json!({
                "latest_version": cache.latest_version().await,
                "versions": cache.versions().await,
            });
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }

    Ok(())
}
