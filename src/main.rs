use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use fitcoach::constants::{self, DEFAULT_PORT, MISSING_KEY_NOTICE};
use fitcoach::web_server::{self, AppState, ServerConfig};
use fitcoach::{
    chat, CompletionClient, CompletionSettings, FitnessLevel, FitnessProfile, Goal, Injury,
    OpenAiClient, Preference, ProfileUpdate,
};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the fitness coach web UI.
    Start {
        #[arg(long, env = "FITCOACH_PORT", default_value_t = DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
        #[arg(long, env = "FITCOACH_HOST", default_value = "0.0.0.0", help = "Address to bind.")]
        host: IpAddr,
    },
    /// Chat with the coach in the terminal.
    Chat {
        #[arg(long, default_value = "Beginner", help = "Your current fitness level.")]
        level: FitnessLevel,
        #[arg(long = "goal", help = "A fitness goal (repeatable).")]
        goals: Vec<Goal>,
        #[arg(long = "injury", help = "An injury or limitation (repeatable).")]
        injuries: Vec<Injury>,
        #[arg(long = "preference", help = "A preferred workout type (repeatable).")]
        preferences: Vec<Preference>,
    },
}

/// Builds the completion client, or `None` when no API key is configured.
fn completion_client() -> Option<Arc<dyn CompletionClient>> {
    match CompletionSettings::from_env() {
        Ok(settings) => {
            info!(model = %settings.model, base_url = %settings.base_url, "Completion client configured");
            let client: Arc<dyn CompletionClient> = Arc::new(OpenAiClient::new(settings));
            Some(client)
        }
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for OPENAI_API_KEY and friends)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g. RUST_LOG=info,fitcoach=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!("fitcoach starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Start { port, host } => {
            let templates = web_server::create_minijinja_env(constants::TEMPLATES_DIR.as_str());
            let state = AppState::new(templates, completion_client());
            let config = ServerConfig {
                host,
                port,
                static_dir: constants::STATIC_DIR.clone(),
            };

            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(config, state).await {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !web_server_handle.is_finished() {
                info!("Aborting web server task...");
                web_server_handle.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Chat {
            level,
            goals,
            injuries,
            preferences,
        } => {
            let Some(client) = completion_client() else {
                println!("{}", MISSING_KEY_NOTICE);
                return Ok(());
            };

            let mut profile = FitnessProfile::new();
            profile.apply(ProfileUpdate::FitnessLevel(level));
            profile.apply(ProfileUpdate::Goals(goals));
            profile.apply(ProfileUpdate::Injuries(injuries));
            profile.apply(ProfileUpdate::Preferences(preferences));

            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut stdout = std::io::stdout();
            chat::run_chat(client.as_ref(), profile, stdin, &mut stdout)
                .await
                .context("Chat session failed")?;
        }
    }

    Ok(())
}
