use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lore_client::{ApiClient, Config, FileStore, LoggingSessionSink};
use serde_json::Value;

mod logging;

use logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "lore")]
#[command(about = "Authenticated command line access to the lorebook studio API")]
#[command(version)]
struct Cli {
    /// Enable debug mode
    #[arg(long, short, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// API base URL (overrides config.toml and API_BASE)
    #[arg(long)]
    api_base: Option<String>,

    /// Directory holding the stored session
    #[arg(long, env = "LORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "LORE_PASSWORD")]
        password: String,
    },
    /// End the session and forget stored credentials
    Logout,
    /// Show whether a session is stored
    Status,
    /// Exchange the refresh credential for a new access token now
    Refresh,
    /// GET a path and print the JSON response
    Get { path: String },
    /// POST a JSON body to a path and print the JSON response
    Post { path: String, body: String },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lore")
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = Config::new();
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    log::debug!("API base: {}, data dir: {:?}", config.api_base, data_dir);

    let store = FileStore::open(data_dir.clone())
        .with_context(|| format!("failed to open credential store in {:?}", data_dir))?;
    let client = ApiClient::new(config, Arc::new(store), Arc::new(LoggingSessionSink))?;

    match cli.command {
        Commands::Login { email, password } => {
            let session = client
                .login(&serde_json::json!({ "email": email, "password": password }))
                .await?;
            println!("Logged in as {}", session.user_type);
        }
        Commands::Logout => {
            client.logout().await?;
            println!("Logged out");
        }
        Commands::Status => match client.credentials().user_type() {
            Some(user_type) if client.is_authenticated() => {
                println!("Authenticated ({})", user_type)
            }
            _ => println!("Not authenticated"),
        },
        Commands::Refresh => {
            client.refresh_session().await?;
            println!("Access token refreshed");
        }
        Commands::Get { path } => {
            let value: Value = client.get_json(&path).await?;
            print_json(&value)?;
        }
        Commands::Post { path, body } => {
            let body: Value = serde_json::from_str(&body).context("body must be valid JSON")?;
            let value: Value = client.post_json(&path, &body).await?;
            print_json(&value)?;
        }
    }

    Ok(())
}
