//! mcp-fleet - run a fleet of tool-provider servers from the command line.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mcp_fleet::mcp_client::{find_config_path, load_servers_config, McpClient};

/// mcp-fleet CLI.
#[derive(Parser)]
#[command(name = "mcp-fleet")]
#[command(about = "Supervise stdio tool-provider servers and call their tools")]
#[command(version)]
struct Cli {
    /// Servers configuration file (JSON or YAML). Searched for if omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write logs to the default file in the data directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    log_to_data_dir: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet and print every tool, grouped by server
    Tools {
        /// Print OpenAI function-calling definitions instead
        #[arg(long)]
        openai: bool,
    },

    /// Start the fleet and print per-server health
    Status,

    /// Start the fleet and call one tool
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,

        /// Route to this server instead of the first owner
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = match (&cli.log_file, cli.log_to_data_dir) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(mcp_fleet::default_log_path()),
        (None, false) => None,
    };
    mcp_fleet::init_tracing(log_path.as_deref()).context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_path(&std::env::current_dir()?)?,
    };
    let config = load_servers_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let client = McpClient::new(config);
    for (name, e) in client.start_all().await {
        tracing::warn!(server = %name, error = %e, "server unavailable");
    }

    let outcome = run(&client, cli.command).await;
    client.shutdown().await;
    outcome
}

async fn run(client: &McpClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Tools { openai } => {
            client.list_all_tools().await;
            let registry = client.registry().await;
            let output = if openai {
                serde_json::to_string_pretty(&registry.to_openai_tools())?
            } else {
                eprintln!("{}", registry.capability_summary());
                serde_json::to_string_pretty(registry.grouped())?
            };
            println!("{output}");
        }
        Commands::Status => {
            let status = client.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Call { tool, args, server } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("arguments must be valid JSON")?;
            let result = match server {
                Some(server) => client.call_server_tool(&server, &tool, arguments).await?,
                None => client.call_tool(&tool, arguments).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("tool '{tool}' reported an error");
            }
        }
    }
    Ok(())
}
