use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_mcp::{McpConfig, McpManager};
use relay_tools::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "MCP protocol bridge: connect tool providers and invoke their tools", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "mcp.yaml")]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every bridged tool
    Tools,

    /// Show per-provider connection health
    Status,

    /// Invoke one bridged tool directly
    Call {
        /// Qualified tool name, e.g. mcp__github__search_issues
        #[arg(short, long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    info!("Loading configuration from: {:?}", cli.config);
    let config = McpConfig::load_from_file(&cli.config).await?;

    let registry = Arc::new(ToolRegistry::new());
    let manager = McpManager::create_tools(&config, &registry).await;

    let result = match cli.command {
        Commands::Tools => {
            list_tools(&registry);
            Ok(())
        }
        Commands::Status => {
            show_status(&manager).await;
            Ok(())
        }
        Commands::Call { tool, args } => call_tool(&registry, &tool, &args).await,
    };

    manager.shutdown_all().await;
    result
}

fn list_tools(registry: &ToolRegistry) {
    println!("\nBridged Tools");
    println!("═══════════════════════════════════════");

    if registry.is_empty() {
        println!("(none — no provider is connected)");
        return;
    }

    for name in registry.list() {
        if let Some(tool) = registry.get(&name) {
            println!("\n  {}", tool.name());
            println!("    {}", tool.description());
        }
    }
    println!();
}

async fn show_status(manager: &McpManager) {
    println!("\nProvider Health");
    println!("═══════════════════════════════════════");

    let records = manager.health_status().await;
    if records.is_empty() {
        println!("(no providers configured)");
        return;
    }

    for record in records {
        let mark = if record.connected { "✅" } else { "❌" };
        print!("{mark} {} (restarts: {})", record.server, record.restart_count);
        if let Some(error) = &record.last_error {
            print!(" — {error}");
        }
        println!();
    }
    println!();
}

async fn call_tool(registry: &ToolRegistry, name: &str, args: &str) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("tool arguments must be a JSON object")?;

    let Some(tool) = registry.get(name) else {
        bail!(
            "no such tool '{name}' — run `relay tools` to see what is available"
        );
    };

    let output = tool.execute(arguments).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
