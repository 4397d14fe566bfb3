//! Stowage CLI
//!
//! Upload, fetch and list content-addressed objects

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stowage::{AuthContext, ContentStore, Identity, Options, StowageConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Content-addressed storage adapter")]
struct Args {
    /// Path to the TOML configuration
    #[arg(short = 'c', long, default_value = "stowage.toml")]
    config: PathBuf,

    /// User forwarded to the metadata service
    #[arg(long, default_value = "anonymous")]
    user: String,

    /// Bearer token forwarded to the metadata service
    #[arg(long)]
    token: Option<String>,

    /// Owning node the uploads belong to
    #[arg(long)]
    node: Option<String>,

    /// Backend-specific option, repeatable (key=value)
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file under a virtual path
    Put {
        file: PathBuf,
        path: String,
    },
    /// Download a virtual path to a local file
    Get {
        path: String,
        #[arg(short = 'O', long)]
        output: PathBuf,
    },
    /// List entries under a virtual path
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Delete a virtual path
    Delete {
        path: String,
    },
}

/// Parse a `key=value` option
fn parse_option(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("Invalid option '{}'. Expected key=value", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = StowageConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("Config loaded from {:?}", args.config);

    let auth = AuthContext {
        user: args.user.clone(),
        token: args.token.clone(),
    };
    let identity = Identity {
        provider: String::new(),
        node: args.node.clone(),
    };
    let store = ContentStore::from_config(&config, auth, identity)?;
    let options: Options = args.options.iter().cloned().collect();

    match args.command {
        Command::Put { file, path } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let receipt = store.upload(source, &path, &options).await?;

            if let Some(warning) = &receipt.warning {
                warn!("Stored but not indexed: {}", warning.reason);
            }
            println!("{}", serde_json::to_string_pretty(&receipt.record)?);
        }
        Command::Get { path, output } => {
            let mut reader = store.download(&path, &options).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            info!("Wrote {} bytes to {:?}", copied, output);
        }
        Command::Ls { path } => {
            for entry in store.metadata(&path, &options).await? {
                let marker = if entry.is_folder() { "d" } else { "-" };
                println!("{} {:>12} {}", marker, entry.size, entry.path);
            }
        }
        Command::Delete { path } => {
            store.delete(&path, &options).await?;
        }
    }

    Ok(())
}
