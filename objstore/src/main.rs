use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use objstore::{
    Config, ConnectionRegistry, Encoding, PutOptions, Storage, StrategyKind,
};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "objstore", version, about = "Uniform object storage client", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "OBJSTORE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Execution strategy: sequential, threads or fibers
    #[arg(long, env = "OBJSTORE_STRATEGY", global = true)]
    strategy: Option<StrategyKind>,

    /// Worker threads or fibers
    #[arg(long, env = "OBJSTORE_CONCURRENCY", global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Fetch an object and write its decoded content")]
    Get {
        target: String,
        key: String,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    #[command(about = "Store a file under a key")]
    Put {
        target: String,
        key: String,
        file: PathBuf,
        /// Compression method: none, gzip or br
        #[arg(long)]
        compress: Option<Encoding>,
        #[arg(long)]
        level: Option<u32>,
        #[arg(long)]
        content_type: Option<String>,
    },
    #[command(about = "Delete one or more keys")]
    Rm {
        target: String,
        #[arg(required = true)]
        keys: Vec<String>,
        /// Fail on keys that do not exist
        #[arg(long)]
        strict: bool,
    },
    #[command(about = "List keys under a prefix")]
    Ls {
        target: String,
        #[arg(default_value = "")]
        prefix: String,
        /// Only list keys directly under the prefix
        #[arg(long)]
        flat: bool,
    },
    #[command(about = "Check whether keys exist")]
    Exists {
        target: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut options = config.storage.clone();
    if let Some(strategy) = cli.strategy {
        options.strategy = strategy;
    }
    if let Some(concurrency) = cli.concurrency {
        options.concurrency = concurrency;
    }
    let registry = Arc::new(ConnectionRegistry::new(config.backends.clone()));

    let target = match &cli.command {
        Commands::Get { target, .. }
        | Commands::Put { target, .. }
        | Commands::Rm { target, .. }
        | Commands::Ls { target, .. }
        | Commands::Exists { target, .. } => target.clone(),
    };
    let storage = Storage::open_in(registry, &target, options)
        .await
        .with_context(|| format!("Failed to open {target}"))?;
    let result = run(&storage, cli.command).await;
    storage.close().await;
    result
}

async fn run(storage: &Storage, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key, output, .. } => {
            let object = storage.get(&key).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &object.content)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&object.content).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Put {
            key,
            file,
            compress,
            level,
            content_type,
            ..
        } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let options = PutOptions {
                compress,
                level,
                content_type,
                ..Default::default()
            };
            storage.put_with(&key, content, options).await?;
        }
        Commands::Rm { keys, strict, .. } => {
            let results = if strict {
                storage.delete_many_strict(keys.clone()).await?
            } else {
                storage.delete_many(keys.clone()).await?
            };
            let mut failed = 0;
            for (key, result) in keys.iter().zip(results) {
                if let Err(e) = result {
                    eprintln!("{key}: {e}");
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{failed} of {} deletes failed", keys.len());
            }
        }
        Commands::Ls { prefix, flat, .. } => {
            let mut keys = storage.list(&prefix, !flat);
            while let Some(key) = keys.try_next().await? {
                println!("{key}");
            }
        }
        Commands::Exists { keys, .. } => {
            let results = storage.exists_many(keys.clone()).await?;
            let mut missing = 0;
            for (key, result) in keys.iter().zip(results) {
                match result {
                    Ok(true) => println!("{key}\tyes"),
                    Ok(false) => {
                        println!("{key}\tno");
                        missing += 1;
                    }
                    Err(e) => {
                        eprintln!("{key}: {e}");
                        missing += 1;
                    }
                }
            }
            if missing > 0 {
                bail!("{missing} of {} keys are missing", keys.len());
            }
        }
    }
    Ok(())
}
