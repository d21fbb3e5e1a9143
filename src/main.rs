use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metafetch::config::{find_config_file, load_config, Config};
use metafetch::models::{CollectionType, FetchKey, FetchRequest, SearchHit};
use metafetch::sources::{MessageLevel, SourceRegistry};
use metafetch::utils::HttpClient;
use metafetch::{Manager, ManagerEvent};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// metafetch - Search metadata sources and fetch full records
#[derive(Parser, Debug)]
#[command(name = "metafetch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Search metadata sources and fetch full records", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (-v, -vv)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(long, short)]
    quiet: bool,

    /// Output format
    #[arg(long, short, value_enum, global = true, default_value_t = OutputFormat::Auto)]
    output: OutputFormat,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Request timeout in seconds, overriding the configuration
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for results
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Automatic based on terminal (plain if TTY, JSON otherwise)
    Auto,
    /// Plain text format
    Plain,
    /// JSON format (machine-readable)
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured sources and their search keys
    Sources,

    /// List the source types that can be configured
    Types,

    /// Search one source
    #[command(alias = "s")]
    Search {
        /// Search value
        value: String,

        /// Display name of the source to search
        #[arg(long, short)]
        source: String,

        /// Search key
        #[arg(long, short, default_value = "title", value_parser = parse_key)]
        key: FetchKey,

        /// Collection type
        #[arg(long, short, default_value = "book", value_parser = parse_collection)]
        collection: CollectionType,

        /// Number of result pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Fetch the full record of the first N hits
        #[arg(long, default_value_t = 0)]
        fetch: usize,
    },
}

fn parse_key(s: &str) -> Result<FetchKey, String> {
    FetchKey::ALL
        .iter()
        .copied()
        .find(|k| k.tag().eq_ignore_ascii_case(s))
        .ok_or_else(|| {
            let tags: Vec<_> = FetchKey::ALL.iter().map(|k| k.tag()).collect();
            format!("unknown key '{}', expected one of: {}", s, tags.join(", "))
        })
}

fn parse_collection(s: &str) -> Result<CollectionType, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown collection type '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = if cli.quiet { "error" } else { log_level };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("metafetch={}", env_filter)),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match find_config_file(cli.config.as_deref()) {
        Some(path) => {
            tracing::info!("Using config file: {}", path.display());
            load_config(&path)?
        }
        None => {
            tracing::info!("No config file found, no sources configured");
            Config::default()
        }
    };
    if let Some(timeout) = cli.timeout {
        config.defaults.timeout_secs = timeout;
    }

    let transport = Arc::new(HttpClient::with_user_agent(
        &config.defaults.user_agent,
        config.defaults.timeout(),
    )?);
    let (manager, mut events) = Manager::new(SourceRegistry::new(), transport, &config);

    let format = match cli.output {
        OutputFormat::Auto if std::io::stdout().is_terminal() => OutputFormat::Plain,
        OutputFormat::Auto => OutputFormat::Json,
        other => other,
    };

    match cli.command {
        Commands::Types => {
            for (name, tag) in manager.registry().name_type_map() {
                println!("{:<20} {}", tag, name);
            }
        }

        Commands::Sources => {
            for source in manager.sources() {
                let keys: Vec<_> = manager
                    .key_map(source.name())
                    .into_iter()
                    .map(|(_, label)| label)
                    .collect();
                println!(
                    "{} [{}] ({}): {}",
                    source.name(),
                    source.id(),
                    source.source_type(),
                    keys.join(", ")
                );
            }
        }

        Commands::Search {
            value,
            source,
            key,
            collection,
            pages,
            fetch,
        } => {
            let target = manager
                .source_by_name(&source)
                .ok_or_else(|| anyhow!("No source named '{}'", source))?;
            if !target.can_search(key) {
                return Err(anyhow!("{} cannot search by {}", target.name(), key));
            }

            let request = FetchRequest::new(collection, key, value);
            let mut hits = Vec::new();

            for page in 0..pages.max(1) {
                if page == 0 {
                    manager.start_search(&source, request.clone());
                } else if manager.has_more_results() {
                    manager.continue_search();
                } else {
                    break;
                }

                let interrupted =
                    drain_round(&manager, &mut events, &mut hits, format, cli.quiet).await;
                if interrupted {
                    break;
                }
            }

            let mut records = Vec::new();
            for hit in hits.iter().take(fetch) {
                match manager.fetch_entry(hit).await {
                    Some(record) => records.push(record),
                    None => tracing::warn!("Could not fetch '{}'", hit.title),
                }
            }

            match format {
                OutputFormat::Json => {
                    let records: Vec<BTreeMap<&str, &str>> =
                        records.iter().map(|r| r.fields().collect()).collect();
                    let output = serde_json::json!({ "hits": hits, "records": records });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                _ => {
                    for record in &records {
                        println!();
                        for (name, value) in record.fields() {
                            println!("  {:<14} {}", name, value);
                        }
                    }
                }
            }

            if !cli.quiet {
                eprintln!("{} hits", hits.len());
            }
        }
    }

    Ok(())
}

/// Collect events until the round's `Done`; returns true if interrupted
async fn drain_round(
    manager: &Manager,
    events: &mut mpsc::UnboundedReceiver<ManagerEvent>,
    hits: &mut Vec<SearchHit>,
    format: OutputFormat,
    quiet: bool,
) -> bool {
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ManagerEvent::HitFound(hit)) => {
                    if format == OutputFormat::Plain {
                        println!("{:>4}. {}  {}", hits.len() + 1, hit.title, hit.description);
                    }
                    hits.push(hit);
                }
                Some(ManagerEvent::Message { source, text, level }) => {
                    if !quiet || level == MessageLevel::Error {
                        eprintln!("[{}] {}", source, text);
                    }
                }
                Some(ManagerEvent::Done) | None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                manager.stop();
            }
        }
    }
    interrupted
}
