use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use hotel_lookup::batch::{BatchProgress, ProgressObserver};
use hotel_lookup::{LookupOptions, LookupRequest, LookupRuntime};

#[derive(Parser)]
#[command(name = "hotel-lookup", version, about = "Look up hotel websites, phone numbers and room counts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Look up a single hotel
    Lookup {
        name: String,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        postcode: Option<String>,
        /// Primary search only; no fallback chain or website scraping
        #[arg(long)]
        fast: bool,
        #[arg(long)]
        no_cache: bool,
        /// Drop the cached result for this hotel before looking it up
        #[arg(long)]
        refresh: bool,
    },
    /// Look up every hotel in a CSV or JSON file
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, value_enum)]
        format: Option<InputFormat>,
        #[arg(long)]
        fast: bool,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Inspect and drive the retry queue
    Retry {
        #[command(subcommand)]
        action: RetryAction,
    },
    /// Print the effective configuration without secrets
    Config,
    /// Print cache, limiter and retry queue health
    Health,
}

#[derive(Subcommand)]
enum RetryAction {
    /// Retry every pending item
    Run {
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Retry one item by id
    One { id: String },
    List {
        #[arg(long)]
        pending: bool,
    },
    History,
    Stats,
    Remove { id: String },
    /// Drop pending items, or the history with --history
    Clear {
        #[arg(long)]
        history: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormat {
    Csv,
    Json,
}

impl InputFormat {
    fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => InputFormat::Json,
            _ => InputFormat::Csv,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = LookupRuntime::from_env().context("failed to start lookup runtime")?;

    match cli.command {
        Command::Lookup {
            name,
            address,
            city,
            postcode,
            fast,
            no_cache,
            refresh,
        } => {
            let request = clean_request(LookupRequest {
                name,
                address,
                city,
                postcode,
            });
            if request.name.is_empty() {
                bail!("hotel name must not be empty");
            }
            if refresh {
                let removed = runtime.invalidate(&request).await;
                info!(removed, "invalidated cached result");
            }
            let options = LookupOptions {
                use_cache: !no_cache,
                skip_deep_scrape: fast,
            };
            print_json(&runtime.lookup(&request, options).await)
        }
        Command::Batch {
            input,
            format,
            fast,
            max_concurrent,
            no_cache,
        } => {
            let format = format.unwrap_or_else(|| InputFormat::detect(&input));
            let requests = read_requests(&input, format)?;
            let mut options = runtime.default_batch_options().with_lookup(LookupOptions {
                use_cache: !no_cache,
                skip_deep_scrape: fast,
            });
            if let Some(limit) = max_concurrent {
                options.max_concurrent = limit;
            }
            let observer: ProgressObserver = Arc::new(|progress: BatchProgress| {
                info!(
                    target: "batch",
                    completed = progress.completed,
                    total = progress.total,
                    name = %progress.name,
                    status = progress.status.as_str(),
                    "progress"
                );
            });
            let summary = runtime.run_batch(requests, options, Some(observer)).await?;
            print_json(&summary)
        }
        Command::Retry { action } => run_retry(&runtime, action).await,
        Command::Config => print_json(&runtime.config().public_profile()),
        Command::Health => print_json(&runtime.health()?),
    }
}

async fn run_retry(runtime: &LookupRuntime, action: RetryAction) -> Result<()> {
    let queue = runtime.retry_queue();
    match action {
        RetryAction::Run { max_concurrent } => {
            let limit = max_concurrent.unwrap_or(runtime.config().retry_max_concurrent);
            print_json(&queue.retry_all_pending(limit).await?)
        }
        RetryAction::One { id } => match queue.retry_one(&id).await? {
            Some(item) => print_json(&item),
            None => bail!("no pending retry item with id {id}"),
        },
        RetryAction::List { pending } => {
            let items = if pending { queue.pending()? } else { queue.all()? };
            print_json(&items)
        }
        RetryAction::History => print_json(&queue.history()?),
        RetryAction::Stats => print_json(&queue.stats()?),
        RetryAction::Remove { id } => {
            if !queue.remove_item(&id)? {
                bail!("no retry item with id {id}");
            }
            print_json(&serde_json::json!({ "removed": id }))
        }
        RetryAction::Clear { history } => {
            let cleared = if history {
                queue.clear_history()?
            } else {
                queue.clear_queue()?
            };
            print_json(&serde_json::json!({ "cleared": cleared }))
        }
    }
}

fn read_requests(path: &Path, format: InputFormat) -> Result<Vec<LookupRequest>> {
    let requests: Vec<LookupRequest> = match format {
        InputFormat::Json => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("expected a JSON array of hotel requests")?
        }
        InputFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .trim(csv::Trim::All)
                .flexible(true)
                .from_path(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            reader
                .deserialize::<LookupRequest>()
                .collect::<Result<Vec<_>, _>>()
                .context("CSV needs a header row with at least a `name` column")?
        }
    };
    Ok(requests.into_iter().map(clean_request).collect())
}

fn clean_request(request: LookupRequest) -> LookupRequest {
    let blank_to_none =
        |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    LookupRequest {
        name: request.name.trim().to_string(),
        address: blank_to_none(request.address),
        city: blank_to_none(request.city),
        postcode: blank_to_none(request.postcode),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
