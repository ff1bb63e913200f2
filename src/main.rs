use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use picindex::{
    clear_cache, default_extractor, warm_cache, CancelToken, Config, ImageIndexRepository,
    IndexOptions, IndexOutcome, IndexReader, IndexerService, Progress, ThumbnailCache,
    WarmOptions, WarmOutcome,
};

const PROGRESS_EVERY: usize = 250;

#[derive(Parser, Debug)]
#[command(name = "picindex", version)]
#[command(about = "Index image metadata into SQLite and search it")]
struct Cli {
    /// Index database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Thumbnail cache directory
    #[arg(long, global = true)]
    thumb_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the index from one or more folders
    Index {
        #[arg(long = "folder", required = true)]
        folders: Vec<PathBuf>,

        #[arg(short, long)]
        workers: Option<usize>,

        /// Also write every record to this JSON file
        #[arg(long)]
        json: Option<PathBuf>,

        /// Empty the thumbnail cache before indexing
        #[arg(long)]
        flush_thumbs: bool,

        #[arg(long)]
        exiftool: Option<PathBuf>,
    },

    /// Query the index; an empty query lists everything by filename
    Search {
        #[arg(default_value = "")]
        query: String,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,

        /// Print the page as JSON
        #[arg(long)]
        json: bool,

        /// Produce and print a thumbnail path per result
        #[arg(long)]
        thumbnails: bool,
    },

    /// Pre-build thumbnails for every indexed image
    Thumbs {
        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(long)]
        max_bytes: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn log_progress(stage: &str, progress: Progress<'_>) {
    if progress.completed % PROGRESS_EVERY == 0 || progress.completed == progress.total {
        info!(
            stage,
            completed = progress.completed,
            total = progress.total,
            path = %progress.path.display(),
            "progress"
        );
    }
}

/// First Ctrl-C cancels the running job; the partial result is still committed.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, stopping after the current file");
        handler_token.cancel();
    }) {
        warn!(error = %err, "interrupt handler unavailable");
    }
    cancel
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(dir) = cli.thumb_dir {
        config.thumb_dir = dir;
    }

    match cli.command {
        Command::Index {
            folders,
            workers,
            json,
            flush_thumbs,
            exiftool,
        } => {
            if let Some(program) = exiftool {
                config.exiftool = program;
            }
            run_index(&config, &folders, workers, json, flush_thumbs, &cancel_on_interrupt())
        }
        Command::Search {
            query,
            limit,
            offset,
            json,
            thumbnails,
        } => run_search(&config, &query, limit, offset, json, thumbnails),
        Command::Thumbs { workers, max_bytes } => {
            run_thumbs(&config, workers, max_bytes, &cancel_on_interrupt())
        }
    }
}

fn run_index(
    config: &Config,
    folders: &[PathBuf],
    workers: Option<usize>,
    snapshot_path: Option<PathBuf>,
    flush_thumbs: bool,
    cancel: &CancelToken,
) -> Result<()> {
    if flush_thumbs {
        clear_cache(&config.thumb_dir)?;
    }

    let mut repo = ImageIndexRepository::open(&config.db_path)
        .with_context(|| format!("opening index {}", config.db_path.display()))?;
    let service = IndexerService::new(default_extractor(config.exiftool.clone()));
    let options = IndexOptions {
        concurrency: workers.unwrap_or(config.workers).max(1),
        snapshot_path,
    };

    let outcome = service
        .build_index(&mut repo, folders, &options, cancel, |p| {
            log_progress("index", p)
        })
        .context("index rebuild failed")?;

    match outcome {
        IndexOutcome::Completed {
            indexed,
            removed,
            skipped,
            total,
        } => println!("indexed {indexed} of {total} images ({skipped} skipped, {removed} removed)"),
        IndexOutcome::Canceled { indexed, total } => {
            println!("canceled after {indexed} of {total} images")
        }
    }
    Ok(())
}

fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    offset: usize,
    json: bool,
    thumbnails: bool,
) -> Result<()> {
    let reader = IndexReader::open(&config.db_path)
        .with_context(|| format!("opening index {}", config.db_path.display()))?;
    let page = reader.search_page(query, limit.unwrap_or(config.page_size), offset)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    let cache = thumbnails.then(|| ThumbnailCache::new(&config.thumb_dir, config.max_thumb_bytes));
    for result in &page.results {
        match &cache {
            Some(cache) => {
                let thumb = cache
                    .thumbnail_for(std::path::Path::new(&result.path))
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}\t{}", result.id, result.filename, result.path, thumb);
            }
            None => println!("{}\t{}\t{}", result.id, result.filename, result.path),
        }
    }

    let first = if page.results.is_empty() { 0 } else { offset + 1 };
    eprintln!(
        "{}-{} of {}{}",
        first,
        offset + page.results.len(),
        page.total,
        if page.has_more() { " (more)" } else { "" }
    );
    Ok(())
}

fn run_thumbs(
    config: &Config,
    workers: Option<usize>,
    max_bytes: Option<u64>,
    cancel: &CancelToken,
) -> Result<()> {
    let reader = IndexReader::open(&config.db_path)
        .with_context(|| format!("opening index {}", config.db_path.display()))?;
    let paths: Vec<PathBuf> = reader
        .all_records()?
        .into_iter()
        .map(|record| PathBuf::from(record.path))
        .collect();

    let options = WarmOptions {
        concurrency: workers.unwrap_or(config.workers).max(1),
        max_source_bytes: max_bytes.unwrap_or(config.max_thumb_bytes),
    };
    let outcome = warm_cache(&paths, &config.thumb_dir, &options, cancel, |p| {
        log_progress("thumbs", p)
    })?;

    let stats = outcome.stats();
    let verb = match outcome {
        WarmOutcome::Completed(_) => "finished",
        WarmOutcome::Canceled(_) => "canceled",
    };
    println!(
        "thumbnails {verb}: {} of {} cached ({} new, {} skipped) in {}",
        stats.cached(),
        stats.total,
        stats.created,
        stats.skipped,
        config.thumb_dir.display()
    );
    Ok(())
}
