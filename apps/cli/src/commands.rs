//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use treedump_core::{
    DumpResult, MemoryReporter, ProgressReporter, QueueSnapshot, SortedDump,
};
use treedump_shared::{AppConfig, StageKind, init_config, load_config, load_config_from};
use treedump_source::{GlobPredicate, JsonLinesSource, PathFilter};
use treedump_storage::SortedStoreReader;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// treedump: dump a document store into a path-sorted store.
#[derive(Parser)]
#[command(
    name = "treedump",
    version,
    about = "Dump a document store export into a path-sorted store for index building.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.treedump/treedump.toml.
    #[arg(long, global = true, env = "TREEDUMP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Dump a JSON-lines export into a sorted store.
    Dump(DumpArgs),

    /// Print the manifest and first entries of a sorted store.
    Inspect {
        /// Store directory.
        #[arg(long)]
        store: PathBuf,

        /// Number of entries to print.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments of `treedump dump`. Unset tunables come from the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct DumpArgs {
    /// JSON-lines export to read, one raw record per line.
    #[arg(long)]
    pub source: PathBuf,

    /// Output store directory (defaults to `store.output_dir`).
    #[arg(long)]
    pub out: Option<PathBuf>,

    #[arg(long, env = "TREEDUMP_DOC_BATCH_MAX_SIZE_MB")]
    pub doc_batch_max_size_mb: Option<u32>,

    #[arg(long, env = "TREEDUMP_DOC_BATCH_MAX_DOCUMENTS")]
    pub doc_batch_max_documents: Option<u32>,

    #[arg(long, env = "TREEDUMP_DOC_QUEUE_RESERVED_MEMORY_MB")]
    pub doc_queue_reserved_memory_mb: Option<u32>,

    #[arg(long, env = "TREEDUMP_TRANSFORM_THREADS")]
    pub transform_threads: Option<u32>,

    /// Working memory in MB, 0 to auto-detect.
    #[arg(long, env = "TREEDUMP_WORKING_MEMORY_MB")]
    pub working_memory_mb: Option<u32>,

    #[arg(long, env = "TREEDUMP_SORT_BUFFER_MEMORY_PERCENTAGE")]
    pub sort_buffer_memory_percentage: Option<u32>,

    /// Only download these subtrees (repeatable).
    #[arg(long = "include")]
    pub include: Vec<String>,

    /// Never download these subtrees (repeatable).
    #[arg(long = "exclude")]
    pub exclude: Vec<String>,

    /// Drop paths matching this glob during transform (repeatable).
    #[arg(long = "exclude-glob")]
    pub exclude_glob: Vec<String>,

    /// Checkpoint label recorded in the store manifest.
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Write the run report as JSON to this file.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl DumpArgs {
    /// Layer the flags over the loaded configuration.
    fn apply(&self, config: &mut AppConfig) {
        let pipeline = &mut config.pipeline;
        if let Some(v) = self.doc_batch_max_size_mb {
            pipeline.doc_batch_max_size_mb = v;
        }
        if let Some(v) = self.doc_batch_max_documents {
            pipeline.doc_batch_max_documents = v;
        }
        if let Some(v) = self.doc_queue_reserved_memory_mb {
            pipeline.doc_queue_reserved_memory_mb = v;
        }
        if let Some(v) = self.transform_threads {
            pipeline.transform_threads = v;
        }
        if let Some(v) = self.working_memory_mb {
            pipeline.working_memory_mb = v;
        }
        if let Some(v) = self.sort_buffer_memory_percentage {
            pipeline.sort_buffer_memory_percentage = v;
        }

        let filters = &mut config.filters;
        filters.included_paths.extend(self.include.iter().cloned());
        filters.excluded_paths.extend(self.exclude.iter().cloned());
        filters.exclude_globs.extend(self.exclude_glob.iter().cloned());
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "treedump=info",
        1 => "treedump=debug",
        _ => "treedump=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Dump(args) => cmd_dump(&args, config_path.as_deref()).await,
        Command::Inspect { store, limit } => cmd_inspect(&store, limit),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_dump(args: &DumpArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    args.apply(&mut config);

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.store.output_dir));
    let source = JsonLinesSource::open(&args.source)?;

    let filters = &config.filters;
    let path_filters = if filters.included_paths.is_empty() && filters.excluded_paths.is_empty() {
        Vec::new()
    } else {
        vec![PathFilter::new(
            filters.included_paths.clone(),
            filters.excluded_paths.clone(),
        )]
    };
    let predicate = GlobPredicate::excluding(&filters.exclude_globs)?;

    info!(
        source = %args.source.display(),
        out = %out.display(),
        transform_threads = config.pipeline.transform_threads,
        "starting dump"
    );

    let reporter = Arc::new(MemoryReporter::default());
    let dump = SortedDump::new(&config.pipeline, Box::new(source), &out, reporter.clone())?
        .with_path_filters(path_filters)
        .with_predicate(Arc::new(predicate))
        .with_checkpoint(args.checkpoint.clone());

    let progress = CliProgress::new();
    let result = dump.run(&progress).await;
    progress.spinner.finish_and_clear();
    let result = result?;

    info!(report = %reporter.generate_report(), "dump report");
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&reporter.report())?;
        std::fs::write(path, json).map_err(|e| eyre!("cannot write report to '{}': {e}", path.display()))?;
    }

    println!();
    println!("  Sorted store created successfully!");
    println!("  Path:       {}", result.store_dir.display());
    println!("  Documents:  {}", result.documents_downloaded);
    println!("  Entries:    {}", result.entries_stored);
    println!("  Rejected:   {}", result.statistics.entries_rejected());
    println!("  SHA-256:    {}", result.manifest.sha256);
    println!("  Time:       {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

fn cmd_inspect(store: &Path, limit: usize) -> Result<()> {
    let reader = SortedStoreReader::open(store)?;
    reader.verify()?;
    println!("{}", serde_json::to_string_pretty(reader.manifest())?);
    println!();

    for entry in reader.entries()?.take(limit) {
        let entry = entry?;
        println!("{}\t{}", entry.path, String::from_utf8_lossy(&entry.data));
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn stage_finished(&self, stage: StageKind, summary: &str) {
        self.spinner.println(format!("  {stage}: {summary}"));
    }

    fn queues(&self, snapshot: &QueueSnapshot) {
        self.spinner.set_message(format!(
            "Dumping: {} documents, {} entries [raw queue {}, empty {}, full {}]",
            snapshot.documents_processed,
            snapshot.entries_accepted,
            snapshot.raw_batches,
            snapshot.buffers.empty,
            snapshot.buffers.full
        ));
    }

    fn done(&self, _result: &DumpResult) {
        self.spinner.finish_and_clear();
    }
}
