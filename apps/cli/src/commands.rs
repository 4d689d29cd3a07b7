//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

use aspects_core::adapters::WarehouseSink;
use aspects_core::dispatch::Dispatcher;
use aspects_core::events::{handle_event, parse_event_line};
use aspects_core::memory::RecordingWarehouse;
use aspects_core::pipeline::{
    self, DumpCourseResult, DumpCoursesOptions, ProgressReporter,
};
use aspects_core::sinks::SinkContext;
use aspects_shared::{AppConfig, CourseKey, SinkSettings, init_config, load_config, load_config_from};
use aspects_storage::{Snapshot, Storage};
use aspects_warehouse::ClickHouseClient;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Aspects: course structure and user models into ClickHouse.
#[derive(Parser)]
#[command(
    name = "aspects",
    version,
    about = "Dump published course structure and user models into ClickHouse.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.aspects/aspects.toml).
    #[arg(long, global = true, env = "ASPECTS_CONFIG")]
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
    /// Load a JSON course snapshot into the local content store.
    Import {
        /// Snapshot file.
        snapshot: PathBuf,
    },

    /// Dump one course if it changed since its last dump.
    DumpCourse {
        /// Course key, e.g. course-v1:edX+DemoX+Demo.
        course_key: CourseKey,

        /// Dump even if the warehouse is up to date.
        #[arg(long)]
        force: bool,

        /// Record rows instead of sending them to ClickHouse.
        #[arg(long)]
        dry_run: bool,
    },

    /// Dump every stale course in the content store.
    DumpCourses {
        /// Only these courses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        ids: Vec<CourseKey>,

        /// Never these courses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        skip_ids: Vec<CourseKey>,

        /// Dump even if the warehouse is up to date.
        #[arg(long)]
        force: bool,

        /// Stop after this many courses have been dumped.
        #[arg(long)]
        limit: Option<usize>,

        /// Record rows instead of sending them to ClickHouse.
        #[arg(long)]
        dry_run: bool,
    },

    /// Read JSON-lines lifecycle events and run the resulting dumps.
    Listen {
        /// Events file (defaults to stdin).
        #[arg(long)]
        events: Option<PathBuf>,

        /// Record rows instead of sending them to ClickHouse.
        #[arg(long)]
        dry_run: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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
        0 => "aspects=info",
        1 => "aspects=debug",
        _ => "aspects=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Import { snapshot } => cmd_import(config_path, &snapshot).await,
        Command::DumpCourse {
            course_key,
            force,
            dry_run,
        } => cmd_dump_course(config_path, &course_key, force, dry_run).await,
        Command::DumpCourses {
            ids,
            skip_ids,
            force,
            limit,
            dry_run,
        } => {
            let options = DumpCoursesOptions {
                ids,
                skip_ids,
                force,
                limit,
            };
            cmd_dump_courses(config_path, &options, dry_run).await
        }
        Command::Listen { events, dry_run } => {
            cmd_listen(config_path, events.as_deref(), dry_run).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Everything a dump command needs. `recording` is set for dry runs.
struct Runtime {
    ctx: SinkContext,
    recording: Option<Arc<RecordingWarehouse>>,
}

async fn open_runtime(config: &AppConfig, dry_run: bool) -> Result<Runtime> {
    let db_path = config.content_store.resolved_db_path()?;
    let storage = Storage::open_readonly(&db_path).await?;

    let recording = dry_run.then(|| Arc::new(RecordingWarehouse::new()));
    let warehouse: Arc<dyn WarehouseSink> = match &recording {
        Some(recording) => recording.clone(),
        None => Arc::new(ClickHouseClient::new(&config.clickhouse)?),
    };

    let ctx = SinkContext::new(Arc::new(storage), warehouse, SinkSettings::from(config));
    Ok(Runtime { ctx, recording })
}

/// Print what a dry run would have written.
async fn print_dry_run(recording: Option<&RecordingWarehouse>) {
    let Some(recording) = recording else { return };

    println!();
    println!("  Dry run: nothing was sent to ClickHouse.");
    for insert in recording.inserts().await {
        println!("  would insert {:>5} rows into {}", insert.rows.len(), insert.table);
    }
    for delete in recording.deletes().await {
        println!(
            "  would delete from {} where {} = {}",
            delete.table, delete.column, delete.value
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(config_path: Option<&Path>, snapshot_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let db_path = config.content_store.resolved_db_path()?;

    let snapshot = Snapshot::from_file(snapshot_path)?;
    info!(path = %snapshot_path.display(), db = %db_path.display(), "importing snapshot");

    let storage = Storage::open(&db_path).await?;
    let summary = storage.import_snapshot(&snapshot).await?;

    println!();
    println!("  Snapshot imported!");
    println!("  Courses:          {}", summary.courses);
    println!("  Blocks:           {}", summary.blocks);
    println!("  External ids:     {}", summary.external_ids);
    println!("  User retirements: {}", summary.user_retirements);
    println!("  Store:            {}", db_path.display());
    println!();

    Ok(())
}

async fn cmd_dump_course(
    config_path: Option<&Path>,
    course_key: &CourseKey,
    force: bool,
    dry_run: bool,
) -> Result<()> {
    let config = load(config_path)?;
    let runtime = open_runtime(&config, dry_run).await?;

    let result = pipeline::dump_course(&runtime.ctx, course_key, force).await?;

    println!();
    match &result.dump_id {
        Some(dump_id) => {
            println!("  Course dumped!");
            println!("  Course:   {}", result.course_key);
            println!("  Dump id:  {dump_id}");
            println!("  Overview: {} rows", result.overview_rows);
            println!("  Blocks:   {} rows", result.block_rows);
        }
        None => {
            println!("  Course skipped.");
            println!("  Course:   {}", result.course_key);
        }
    }
    println!("  Reason:   {}", result.decision.reason);
    println!("  Time:     {:.1}s", result.elapsed.as_secs_f64());

    print_dry_run(runtime.recording.as_deref()).await;
    Ok(())
}

async fn cmd_dump_courses(
    config_path: Option<&Path>,
    options: &DumpCoursesOptions,
    dry_run: bool,
) -> Result<()> {
    if options.limit == Some(0) {
        return Err(eyre!("--limit must be at least 1"));
    }

    let config = load(config_path)?;
    let runtime = open_runtime(&config, dry_run).await?;

    let reporter = CliProgress::new();
    let summary = pipeline::dump_courses(&runtime.ctx, options, &reporter).await;
    reporter.finish();
    let summary = summary?;

    println!();
    println!("  Bulk dump finished.");
    println!("  Dumped:  {}", summary.dumped.len());
    println!("  Skipped: {}", summary.skipped.len());
    println!("  Failed:  {}", summary.failed.len());
    for (course_key, error) in &summary.failed {
        println!("    {course_key}: {error}");
    }
    println!("  Time:    {:.1}s", summary.elapsed.as_secs_f64());

    print_dry_run(runtime.recording.as_deref()).await;

    if summary.failed.is_empty() {
        Ok(())
    } else {
        Err(eyre!("{} course(s) failed to dump", summary.failed.len()))
    }
}

async fn cmd_listen(config_path: Option<&Path>, events: Option<&Path>, dry_run: bool) -> Result<()> {
    let config = load(config_path)?;
    let runtime = open_runtime(&config, dry_run).await?;
    let dispatcher = Dispatcher::start(runtime.ctx.clone(), &config.dispatcher);

    let reader: Box<dyn AsyncRead + Unpin + Send> = match events {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .map_err(|e| eyre!("cannot open events file {}: {e}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();

    let mut invalid = 0usize;
    while let Some(line) = lines.next_line().await? {
        match parse_event_line(&line) {
            Ok(Some(event)) => {
                handle_event(&dispatcher, &event).await?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "skipping invalid event");
                invalid += 1;
            }
        }
    }

    let stats = dispatcher.shutdown().await?;

    println!();
    println!("  Event stream drained.");
    println!("  Queued:       {}", stats.submitted);
    println!("  Deduplicated: {}", stats.deduplicated);
    println!("  Succeeded:    {}", stats.succeeded);
    println!("  Failed:       {}", stats.failed);
    println!("  Invalid:      {invalid}");

    print_dry_run(runtime.recording.as_deref()).await;
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
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
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("spinner template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn course_done(&self, result: &DumpCourseResult, current: usize, total: usize) {
        let verb = if result.dumped() { "Dumped" } else { "Skipped" };
        self.spinner
            .set_message(format!("{verb} [{current}/{total}] {}", result.course_key));
    }

    fn course_failed(&self, course_key: &CourseKey, error: &str) {
        self.spinner
            .println(format!("  failed {course_key}: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_dump_courses_filters() {
        let cli = Cli::try_parse_from([
            "aspects",
            "dump-courses",
            "--ids",
            "course-v1:edX+A+1,course-v1:edX+B+1",
            "--skip-ids",
            "course-v1:edX+C+1",
            "--limit",
            "5",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Command::DumpCourses {
                ids,
                skip_ids,
                force,
                limit,
                dry_run,
            } => {
                assert_eq!(ids.len(), 2);
                assert_eq!(skip_ids, vec![CourseKey::new("edX", "C", "1")]);
                assert!(!force);
                assert_eq!(limit, Some(5));
                assert!(dry_run);
            }
            _ => panic!("expected dump-courses"),
        }
    }

    #[test]
    fn rejects_malformed_course_key() {
        assert!(Cli::try_parse_from(["aspects", "dump-course", "not-a-key"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "aspects",
            "listen",
            "--events",
            "events.jsonl",
            "-vv",
            "--config",
            "custom.toml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
    }
}
