use chunkwise_aggregator::AggregatorError;
use chunkwise_chunker::ChunkerError;
use chunkwise_orchestrator::OrchestratorError;
use chunkwise_protocol::{Classify, ErrorCategory, ErrorEnvelope};
use chunkwise_sandbox::SandboxError;
use clap::{Args, Parser, Subcommand};
use flags::{ConfigOverrides, ExportFormatFlag, SchemaDocument};
use std::path::PathBuf;

mod commands;
mod flags;
mod report;
mod signals;

#[derive(Parser)]
#[command(name = "chunkwise")]
#[command(
    about = "Answer questions about codebases too large for one context window",
    long_about = None
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Print results and errors as JSON on stdout (implies --quiet)
    #[arg(long, global = true)]
    json: bool,

    /// Session state directory (default: CHUNKWISE_STATE_DIR or .chunkwise)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a directory into a new session and make it current
    Init(InitArgs),

    /// Scout the session context with sandboxed programs and searches
    #[command(subcommand)]
    Explore(ExploreCommand),

    /// Split the session context into overlapping chunks
    Chunk(SessionArg),

    /// Analyze every pending chunk with the configured worker
    Map(MapArgs),

    /// Merge chunk results into the session report
    Reduce(SessionArg),

    /// Write the session report as JSON or Markdown
    Export(ExportArgs),

    /// List, resume, abort, clean or switch sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),

    /// Show phase and progress of a session
    Status(SessionArg),

    /// Print the JSON schema of a persisted or exchanged document
    Schema(SchemaArgs),

    /// Run one sandbox request from stdin (used internally)
    #[command(name = "sandbox-worker", hide = true)]
    SandboxWorker,
}

#[derive(Args)]
struct SessionArg {
    /// Session id (defaults to the current session)
    #[arg(long = "session")]
    session: Option<String>,
}

#[derive(Args)]
struct InitArgs {
    /// Directory (or single file) to analyze
    #[arg(default_value = ".")]
    path: PathBuf,

    /// The question every chunk is analyzed against
    #[arg(short, long)]
    query: String,

    /// Only load paths matching these globs
    #[arg(long)]
    include: Vec<String>,

    /// Skip paths matching these globs
    #[arg(long)]
    exclude: Vec<String>,

    /// Only load paths containing this substring
    #[arg(long)]
    pattern: Option<String>,

    /// Load only files added or changed since this session
    #[arg(long)]
    incremental_from: Option<String>,
}

#[derive(Subcommand)]
enum ExploreCommand {
    /// Evaluate a restricted Python-like program against the context
    Eval(EvalArgs),

    /// Regex search over the context
    Search(SearchArgs),
}

#[derive(Args)]
struct EvalArgs {
    #[command(flatten)]
    session: SessionArg,

    /// Program text (reads stdin when neither this nor --file is given)
    #[arg(conflicts_with = "file")]
    code: Option<String>,

    /// Read the program from a file
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    session: SessionArg,

    /// Regular expression
    pattern: String,

    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Stop after this many matches
    #[arg(long, default_value_t = 1_000)]
    max_matches: usize,

    /// Byte offset to start searching at
    #[arg(long, requires = "end")]
    start: Option<usize>,

    /// Byte offset to stop searching at
    #[arg(long, requires = "start")]
    end: Option<usize>,
}

#[derive(Args)]
struct MapArgs {
    #[command(flatten)]
    session: SessionArg,

    /// Retry quality failures on the escalation worker, within budget
    #[arg(long)]
    escalate: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    session: SessionArg,

    #[arg(long, value_enum, default_value = "markdown")]
    format: ExportFormatFlag,

    /// Write to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List sessions, oldest first
    List,

    /// Continue mapping from the last checkpoint
    Resume(MapArgs),

    /// Mark a session aborted; its data is kept
    Abort(SessionArg),

    /// Remove one session, or apply the age and size caps to all of them
    Clean(CleanArgs),

    /// Make a session current
    Use(UseArgs),
}

#[derive(Args)]
struct CleanArgs {
    /// Remove only this session
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args)]
struct UseArgs {
    id: String,
}

#[derive(Args)]
struct SchemaArgs {
    #[arg(value_enum)]
    document: SchemaDocument,
}

/// Parse arguments, run the command and return the process exit code.
pub fn main_entry() -> i32 {
    let cli = Cli::parse();

    // The worker answers on stdout; nothing else may write there.
    if matches!(cli.command, Commands::SandboxWorker) {
        return chunkwise_sandbox::worker::serve_stdio();
    }

    init_logging(&cli);
    let json = cli.json;
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            return report_error(&anyhow::Error::new(err).context("failed to start the async runtime"), json)
        }
    };
    match runtime.block_on(commands::run(cli)) {
        Ok(()) => 0,
        Err(err) => report_error(&err, json),
    }
}

fn init_logging(cli: &Cli) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet || cli.json {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();
}

/// Print `err` and return the exit code of its category.
fn report_error(err: &anyhow::Error, json: bool) -> i32 {
    let envelope = envelope(err);
    if json {
        match serde_json::to_string_pretty(&envelope) {
            Ok(body) => {
                let _ = report::print_stdout(&body);
            }
            Err(_) => eprintln!("error[{}]: {}", envelope.code, envelope.message),
        }
    } else {
        eprintln!("error[{}]: {}", envelope.code, envelope.message);
        if let Some(hint) = &envelope.hint {
            eprintln!("hint: {hint}");
        }
    }
    envelope.category.exit_code()
}

/// The first classified error in the chain decides code, category and hint;
/// the message keeps the whole context chain.
fn envelope(err: &anyhow::Error) -> ErrorEnvelope {
    let message = format!("{err:#}");
    for cause in err.chain() {
        let classified = if let Some(e) = cause.downcast_ref::<OrchestratorError>() {
            Some(e.envelope())
        } else if let Some(e) = cause.downcast_ref::<SandboxError>() {
            Some(e.envelope())
        } else if let Some(e) = cause.downcast_ref::<ChunkerError>() {
            Some(e.envelope())
        } else {
            cause.downcast_ref::<AggregatorError>().map(Classify::envelope)
        };
        if let Some(envelope) = classified {
            return ErrorEnvelope { message, ..envelope };
        }
    }
    ErrorEnvelope {
        code: "internal".to_string(),
        category: ErrorCategory::System,
        message,
        hint: Some("Re-run with --verbose and report the log.".to_string()),
    }
}
