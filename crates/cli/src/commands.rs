use crate::report::{self, emit};
use crate::signals::forward_interrupts;
use crate::{Cli, Commands, EvalArgs, ExploreCommand, ExportArgs, MapArgs, SessionsCommand};
use crate::flags::SchemaDocument;
use anyhow::{Context, Result};
use chunkwise_aggregator::AggregateReport;
use chunkwise_orchestrator::{
    AnalysisRequest, CancellationManager, Checkpoint, CommandWorker, InitOptions, MapOptions,
    MapSummary, Orchestrator, OrchestratorConfig, OrchestratorError, ProgressEvent, SessionState,
    Workers, DEFAULT_STATE_DIR,
};
use chunkwise_protocol::{schema_json, ChunkResult, DeltaReport, ErrorEnvelope};
use chunkwise_sandbox::{SearchOptions, SearchRange, WorkerCommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

const STATE_DIR_ENV: &str = "CHUNKWISE_STATE_DIR";

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    if let Commands::Schema(args) = &cli.command {
        return report::print_stdout(&schema_for(args.document)?);
    }

    let state_dir = state_dir(cli.state_dir);
    let mut config = OrchestratorConfig::load(&state_dir)
        .with_context(|| format!("failed to load configuration from {}", state_dir.display()))?;
    cli.overrides.apply(&mut config);
    let sandbox_worker = WorkerCommand::current_exe("sandbox-worker")
        .context("failed to locate the chunkwise executable")?;
    let orchestrator = Orchestrator::new(config, &state_dir)?.with_sandbox_worker(sandbox_worker);

    match cli.command {
        Commands::Init(args) => {
            let summary = orchestrator
                .init(InitOptions {
                    root: args.path,
                    query: args.query,
                    include: args.include,
                    exclude: args.exclude,
                    pattern: args.pattern,
                    incremental_from: args.incremental_from,
                })
                .await?;
            emit(json, &summary, report::render_init)
        }
        Commands::Explore(ExploreCommand::Eval(args)) => {
            let source = program_source(&args)?;
            let outcome = orchestrator
                .eval(args.session.session.as_deref(), &source)
                .await?;
            emit(json, &outcome, report::render_eval)
        }
        Commands::Explore(ExploreCommand::Search(args)) => {
            let range = match (args.start, args.end) {
                (Some(start), Some(end)) => Some(SearchRange { start, end }),
                _ => None,
            };
            let options = SearchOptions {
                case_insensitive: args.ignore_case,
                max_matches: args.max_matches,
            };
            let outcome = orchestrator
                .search(args.session.session.as_deref(), &args.pattern, range, &options)
                .await?;
            emit(json, &outcome, report::render_search)
        }
        Commands::Chunk(args) => {
            let summary = orchestrator.chunk(args.session.as_deref()).await?;
            emit(json, &summary, report::render_chunks)
        }
        Commands::Map(args) => {
            let summary = run_mapping(&orchestrator, args, false).await?;
            emit(json, &summary, report::render_map)
        }
        Commands::Reduce(args) => {
            let aggregate = orchestrator.reduce(args.session.as_deref()).await?;
            emit(json, &aggregate, report::render_reduce)
        }
        Commands::Export(args) => export(&orchestrator, args).await,
        Commands::Status(args) => {
            let status = orchestrator.status(args.session.as_deref()).await?;
            emit(json, &status, report::render_status)
        }
        Commands::Sessions(SessionsCommand::List) => {
            let sessions = orchestrator.list().await?;
            emit(json, &sessions, report::render_sessions)
        }
        Commands::Sessions(SessionsCommand::Resume(args)) => {
            let summary = run_mapping(&orchestrator, args, true).await?;
            emit(json, &summary, report::render_map)
        }
        Commands::Sessions(SessionsCommand::Abort(args)) => {
            let id = orchestrator.resolve(args.session.as_deref()).await?;
            orchestrator.abort(Some(&id)).await?;
            emit(json, &serde_json::json!({ "aborted": id }), |_| {
                format!("session {id} aborted")
            })
        }
        Commands::Sessions(SessionsCommand::Clean(args)) => {
            let cleaned = orchestrator.clean(args.id.as_deref()).await?;
            emit(json, &cleaned, report::render_clean)
        }
        Commands::Sessions(SessionsCommand::Use(args)) => {
            orchestrator.use_session(&args.id).await?;
            emit(json, &serde_json::json!({ "current": args.id }), |_| {
                format!("current session is now {}", args.id)
            })
        }
        Commands::Schema(_) | Commands::SandboxWorker => Ok(()),
    }
}

fn state_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var_os(STATE_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

fn program_source(args: &EvalArgs) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read program from {}", path.display()));
    }
    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("failed to read program from stdin")?;
    Ok(source)
}

fn workers(config: &OrchestratorConfig) -> Result<Workers> {
    let standard = CommandWorker::from_argv(&config.worker.command).ok_or_else(|| {
        OrchestratorError::WorkerUnavailable(
            "no analysis worker configured (set worker.command or --worker-cmd)".to_string(),
        )
    })?;
    let escalated = CommandWorker::from_argv(&config.worker.escalation_command)
        .map(|worker| Arc::new(worker) as Arc<dyn chunkwise_orchestrator::AnalysisWorker>);
    Ok(Workers {
        standard: Arc::new(standard),
        escalated,
    })
}

async fn run_mapping(orchestrator: &Orchestrator, args: MapArgs, resume: bool) -> Result<MapSummary> {
    let workers = workers(orchestrator.config())?;
    let options = MapOptions {
        escalate: args.escalate,
    };
    let cancel = CancellationManager::new(orchestrator.config().grace_period());
    let interrupts = forward_interrupts(cancel.clone());
    let session = args.session.session.as_deref();
    let summary = if resume {
        orchestrator.resume(session, options, &workers, &cancel).await
    } else {
        orchestrator.map(session, options, &workers, &cancel).await
    };
    interrupts.abort();
    Ok(summary?)
}

async fn export(orchestrator: &Orchestrator, args: ExportArgs) -> Result<()> {
    let rendered = orchestrator
        .export(args.session.session.as_deref(), args.format.as_domain())
        .await?;
    match args.out {
        Some(path) => {
            tokio::fs::write(&path, rendered.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("report written to {}", path.display());
            Ok(())
        }
        None => report::print_stdout(rendered.trim_end()),
    }
}

fn schema_for(document: SchemaDocument) -> Result<String> {
    let schema = match document {
        SchemaDocument::State => schema_json::<SessionState>(),
        SchemaDocument::Checkpoint => schema_json::<Checkpoint>(),
        SchemaDocument::Progress => schema_json::<ProgressEvent>(),
        SchemaDocument::Request => schema_json::<AnalysisRequest>(),
        SchemaDocument::Result => schema_json::<ChunkResult>(),
        SchemaDocument::Report => schema_json::<AggregateReport>(),
        SchemaDocument::Delta => schema_json::<DeltaReport>(),
        SchemaDocument::Error => schema_json::<ErrorEnvelope>(),
    };
    Ok(schema?)
}
