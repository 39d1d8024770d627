use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use chronoscope_lib::case::chat::DEFAULT_CHAT_MODEL;
use chronoscope_lib::case::{chat_with_case, normalize_case, CaseStatus, CaseStore, JsonCaseStore};
use chronoscope_lib::config::EngineSettings;
use chronoscope_lib::pipeline::engine::{process_submission, Engine, Submission};
use chronoscope_lib::pipeline::llm::{client_from_settings, ChatTurn};
use chronoscope_lib::pipeline::registry::PipelineRegistry;
use chronoscope_lib::report::{build_report, export_pdf, ReportInfo};

#[derive(Parser, Debug)]
#[command(
    name = "chronoscope",
    version,
    about = "Assemble extracted medical and psychiatric records into a citable case chronology."
)]
struct Cli {
    /// Directory holding case files (defaults to the application data dir).
    #[arg(long, global = true)]
    cases_dir: Option<PathBuf>,

    /// JSON file with additional pipeline definitions.
    #[arg(long, global = true)]
    pipelines_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available pipelines.
    Pipelines {
        /// Include pipelines outside the default offering.
        #[arg(long)]
        all: bool,
    },
    /// Run a pipeline over a JSON file of records and store the result as a case.
    Process {
        /// JSON array of records, or an object with a `records` array.
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long, default_value = "medical_chronology")]
        pipeline: String,
        /// Use the higher-quality model for the analysis phase.
        #[arg(long)]
        hybrid: bool,
        #[arg(long, default_value = "Unknown")]
        customer_name: String,
        #[arg(long, default_value = "unknown@example.com")]
        customer_email: String,
    },
    /// List stored cases, newest first.
    Cases,
    /// Print one case as JSON.
    Case { id: String },
    /// Move a case forward (pending_review, approved, delivered).
    Status { id: String, status: String },
    /// Export a case report as PDF with changes tracked against the original analysis.
    Export {
        id: String,
        #[arg(short, long)]
        output: PathBuf,
        /// Render the raw analysis instead of the reviewed copy.
        #[arg(long)]
        original: bool,
    },
    /// Convert structured red flags, contradictions and expert opinions to text.
    Normalize { id: String },
    /// Ask a question about a case's reviewed analysis.
    Chat {
        id: String,
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value = DEFAULT_CHAT_MODEL)]
        model: String,
        /// JSON array of earlier turns: `[{"role": "user", "content": "..."}]`.
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    chronoscope_lib::init_tracing();
    let cli = Cli::parse();

    let registry = load_registry(cli.pipelines_file.as_deref())?;
    let store = match &cli.cases_dir {
        Some(dir) => JsonCaseStore::open(dir),
        None => JsonCaseStore::open_default(),
    }
    .context("Cannot open case directory")?;

    match cli.command {
        Command::Pipelines { all } => {
            if all {
                for id in registry.ids() {
                    let config = registry.get(&id)?;
                    println!("{id:<24} {}", config.name);
                }
            } else {
                for summary in registry.list_pipelines() {
                    println!("{:<24} {}", summary.id, summary.name);
                }
            }
        }
        Command::Process {
            input,
            pipeline,
            hybrid,
            customer_name,
            customer_email,
        } => {
            let records = read_records(&input)?;
            let settings = EngineSettings::from_env();
            // Blocking HTTP clients must be built outside the runtime.
            let client = client_from_settings(&settings).context("Cannot create LLM client")?;
            let engine = Engine::new(registry, settings, client);

            let runtime = tokio::runtime::Runtime::new().context("Cannot start async runtime")?;
            let processed = runtime.block_on(process_submission(
                &store,
                &engine,
                Submission {
                    customer_name,
                    customer_email,
                    pipeline,
                    hybrid_mode: hybrid,
                    records,
                },
            ))?;

            println!("Case: {}", processed.case.id);
            println!("{}", serde_json::to_string_pretty(&processed.run.report)?);
            println!("{}", serde_json::to_string_pretty(&processed.run.cost)?);
            if processed.run.is_degraded() {
                eprintln!("Run degraded: {}", processed.run.analysis.diagnostics.join("; "));
            }
        }
        Command::Cases => {
            for case in store.list_cases()? {
                println!(
                    "{}  {:<15} {:<20} {:<28} {} records",
                    case.id,
                    case.status,
                    case.pipeline,
                    case.customer_name,
                    case.records_count
                );
            }
        }
        Command::Case { id } => {
            let case = store.get_case(&id)?;
            println!("{}", serde_json::to_string_pretty(&case)?);
        }
        Command::Status { id, status } => {
            let status: CaseStatus = status.parse()?;
            let case = store.update_status(&id, status)?;
            println!("{} -> {}", case.id, case.status);
        }
        Command::Export {
            id,
            output,
            original,
        } => {
            let case = store.get_case(&id)?;
            let Some(raw) = case.analysis.as_ref() else {
                bail!("Case {id} has no analysis yet");
            };
            let (analysis, baseline) = if original {
                (raw, None)
            } else {
                (case.edits.as_ref().unwrap_or(raw), Some(raw))
            };
            let domain = registry
                .get(&case.pipeline)
                .map(|config| config.name.clone())
                .unwrap_or_else(|_| case.pipeline.clone());
            let info = ReportInfo::for_case(&case, &domain, chrono::Local::now().date_naive());
            let report = build_report(analysis, &info, baseline, &case.comments);
            export_pdf(&report, &output)
                .with_context(|| format!("Cannot export report to {}", output.display()))?;
            println!("Report written to {}", output.display());
        }
        Command::Normalize { id } => {
            let mut case = store.get_case(&id)?;
            if normalize_case(&mut case) {
                store.put_case(&case)?;
                println!("Case {id} normalized");
            } else {
                println!("Case {id} already uses text sections");
            }
        }
        Command::Chat {
            id,
            message,
            model,
            history,
        } => {
            let history: Vec<ChatTurn> = match history {
                Some(path) => {
                    let data = std::fs::read_to_string(&path)
                        .with_context(|| format!("Cannot read {}", path.display()))?;
                    serde_json::from_str(&data)
                        .with_context(|| format!("{} is not a list of chat turns", path.display()))?
                }
                None => Vec::new(),
            };
            let settings = EngineSettings::from_env();
            let client = client_from_settings(&settings).context("Cannot create LLM client")?;
            let reply = chat_with_case(&store, client.as_ref(), &model, &id, &message, &history)?;

            println!("{}", reply.answer);
            if !reply.is_grounded() {
                let unknown: Vec<&str> = reply
                    .grounding
                    .violations
                    .iter()
                    .map(|v| v.record_id.as_str())
                    .collect();
                eprintln!("Warning: answer cites records not in this case: {}", unknown.join(", "));
            }
        }
    }

    Ok(())
}

fn load_registry(path: Option<&Path>) -> anyhow::Result<PipelineRegistry> {
    let mut registry = PipelineRegistry::builtin();
    if let Some(path) = path {
        let extra = PipelineRegistry::load_json(path)
            .with_context(|| format!("Cannot load pipelines from {}", path.display()))?;
        for id in extra.ids() {
            registry.insert(extra.get(&id)?.clone());
        }
    }
    Ok(registry)
}

fn read_records(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&data)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        serde_json::Value::Array(records) => Ok(records),
        serde_json::Value::Object(mut map) => match map.remove("records") {
            Some(serde_json::Value::Array(records)) => Ok(records),
            _ => bail!("{} has no `records` array", path.display()),
        },
        _ => bail!("{} must hold a JSON array of records", path.display()),
    }
}
