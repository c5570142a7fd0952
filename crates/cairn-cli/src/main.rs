//! CLI binary for running, resuming, and validating Cairn pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use cairn_pipeline::{
    default_registry, load_document, validate, Budgets, CheckpointStore, ExecutionSupervisor,
    FileCheckpointStore, PipelineDocument, RunOutcome, RunReport, Severity,
};
use cairn_types::{duration_serde, Variables};

const DEFAULT_CHECKPOINT_DIR: &str = ".cairn/checkpoints";

#[derive(Parser)]
#[command(name = "cairn", version, about = "Nested pipeline runner with budgets and checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a YAML or JSON document
    Run {
        /// Path to the pipeline document
        file: PathBuf,

        /// Pipeline to run (default: the first one in the document)
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Maximum step executions across the whole call tree
        #[arg(long)]
        max_steps: Option<u64>,

        /// Maximum nesting depth
        #[arg(long)]
        max_depth: Option<u64>,

        /// Maximum wall-clock time, e.g. 30s, 5m, 1h
        #[arg(long, value_parser = duration_serde::parse_duration)]
        max_duration: Option<Duration>,

        /// Maximum estimated memory for recorded results, in bytes
        #[arg(long)]
        max_memory: Option<u64>,

        /// Checkpoint directory (default: .cairn/checkpoints)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Initial variable, KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// Resume an interrupted run from its checkpoint
    Resume {
        /// Path to the pipeline document the run was started from
        file: PathBuf,

        /// Run id printed by `cairn run`
        run_id: Uuid,

        /// Checkpoint directory (default: .cairn/checkpoints)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Validate a pipeline document
    Validate {
        /// Path to the pipeline document
        file: PathBuf,
    },

    /// Show information about a pipeline document
    Info {
        /// Path to the pipeline document
        file: PathBuf,
    },

    /// List resumable runs
    Checkpoints {
        /// Checkpoint directory (default: .cairn/checkpoints)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Delete the checkpoint of this run instead of listing
        #[arg(long, value_name = "RUN_ID")]
        abandon: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the --verbose default
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = match cli.command {
        Commands::Run {
            file,
            pipeline,
            max_steps,
            max_depth,
            max_duration,
            max_memory,
            checkpoint_dir,
            vars,
        } => {
            let overrides = BudgetOverrides {
                max_steps,
                max_depth,
                max_duration,
                max_memory,
            };
            cmd_run(&file, pipeline.as_deref(), overrides, checkpoint_dir, vars).await?
        }
        Commands::Resume {
            file,
            run_id,
            checkpoint_dir,
        } => cmd_resume(&file, run_id, checkpoint_dir).await?,
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Info { file } => cmd_info(&file)?,
        Commands::Checkpoints {
            checkpoint_dir,
            abandon,
        } => cmd_checkpoints(checkpoint_dir, abandon).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Parse a `--var KEY=VALUE` flag.
fn parse_var(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Budget flags; each one overrides the document's value.
#[derive(Debug, Default, Clone, Copy)]
struct BudgetOverrides {
    max_steps: Option<u64>,
    max_depth: Option<u64>,
    max_duration: Option<Duration>,
    max_memory: Option<u64>,
}

impl BudgetOverrides {
    fn apply(self, base: Budgets) -> Budgets {
        let mut budgets = base;
        if let Some(n) = self.max_steps {
            budgets = budgets.with_max_steps(n);
        }
        if let Some(n) = self.max_depth {
            budgets = budgets.with_max_depth(n);
        }
        if let Some(d) = self.max_duration {
            budgets = budgets.with_max_duration(d);
        }
        if let Some(n) = self.max_memory {
            budgets = budgets.with_max_memory_bytes(n);
        }
        budgets
    }
}

fn checkpoint_store(dir: Option<PathBuf>) -> Arc<FileCheckpointStore> {
    Arc::new(FileCheckpointStore::new(
        dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR)),
    ))
}

fn supervisor(doc: &PipelineDocument, store: Arc<FileCheckpointStore>) -> anyhow::Result<ExecutionSupervisor> {
    Ok(ExecutionSupervisor::builder()
        .registry(default_registry())
        .pipelines(doc.to_set()?)
        .checkpoint_store(store)
        .build())
}

/// Print the report and map its outcome to an exit code.
fn report(report: &RunReport) -> anyhow::Result<i32> {
    println!("\nRun {} ({})", report.run_id, report.pipeline_name);
    println!(
        "Steps: {}  Peak depth: {}  Elapsed: {}",
        report.ledger.steps_executed,
        report.ledger.peak_depth,
        duration_serde::format_duration(Duration::from_millis(report.ledger.elapsed_ms)),
    );
    println!(
        "Results:\n{}",
        serde_json::to_string_pretty(&cairn_types::results_to_json(&report.results))?
    );

    let code = match &report.outcome {
        RunOutcome::Completed { .. } => {
            println!("\nPipeline completed");
            0
        }
        RunOutcome::Aborted { reason } => {
            println!("\nPipeline aborted: {}", serde_json::to_string(reason)?);
            1
        }
        RunOutcome::BudgetExceeded { which } => {
            println!("\nPipeline exceeded its {which} budget");
            2
        }
    };
    if report.resumable {
        println!("Resume with: cairn resume <file> {}", report.run_id);
    }
    Ok(code)
}

async fn cmd_run(
    path: &Path,
    pipeline: Option<&str>,
    overrides: BudgetOverrides,
    checkpoint_dir: Option<PathBuf>,
    vars: Vec<(String, serde_json::Value)>,
) -> anyhow::Result<i32> {
    let doc = load_document(path)?;
    let entry = doc.entry(pipeline)?;
    let budgets = overrides.apply(doc.budgets.unwrap_or_default());
    let variables: Variables = vars.into_iter().collect();

    println!("Running pipeline: {}", entry.name);
    if let Some(description) = &entry.description {
        println!("Description: {description}");
    }
    println!(
        "Budgets: {} steps, depth {}, {}, {} bytes",
        budgets.max_steps,
        budgets.max_depth,
        duration_serde::format_duration(budgets.max_duration),
        budgets.max_memory_bytes
    );

    let sup = supervisor(&doc, checkpoint_store(checkpoint_dir))?;
    let result = sup.run_with_variables(entry, budgets, variables).await;
    report(&result)
}

async fn cmd_resume(path: &Path, run_id: Uuid, checkpoint_dir: Option<PathBuf>) -> anyhow::Result<i32> {
    let doc = load_document(path)?;
    let sup = supervisor(&doc, checkpoint_store(checkpoint_dir))?;
    println!("Resuming run: {run_id}");
    let result = sup.resume(run_id).await?;
    report(&result)
}

fn cmd_validate(path: &Path) -> anyhow::Result<i32> {
    let doc = load_document(path)?;
    let diagnostics = validate(&doc.to_set()?);

    if diagnostics.is_empty() {
        println!("Pipeline document is valid");
        return Ok(0);
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        let location = match &diag.step {
            Some(step) => format!("{}.{}", diag.pipeline, step),
            None => diag.pipeline.clone(),
        };
        println!("[{}] {} ({}): {}", severity, diag.rule, location, diag.message);
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    Ok(if has_error { 1 } else { 0 })
}

fn cmd_info(path: &Path) -> anyhow::Result<i32> {
    let doc = load_document(path)?;

    println!("Pipelines: {}", doc.pipelines.len());
    let budgets = doc.budgets.unwrap_or_default();
    println!(
        "Budgets: {} steps, depth {}, {}, {} bytes",
        budgets.max_steps,
        budgets.max_depth,
        duration_serde::format_duration(budgets.max_duration),
        budgets.max_memory_bytes
    );

    for pipeline in &doc.pipelines {
        println!("\n{} ({} steps)", pipeline.name, pipeline.len());
        if let Some(description) = &pipeline.description {
            println!("  {description}");
        }
        for step in &pipeline.steps {
            let mut extras = Vec::new();
            if let Some(cond) = &step.run_condition {
                extras.push(format!("when {cond}"));
            }
            if step.max_attempts() > 1 {
                extras.push(format!("attempts={}", step.max_attempts()));
            }
            extras.push(format!("on_failure={:?}", step.on_failure).to_lowercase());
            println!("  {} [{}] {}", step.name, step.kind, extras.join(" "));
        }
        let targets: Vec<_> = pipeline.nested_targets().into_iter().map(|(_, t)| t).collect();
        if !targets.is_empty() {
            println!("  calls: {}", targets.join(", "));
        }
    }

    Ok(0)
}

async fn cmd_checkpoints(checkpoint_dir: Option<PathBuf>, abandon: Option<Uuid>) -> anyhow::Result<i32> {
    let store = checkpoint_store(checkpoint_dir);

    if let Some(run_id) = abandon {
        store.delete(run_id).await?;
        println!("Abandoned run {run_id}");
        return Ok(0);
    }

    let records = store.list().await?;
    let roots: Vec<_> = records.iter().filter(|r| r.is_root()).collect();
    if roots.is_empty() {
        println!("No resumable runs in {}", store.dir().display());
        return Ok(0);
    }
    for record in roots {
        println!(
            "{}  {}  after step #{}  saved {}",
            record.run_id,
            record.pipeline_name,
            record.last_completed_step_index,
            record.saved_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_values_parse_as_json_when_possible() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".into(), serde_json::json!(3)));
        assert_eq!(parse_var("flag=true").unwrap(), ("flag".into(), serde_json::json!(true)));
        assert_eq!(
            parse_var("who=world").unwrap(),
            ("who".into(), serde_json::json!("world"))
        );
        assert_eq!(
            parse_var("expr=a=b").unwrap(),
            ("expr".into(), serde_json::json!("a=b"))
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn flags_override_document_budgets() {
        let doc = Budgets::default().with_max_steps(10).with_max_depth(4);
        let merged = BudgetOverrides {
            max_steps: Some(99),
            ..Default::default()
        }
        .apply(doc);
        assert_eq!(merged.max_steps, 99);
        assert_eq!(merged.max_depth, 4);
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "cairn", "run", "p.yml", "--max-duration", "90s", "--var", "a=1", "--var", "b=x",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                max_duration, vars, ..
            } => {
                assert_eq!(max_duration, Some(Duration::from_secs(90)));
                assert_eq!(vars.len(), 2);
            }
            _ => panic!("expected run"),
        }
    }
}
