//! CLI binary for validating, previewing and running Conduit pipelines and
//! diagnosing stage failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use conduit_doctor::{
    load_rules_from_path, DiagnosticMessage, DoctorContext, DoctorEngine, PreconditionPolicy,
    StageContext,
};
use conduit_el::Value;
use conduit_pipeline::{
    dev_library, CancelToken, EventEmitter, Pipeline, PipelineOptions, PreviewPipeline,
    StageLibrary, StageOverrides,
};
use conduit_types::{ConduitError, Issue, PipelineConfiguration, Severity, StageOutput};

#[derive(Parser)]
#[command(name = "conduit", version, about = "Stage pipeline runner with rule-based diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep diagnostic rules whose preconditions fail instead of excluding them
    #[arg(long, global = true)]
    lenient_preconditions: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline document
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Run a pipeline once in preview mode and print every stage's output
    Preview {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// JSON array of recorded stage outputs to use instead of running those stages
        #[arg(short, long)]
        overrides: Option<PathBuf>,

        /// Diagnostic rule file or directory, consulted when a stage fails
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Maximum records each source produces
        #[arg(long, default_value = "10")]
        batch_size: usize,

        /// Print the preview output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate, initialize and run a pipeline
    Run {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Diagnostic rule file or directory, consulted when a stage fails
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Maximum records each source produces
        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },

    /// Match a stage failure against diagnostic rules
    Diagnose {
        /// Diagnostic rule file or directory
        #[arg(short, long)]
        rules: PathBuf,

        /// Pipeline the failing stage belongs to
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Instance name of the failing stage
        #[arg(short, long)]
        stage: String,

        /// Failure message
        #[arg(short, long, conflicts_with = "code", required_unless_present = "code")]
        message: Option<String>,

        /// Failure error code
        #[arg(short, long)]
        code: Option<String>,

        /// Message template of the error code, with `{}` placeholders
        #[arg(long, requires = "code")]
        template: Option<String>,

        /// Error code argument (JSON or plain text); repeatable
        #[arg(long = "arg", requires = "code")]
        args: Vec<String>,
    },

    /// List the rules that compile from a rule file or directory
    Rules {
        /// Diagnostic rule file or directory
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let policy = if cli.lenient_preconditions {
        PreconditionPolicy::Lenient
    } else {
        PreconditionPolicy::Enforce
    };

    match cli.command {
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Preview {
            pipeline,
            overrides,
            rules,
            batch_size,
            json,
        } => {
            let opts = PreviewOpts {
                overrides,
                rules,
                batch_size,
                json,
            };
            cmd_preview(&pipeline, opts, policy).await?;
        }
        Commands::Run {
            pipeline,
            rules,
            batch_size,
        } => {
            cmd_run(&pipeline, rules.as_deref(), batch_size, policy).await?;
        }
        Commands::Diagnose {
            rules,
            pipeline,
            stage,
            message,
            code,
            template,
            args,
        } => {
            let failure = match (message, code) {
                (Some(message), _) => Failure::Message(message),
                (None, Some(code)) => Failure::Code {
                    code,
                    template: template.unwrap_or_default(),
                    args,
                },
                (None, None) => anyhow::bail!("either --message or --code is required"),
            };
            cmd_diagnose(&rules, &pipeline, &stage, failure, policy)?;
        }
        Commands::Rules { path } => {
            cmd_rules(&path, policy)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineConfiguration> {
    PipelineConfiguration::from_path(path)
        .with_context(|| format!("failed to load pipeline {}", path.display()))
}

fn load_engine(path: &Path, policy: PreconditionPolicy) -> anyhow::Result<DoctorEngine> {
    let rules = load_rules_from_path(path)
        .with_context(|| format!("failed to load rules from {}", path.display()))?;
    Ok(DoctorEngine::new(&DoctorContext::from_env(), rules, policy))
}

fn print_issues(issues: &[Issue]) -> bool {
    let mut has_error = false;
    for issue in issues {
        let severity = match issue.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        println!("[{}] {}", severity, issue);
    }
    has_error
}

fn print_messages(messages: &[DiagnosticMessage]) {
    for message in messages {
        println!("  * {}", message.summary);
        if !message.description.is_empty() {
            println!("    {}", message.description);
        }
    }
}

fn print_outputs(outputs: &[StageOutput]) -> anyhow::Result<()> {
    for output in outputs {
        println!(
            "\n== {} ({} records, {} error records)",
            output.instance_name,
            output.records.len(),
            output.error_records.len()
        );
        for record in &output.records {
            println!("  {}", serde_json::to_string(&record.value)?);
        }
        for record in &output.error_records {
            let error = record
                .header
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_default();
            println!("  ! {} ({})", serde_json::to_string(&record.value)?, error);
        }
        for error in &output.stage_errors {
            println!("  stage error: {}", error);
        }
    }
    Ok(())
}

/// Print what the doctor has to say about a failed run or init.
fn explain_failure(
    engine: &DoctorEngine,
    config: &PipelineConfiguration,
    library: &StageLibrary,
    err: &ConduitError,
) {
    let lookup = |instance_name: &str| {
        let configuration = config.stage(instance_name)?;
        let definition = library.definition_for(configuration)?;
        Some(StageContext::new(definition, configuration))
    };

    match err {
        ConduitError::StageExecution { instance_name, .. } => {
            if let Some(stage) = lookup(instance_name) {
                let messages = engine.on_stage_error(&stage, err);
                if !messages.is_empty() {
                    println!("\nDiagnostics for stage '{}':", instance_name);
                    print_messages(&messages);
                }
            }
        }
        ConduitError::PipelineRuntime { issues } => {
            for issue in issues {
                let Some(stage) = issue.instance_name.as_deref().and_then(lookup) else {
                    continue;
                };
                let messages = engine.on_stage_code(&stage, issue, &[]);
                if !messages.is_empty() {
                    println!("\nDiagnostics for {}:", issue);
                    print_messages(&messages);
                }
            }
        }
        _ => {}
    }
}

/// Wire Ctrl-C to the pipeline's cancel token and log lifecycle events.
fn spawn_watchers(cancel: CancelToken, events: &EventEmitter) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling pipeline before the next stage");
            cancel.cancel();
        }
    });

    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(?event, "Pipeline event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_pipeline(path)?;
    let mut pipeline = Pipeline::with_library(config, Arc::new(dev_library()));
    let issues = pipeline.validate_configs();

    if issues.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let has_error = print_issues(&issues);
    println!(
        "valid: {}, previewable: {}",
        pipeline.configuration().is_valid(),
        pipeline.configuration().is_previewable()
    );
    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

struct PreviewOpts {
    overrides: Option<PathBuf>,
    rules: Option<PathBuf>,
    batch_size: usize,
    json: bool,
}

async fn cmd_preview(path: &Path, opts: PreviewOpts, policy: PreconditionPolicy) -> anyhow::Result<()> {
    let config = load_pipeline(path)?;
    let overrides = match opts.overrides.as_deref() {
        Some(p) => StageOverrides::from_path(p)
            .with_context(|| format!("failed to load overrides {}", p.display()))?,
        None => StageOverrides::default(),
    };
    let engine = opts.rules.as_deref().map(|r| load_engine(r, policy)).transpose()?;
    let library = Arc::new(dev_library());

    let cancel = CancelToken::new();
    let events = EventEmitter::default();
    spawn_watchers(cancel.clone(), &events);
    let options = PipelineOptions::default()
        .with_cancel(cancel)
        .with_batch_size(opts.batch_size)
        .with_events(events);

    if !opts.json {
        println!("Previewing pipeline: {}", config.uuid());
    }
    let pipeline = Pipeline::new(
        config.clone(),
        library.clone(),
        Arc::new(conduit_pipeline::LibraryLoader::new(library.clone())),
        options,
    );
    let result = tokio::task::spawn_blocking(move || {
        let mut preview = PreviewPipeline::new(pipeline);
        preview.run_with_overrides(&overrides)
    })
    .await?;

    match result {
        Ok(output) if opts.json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Ok(output) => {
            print_outputs(&output.outputs)?;
            print_issues(output.issues.as_slice());
            print_issues(&output.destroy_warnings);
            Ok(())
        }
        Err(err) => {
            println!("Preview failed: {}", err);
            print_issues(err.issues());
            if let Some(engine) = &engine {
                explain_failure(engine, &config, &library, &err);
            }
            std::process::exit(1);
        }
    }
}

async fn cmd_run(
    path: &Path,
    rules: Option<&Path>,
    batch_size: usize,
    policy: PreconditionPolicy,
) -> anyhow::Result<()> {
    let config = load_pipeline(path)?;
    let engine = rules.map(|r| load_engine(r, policy)).transpose()?;
    let library = Arc::new(dev_library());

    let cancel = CancelToken::new();
    let events = EventEmitter::default();
    spawn_watchers(cancel.clone(), &events);
    let options = PipelineOptions::default()
        .with_cancel(cancel)
        .with_batch_size(batch_size)
        .with_events(events);

    println!("Running pipeline: {}", config.uuid());
    let mut pipeline = Pipeline::new(
        config.clone(),
        library.clone(),
        Arc::new(conduit_pipeline::LibraryLoader::new(library.clone())),
        options,
    );

    let validation = pipeline.validate_configs();
    if print_issues(&validation) {
        println!("Pipeline is not valid; not running");
        std::process::exit(1);
    }

    let (outcome, warnings, outputs) = tokio::task::spawn_blocking(move || {
        let init_issues = pipeline.init();
        let outcome = if init_issues.is_empty() {
            pipeline.run(&StageOverrides::default())
        } else {
            Err(ConduitError::PipelineRuntime {
                issues: init_issues.into(),
            })
        };
        let warnings = pipeline.destroy();
        (outcome, warnings, pipeline.runner().outputs().to_vec())
    })
    .await?;

    print_issues(&warnings);
    match outcome {
        Ok(()) => {
            println!("\nPipeline completed");
            for output in &outputs {
                println!(
                    "  {}: {} records, {} error records",
                    output.instance_name,
                    output.records.len(),
                    output.error_records.len()
                );
            }
            Ok(())
        }
        Err(err) => {
            println!("Pipeline failed: {}", err);
            print_issues(err.issues());
            if let Some(engine) = &engine {
                explain_failure(engine, &config, &library, &err);
            }
            std::process::exit(1);
        }
    }
}

enum Failure {
    Message(String),
    Code {
        code: String,
        template: String,
        args: Vec<String>,
    },
}

fn cmd_diagnose(
    rules: &Path,
    pipeline: &Path,
    stage: &str,
    failure: Failure,
    policy: PreconditionPolicy,
) -> anyhow::Result<()> {
    let engine = load_engine(rules, policy)?;
    let config = load_pipeline(pipeline)?;
    let library = dev_library();

    let configuration = config
        .stage(stage)
        .with_context(|| format!("stage '{}' is not part of the pipeline", stage))?;
    let definition = library.definition_for(configuration).with_context(|| {
        format!(
            "stage '{}' refers to unknown stage {}:{}@{}",
            stage, configuration.library, configuration.stage_name, configuration.stage_version
        )
    })?;
    let context = StageContext::new(definition, configuration);

    let messages = match failure {
        Failure::Message(message) => engine.on_stage_message(&context, &message),
        Failure::Code {
            code,
            template,
            args,
        } => {
            let args: Vec<Value> = args
                .iter()
                .map(|a| {
                    serde_json::from_str::<serde_json::Value>(a)
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::from(a.as_str()))
                })
                .collect();
            engine.on_stage_code(&context, &Issue::stage(stage, code, template), &args)
        }
    };

    if messages.is_empty() {
        println!("No rule matched");
    } else {
        println!("{} rule(s) matched:", messages.len());
        print_messages(&messages);
    }
    Ok(())
}

fn cmd_rules(path: &Path, policy: PreconditionPolicy) -> anyhow::Result<()> {
    let engine = load_engine(path, policy)?;
    let stats = engine.stats();

    println!("Declared: {}", stats.declared);
    println!("Compiled: {}", stats.accepted);
    println!("Outside stage scope: {}", stats.out_of_scope);
    println!("Excluded by preconditions: {}", stats.excluded);

    println!("\nRules:");
    for rule in engine.rules() {
        println!(
            "  {} conditions={} summary={:?}",
            rule.uuid(),
            rule.conditions().len(),
            rule.message().summary
        );
    }
    Ok(())
}
