//! Quillgate CLI
//!
//! The `quillgate` command checks quality profiles and gates generated
//! reports against them.
//!
//! ## Commands
//!
//! - `check-profile`: Load and validate a quality profile
//! - `parse`: Show how a report splits into sections
//! - `score`: Rule-only scorecard and decision for a report
//! - `run`: Full QA loop with the LLM critic and generator
//!
//! ## Exit codes
//!
//! - 0: accepted
//! - 1: error
//! - 2: report not accepted, or accepted with degraded confidence

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use quillgate_core::{
    assess, Decision, QualityProfile, SchemaError, Section, SectionParser, StructuredBlockExtractor,
};
use quillgate_runtime::{
    BoundedRecorder, CancelHandle, CompletionConfig, GenerationArtifact, JsonlStore, LlmCritic,
    LlmGenerator, Orchestrator, OrchestratorBuilder, OutcomeSink, ProviderRegistry, QaResult,
    RuntimeConfig,
};

#[derive(Parser)]
#[command(name = "quillgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quality gate for generated reports", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a quality profile
    CheckProfile {
        /// Profile file (YAML or JSON)
        profile: PathBuf,
    },

    /// Split a report into sections
    Parse {
        profile: PathBuf,

        /// Report file, or "-" for stdin
        text: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Score a report with rule criteria only
    Score {
        profile: PathBuf,

        /// Report file, or "-" for stdin
        text: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Run the full QA loop and print the final report
    Run {
        profile: PathBuf,

        /// Report file, or "-" for stdin
        text: PathBuf,

        /// Runtime config (YAML)
        #[arg(long)]
        runtime: Option<PathBuf>,

        /// Provider config (JSON with a "type" field); defaults to anthropic
        #[arg(long)]
        provider: Option<PathBuf>,

        /// Append the closed run to this JSON Lines file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Request id stamped on the run
        #[arg(long, default_value = "cli")]
        request_id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::CheckProfile { profile } => cmd_check_profile(&profile),
        Commands::Parse { profile, text, json } => cmd_parse(&profile, &text, json),
        Commands::Score { profile, text, json } => cmd_score(&profile, &text, json),
        Commands::Run {
            profile,
            text,
            runtime,
            provider,
            record,
            request_id,
        } => {
            let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            rt.block_on(cmd_run(RunArgs {
                profile,
                text,
                runtime,
                provider,
                record,
                request_id,
            }))
        }
    }
}

fn load_profile(path: &Path) -> Result<QualityProfile> {
    QualityProfile::from_file(path).with_context(|| format!("Failed to load profile {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).context("Failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn cmd_check_profile(path: &Path) -> Result<ExitCode> {
    let profile = load_profile(path)?;

    println!("Profile {}@{}", profile.name, profile.profile_version);
    println!("Sections:");
    for spec in &profile.sections {
        let block = spec.block.as_deref().map(|b| format!(" block={}", b)).unwrap_or_default();
        let required = if spec.required { "required" } else { "optional" };
        println!("  {:<20} {:<8} marker={:?}{}", spec.name, required, spec.marker, block);
    }
    println!(
        "Criteria: {} rule, {} critic",
        profile.rule_criteria().count(),
        profile.critic_criteria().count()
    );
    let t = &profile.thresholds;
    println!(
        "Thresholds: accept {:.2}, patch {:.2}, regenerate {:.2}, section {:.2} ({:?} wins)",
        t.accept, t.patch, t.regenerate, t.section_patch, t.section_precedence
    );
    println!(
        "Limits: {} patch rounds, {} regenerations",
        profile.limits.max_patch_rounds, profile.limits.max_regenerate_rounds
    );
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct ParseReport<'a> {
    sections: &'a [Section],
    schema_errors: &'a [SchemaError],
}

fn cmd_parse(profile_path: &Path, text_path: &Path, json: bool) -> Result<ExitCode> {
    let profile = load_profile(profile_path)?;
    let text = read_text(text_path)?;

    let mut sections = match SectionParser::new(&profile).parse(&text) {
        Ok(sections) => sections,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ExitCode::from(2));
        }
    };
    let schema_errors = StructuredBlockExtractor::new(&profile).extract_all(&mut sections);

    if json {
        let report = ParseReport {
            sections: &sections,
            schema_errors: &schema_errors,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    for section in &sections {
        let block = match (&section.structured_block, schema_errors.iter().any(|e| section.is_named(&e.section))) {
            (Some(b), _) if b.partial => format!("partial (missing {})", b.missing.join(", ")),
            (Some(_), _) => "ok".to_string(),
            (None, true) => "missing".to_string(),
            (None, false) => "-".to_string(),
        };
        println!(
            "{:>2}  {:<20} {:<8} {:>6} bytes  block: {}{}",
            section.order_index,
            section.label(),
            if section.required { "required" } else { "" },
            section.raw_text.len(),
            block,
            if section.inferred { "  (inferred header)" } else { "" }
        );
    }
    for e in &schema_errors {
        eprintln!("schema error: {}", e);
    }
    Ok(ExitCode::SUCCESS)
}

fn decision_json(decision: &Decision) -> JsonValue {
    match decision {
        Decision::Accept => serde_json::json!({ "action": "accept" }),
        Decision::Patch(targets) => serde_json::json!({
            "action": "patch",
            "targets": targets
                .iter()
                .map(|t| serde_json::json!({ "section": t.section, "failing": t.failing }))
                .collect::<Vec<_>>(),
        }),
        Decision::Regenerate => serde_json::json!({ "action": "regenerate" }),
        Decision::Reject => serde_json::json!({ "action": "reject" }),
    }
}

fn cmd_score(profile_path: &Path, text_path: &Path, json: bool) -> Result<ExitCode> {
    let profile = load_profile(profile_path)?;
    let text = read_text(text_path)?;

    let assessment = match assess(&profile, &text, Vec::new()) {
        Ok(assessment) => assessment,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ExitCode::from(2));
        }
    };
    let card = &assessment.scorecard;

    if json {
        let out = serde_json::json!({
            "scorecard": card,
            "schema_errors": assessment.schema_errors,
            "decision": decision_json(&assessment.decision),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for r in &card.results {
            let score = if r.evaluated {
                format!("{:.2}", r.score)
            } else {
                "  - ".to_string()
            };
            println!("  {:<8} {}  {}", r.criterion_id, score, r.explanation);
        }
        for (section, score) in &card.section_scores {
            println!("  section {:<20} {:.2}", section, score);
        }
        println!("Total {:.3} ({:?})", card.total, card.decision_band);
        match &assessment.decision {
            Decision::Accept => println!("Decision: accept"),
            Decision::Patch(targets) => {
                let names: Vec<&str> = targets.iter().map(|t| t.section.as_str()).collect();
                println!("Decision: patch {}", names.join(", "));
            }
            Decision::Regenerate => println!("Decision: regenerate"),
            Decision::Reject => println!("Decision: reject"),
        }
    }

    Ok(if assessment.decision == Decision::Accept {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

struct RunArgs {
    profile: PathBuf,
    text: PathBuf,
    runtime: Option<PathBuf>,
    provider: Option<PathBuf>,
    record: Option<PathBuf>,
    request_id: String,
}

fn load_provider_config(path: Option<&Path>) -> Result<JsonValue> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read provider config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid provider config {}", path.display()))
        }
        None => Ok(serde_json::json!({ "type": "anthropic" })),
    }
}

fn build_orchestrator(
    profile: QualityProfile,
    config: RuntimeConfig,
    provider_config: &JsonValue,
    recorder: Arc<dyn OutcomeSink>,
) -> Result<Orchestrator> {
    let registry = ProviderRegistry::with_defaults();
    let provider = registry
        .create_from(provider_config)
        .context("Failed to create LLM provider")?;

    let completion: CompletionConfig = match provider_config.get("completion") {
        Some(value) => serde_json::from_value(value.clone()).context("Invalid \"completion\" settings")?,
        None => CompletionConfig::default(),
    };
    let critic = LlmCritic::new(provider.clone(), completion.with_max_tokens(1024));
    let generator = LlmGenerator::new(provider, completion);

    let orchestrator = OrchestratorBuilder::new()
        .profile(Arc::new(profile))
        .generator(Arc::new(generator))
        .critic(Arc::new(critic))
        .config(config)
        .recorder(recorder)
        .build()?;
    Ok(orchestrator)
}

fn print_summary(result: &QaResult) {
    let run = &result.run.run;
    eprintln!(
        "run {}: {} after {} attempt(s), {} patch round(s), {} regeneration(s){}",
        run.run_id,
        if result.accepted() { "accepted" } else { "not accepted" },
        run.attempts.len(),
        run.counters.patch_rounds,
        run.counters.regenerations,
        if result.degraded { " [degraded]" } else { "" }
    );
    if let Some(card) = &result.scorecard {
        eprintln!("total {:.3} ({:?})", card.total, card.decision_band);
    }
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let profile = load_profile(&args.profile)?;
    let config = match &args.runtime {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let provider_config = load_provider_config(args.provider.as_deref())?;
    let text = read_text(&args.text)?;

    let recorder = BoundedRecorder::new(config.recorder_capacity);
    let drain = match &args.record {
        Some(path) => {
            let store = JsonlStore::open(path)
                .await
                .with_context(|| format!("Failed to open record file {}", path.display()))?;
            Some(recorder.spawn_drain(store))
        }
        None => None,
    };

    let orchestrator = build_orchestrator(profile, config, &provider_config, Arc::new(recorder.clone()))?;

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing with the last validated report");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator
        .run_with_cancel(GenerationArtifact::new(&args.request_id, text), cancel.token())
        .await;

    recorder.close();
    if let Some(drain) = drain {
        let written = drain
            .await
            .context("Record writer task panicked")?
            .context("Failed to write run record")?;
        tracing::info!(records = written, "Run recorded");
    }
    if recorder.dropped() > 0 {
        tracing::warn!(dropped = recorder.dropped(), "Run records were dropped");
    }

    print!("{}", result.final_text);
    print_summary(&result);

    Ok(if result.accepted() && !result.degraded {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
