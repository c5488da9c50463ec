//! Flowsheet CLI
//!
//! Command-line driver for the extraction/review workflow:
//! - `extract`: DXF drawing to entity graph JSON
//! - `analyze`: full extraction pipeline (producer + auditor) to run document
//! - `describe`: reviewed run document to narrative process description

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowsheet_ingest_dxf::{extract_schema, ExtractOptions};
use flowsheet_pipeline::providers::create_model;
use flowsheet_pipeline::stages::{
    run_extraction_graph, run_generation_graph, ExtractionState, GenerationState,
};
use flowsheet_pipeline::AgentRegistry;
use flowsheet_run::{Run, RunStatus, FINAL_TABLE_TITLE};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowsheet")]
#[command(
    author,
    version,
    about = "Flowsheet: equipment tables and process narratives from PFD drawings"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the entity graph from a DXF drawing.
    Extract {
        /// Input DXF file.
        input: PathBuf,
        /// Write the entity graph here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Proximity threshold for near-line counting (drawing units).
        #[arg(long, default_value_t = 15.0)]
        threshold: f64,
    },

    /// Run the extraction pipeline over a drawing and write a run document.
    Analyze {
        /// Input DXF file.
        input: PathBuf,
        /// Reasoning provider: mock, openai or anthropic.
        #[arg(long, default_value = "mock")]
        provider: String,
        /// Run document output path (default: `<input>.run.json`).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Run name (default: input file stem).
        #[arg(long)]
        name: Option<String>,
        /// Proximity threshold for near-line counting (drawing units).
        #[arg(long, default_value_t = 15.0)]
        threshold: f64,
    },

    /// Finalize review of a run document and generate the narrative.
    Describe {
        /// Run document produced by `analyze`.
        run_file: PathBuf,
        /// Reasoning provider: mock, openai or anthropic.
        #[arg(long, default_value = "mock")]
        provider: String,
        /// Recorded as the reviewer who completed the run.
        #[arg(long, default_value = "cli")]
        completed_by: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Extract {
            input,
            out,
            threshold,
        } => cmd_extract(&input, out.as_deref(), threshold),
        Commands::Analyze {
            input,
            provider,
            out,
            name,
            threshold,
        } => cmd_analyze(&input, &provider, out.as_deref(), name.as_deref(), threshold).await,
        Commands::Describe {
            run_file,
            provider,
            completed_by,
        } => cmd_describe(&run_file, &provider, &completed_by).await,
    }
}

fn registry_for(provider: &str) -> AgentRegistry {
    let provider = provider.to_string();
    AgentRegistry::new(move |_| create_model(&provider))
}

fn cmd_extract(input: &Path, out: Option<&Path>, threshold: f64) -> Result<()> {
    let options = ExtractOptions {
        proximity_threshold: threshold,
    };
    let graph = extract_schema(input, options)
        .with_context(|| format!("extracting {}", input.display()))?;
    let json = graph.to_json_pretty();

    match out {
        Some(path) => {
            fs::write(path, &json)?;
            eprintln!(
                "{} {}",
                "wrote".green().bold(),
                path.display().to_string().bold()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_analyze(
    input: &Path,
    provider: &str,
    out: Option<&Path>,
    name: Option<&str>,
    threshold: f64,
) -> Result<()> {
    let options = ExtractOptions {
        proximity_threshold: threshold,
    };
    let graph = extract_schema(input, options)
        .with_context(|| format!("extracting {}", input.display()))?;

    eprintln!(
        "{} {} ({} blocks, {} lines)",
        "Analyzing".green().bold(),
        input.display(),
        graph.entities.blocks.len(),
        graph.entities.lines.len()
    );

    let registry = registry_for(provider);
    let state = run_extraction_graph(&registry, ExtractionState::new(graph.to_json_pretty()))
        .await
        .context("extraction pipeline failed")?;

    let findings = state
        .audit_findings
        .context("pipeline produced no audit findings")?;
    let table = state
        .corrected_equipment_table
        .context("pipeline produced no corrected table")?;

    if findings.findings.is_empty() {
        eprintln!("{} no audit findings", "ok".green().bold());
    } else {
        println!("{}\n", findings.to_markdown());
    }
    println!("{}", table.to_markdown());

    let name = name
        .map(str::to_string)
        .or_else(|| input.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "run".to_string());
    let mut run = Run::new(&name, input);
    run.start_processing()?;
    run.complete_processing(table.rows)?;

    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("run.json"));
    fs::write(&out, serde_json::to_string_pretty(&run)?)?;
    eprintln!(
        "{} {}",
        "wrote".green().bold(),
        out.display().to_string().bold()
    );
    Ok(())
}

async fn cmd_describe(run_file: &Path, provider: &str, completed_by: &str) -> Result<()> {
    let contents = fs::read_to_string(run_file)
        .with_context(|| format!("reading {}", run_file.display()))?;
    let mut run: Run = serde_json::from_str(&contents)
        .with_context(|| format!("parsing run document {}", run_file.display()))?;

    match run.status() {
        RunStatus::Completed => bail!("run is already completed"),
        RunStatus::Failed => bail!(
            "run failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        ),
        RunStatus::Pending | RunStatus::Processing | RunStatus::GeneratingDescription => {
            bail!("run is not ready for review (status: {})", run.status())
        }
        RunStatus::ReadyForReview | RunStatus::Draft => run.open_review()?,
        RunStatus::UnderReview => {}
    }

    let markdown = run
        .overlay()
        .final_table_to_markdown(run.original_table(), FINAL_TABLE_TITLE);
    println!("{markdown}\n");
    eprintln!(
        "{} {} rows, {}, {} modified",
        "Describing".green().bold(),
        run.equipment_count(),
        run.progress_display(),
        run.overlay().modified_count()
    );

    run.finalize(completed_by)?;

    let registry = registry_for(provider);
    let state = run_generation_graph(&registry, GenerationState::new(markdown))
        .await
        .context("narrative generation failed")?;
    let narrative = state
        .process_description
        .context("pipeline produced no process description")?;

    run.complete_generation(&narrative)?;
    fs::write(run_file, serde_json::to_string_pretty(&run)?)?;

    println!("{narrative}");
    eprintln!(
        "{} {}",
        "wrote".green().bold(),
        run_file.display().to_string().bold()
    );
    Ok(())
}
