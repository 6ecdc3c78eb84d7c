use std::path::PathBuf;

use anyhow::Context;
use spectre::{ResourceCandidate, Spectre};

use super::Output;

#[derive(Debug, Clone, clap::Args)]
pub struct AnalyzeArgs {
    /// Maximum number of distinct templates to analyze.
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Print the suggested resources as a YAML configuration.
    #[arg(short = 'g', long)]
    pub generate_config: bool,

    /// Write the YAML configuration to a file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Persist the candidates as inferred resources.
    #[arg(long)]
    pub commit: bool,
}

pub fn analyze(spectre: &Spectre, args: &AnalyzeArgs, out: Output) -> anyhow::Result<()> {
    let limit = args.limit.unwrap_or(spectre.config().analyzer.limit);
    let analyzer = spectre.analyzer();
    let candidates = analyzer.analyze(limit)?;

    if candidates.is_empty() {
        tracing::warn!("No captured URLs found in {}", spectre.database_path().display());
    }

    if args.generate_config || args.output.is_some() {
        let yaml = analyzer.generate_config(&candidates).to_yaml()?;
        match &args.output {
            Some(path) => {
                std::fs::write(path, &yaml)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                tracing::info!("Configuration written to {}", path.display());
            }
            None => print!("{yaml}"),
        }
    } else {
        out.emit(&candidates, |c| print_candidates(c))?;
    }

    if args.commit {
        let committed = analyzer.commit(&candidates)?;
        if !out.json {
            println!("Committed {} resources", committed.len());
        }
    }
    Ok(())
}

fn print_candidates(candidates: &[ResourceCandidate]) {
    if candidates.is_empty() {
        println!("No resource candidates.");
        return;
    }
    println!(
        "{:<24} {:<7} {:>8} {:<12} TEMPLATE",
        "NAME", "METHOD", "SAMPLES", "PRIMARY KEY"
    );
    for c in candidates {
        println!(
            "{:<24} {:<7} {:>8} {:<12} {}",
            c.suggested_name,
            c.method,
            c.sample_count,
            c.primary_key.as_deref().unwrap_or("-"),
            c.template
        );
    }
}
