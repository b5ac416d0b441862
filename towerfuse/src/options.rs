use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Fuse tower height readings from several sources into one height per
/// tower.
#[derive(Parser, Debug, Clone)]
pub struct Cli {
    /// JSON file with "fusion" and "normalizer" settings.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Worker threads, overrides the config file.
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// JSON array of {"source": ..., "reading": {...}} objects.
    pub input: PathBuf,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print fused towers and failed clusters as JSON.
    Json,

    /// Print fused towers as CSV.
    Csv,

    /// Print count, height statistics and confidence breakdown.
    Report,
}
