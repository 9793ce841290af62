use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use awbpatch::batch::{run_inject, scan_container};
use awbpatch::context::RunContext;
use awbpatch::editor::{EditorOptions, SizeMode};
use awbpatch::offsets::{OffsetUpdate, TableStrategy};
use awbpatch::tables::Tables;

#[derive(Parser)]
#[command(name = "awbpatch", version, about = "Replace HCA tracks inside AWB containers")]
struct Cli {
    /// Directory with the CSV lookup tables (default: executable dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory for segment index caches (default: executable dir).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index AWB or companion asset files and refresh their caches.
    Scan {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Also write every segment to <file stem>/<index>.hca.
        #[arg(long)]
        extract: bool,
    },
    /// Inject every .hca file in DIR into the containers of its parent dir.
    Inject {
        dir: PathBuf,
        /// Never resize containers; reject replacements that do not fit.
        #[arg(long)]
        fixed_size: bool,
        /// Do not pad resized segments to 32-byte boundaries.
        #[arg(long)]
        no_padding: bool,
        /// Offset table layout of the companion assets.
        #[arg(long, value_enum, default_value = "ported")]
        table_layout: TableLayout,
        /// How offset table entries are rewritten after a resize.
        #[arg(long, value_enum, default_value = "absolute")]
        offset_update: OffsetMode,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum TableLayout {
    Ported,
    Legacy,
}

impl TableLayout {
    fn strategy(&self) -> TableStrategy {
        match self {
            TableLayout::Ported => TableStrategy::Ported,
            TableLayout::Legacy => TableStrategy::Legacy,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
enum OffsetMode {
    Absolute,
    /// Experimental.
    Delta,
}

impl OffsetMode {
    fn update(&self) -> OffsetUpdate {
        match self {
            OffsetMode::Absolute => OffsetUpdate::Absolute,
            OffsetMode::Delta => OffsetUpdate::Delta,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut ctx = RunContext::new(cli.data_dir, cli.cache_dir);
    let tables = Tables::load(&ctx.data_dir)
        .with_context(|| format!("Load lookup tables from {}", ctx.data_dir.display()))?;

    let clean = match cli.command {
        Commands::Scan { files, extract } => {
            ctx.extract = extract;
            scan_files(&ctx, &tables, &files)
        }
        Commands::Inject {
            dir,
            fixed_size,
            no_padding,
            table_layout,
            offset_update,
        } => {
            ctx.editor = EditorOptions {
                mode: if fixed_size { SizeMode::Fixed } else { SizeMode::Variable },
                padding: !no_padding,
            };
            ctx.table_strategy = table_layout.strategy();
            ctx.offset_update = offset_update.update();
            info!(layout = ctx.table_strategy.as_str(), fixed_size, "Starting injection");
            run_inject(&ctx, &tables, &dir)?.is_clean()
        }
    };

    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {log_level}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn scan_files(ctx: &RunContext, tables: &Tables, files: &[PathBuf]) -> bool {
    let mut clean = true;
    for file in files {
        if let Err(err) = scan_container(ctx, tables, file) {
            error!(file = %file.display(), "{err:#}");
            clean = false;
        }
    }
    clean
}
