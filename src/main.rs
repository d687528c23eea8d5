use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use market_structure::logging::init_logging;
use market_structure::scoring::{ProfileDocument, ScoringConfig};
use market_structure::{ContextKey, PipelineContext, RawBar, StructureConfig, Timeframe};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "structure-audit")]
#[command(about = "Run the market structure pipeline over stored bars and audit its output")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build structure from a bars file and print the snapshot and score as JSON
    Analyze {
        /// JSON array of raw bars
        #[arg(short, long)]
        bars: PathBuf,

        #[arg(short, long, default_value = "I2601")]
        symbol: String,

        #[arg(short, long, default_value = "5m")]
        timeframe: Timeframe,

        /// Structure parameters (JSON)
        #[arg(long, env = "STRUCTURE_CONFIG")]
        structure_config: Option<PathBuf>,

        /// Scoring profile document (JSON)
        #[arg(long, env = "SCORING_PROFILE")]
        profile: Option<PathBuf>,

        /// Most recent entities of each kind to include
        #[arg(long, default_value = "20")]
        depth: usize,

        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check incremental against batch processing and run the invariant audit
    Verify {
        /// JSON array of raw bars
        #[arg(short, long)]
        bars: PathBuf,

        #[arg(short, long, default_value = "I2601")]
        symbol: String,

        #[arg(short, long, default_value = "5m")]
        timeframe: Timeframe,

        /// Structure parameters (JSON)
        #[arg(long, env = "STRUCTURE_CONFIG")]
        structure_config: Option<PathBuf>,

        /// Scoring profile document (JSON)
        #[arg(long, env = "SCORING_PROFILE")]
        profile: Option<PathBuf>,
    },

    /// Validate a scoring profile document and print resolved configurations
    CheckConfig {
        /// Scoring profile document (JSON)
        #[arg(short, long)]
        profile: PathBuf,

        /// Symbols to resolve (defaults to every symbol the document names)
        #[arg(short, long)]
        symbol: Vec<String>,

        /// Timeframes to resolve (defaults to all)
        #[arg(short, long)]
        timeframe: Vec<Timeframe>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose)?;

    match args.command {
        Commands::Analyze {
            bars,
            symbol,
            timeframe,
            structure_config,
            profile,
            depth,
            output,
        } => {
            let key = ContextKey::new(symbol, timeframe);
            run_analyze(&key, &bars, structure_config.as_deref(), profile.as_deref(), depth, output.as_deref())?;
        }
        Commands::Verify {
            bars,
            symbol,
            timeframe,
            structure_config,
            profile,
        } => {
            let key = ContextKey::new(symbol, timeframe);
            run_verify(&key, &bars, structure_config.as_deref(), profile.as_deref())?;
        }
        Commands::CheckConfig {
            profile,
            symbol,
            timeframe,
        } => {
            run_check_config(&profile, symbol, timeframe)?;
        }
    }

    Ok(())
}

fn load_bars(path: &Path) -> Result<Vec<RawBar>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bars: Vec<RawBar> =
        serde_json::from_str(&text).with_context(|| format!("parsing bars from {}", path.display()))?;
    info!("Loaded {} bars from {}", bars.len(), path.display());
    Ok(bars)
}

fn load_structure(path: Option<&Path>) -> Result<StructureConfig> {
    let Some(path) = path else {
        return Ok(StructureConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    StructureConfig::from_json_str(&text).with_context(|| format!("structure config {}", path.display()))
}

fn load_profile(path: &Path) -> Result<ProfileDocument> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ProfileDocument::from_json_str(&text).with_context(|| format!("scoring profile {}", path.display()))
}

fn load_scoring(key: &ContextKey, path: Option<&Path>) -> Result<ScoringConfig> {
    match path {
        Some(path) => Ok(load_profile(path)?.resolve(&key.symbol, key.timeframe)?),
        None => Ok(ScoringConfig::default()),
    }
}

fn run_analyze(
    key: &ContextKey,
    bars_path: &Path,
    structure_path: Option<&Path>,
    profile_path: Option<&Path>,
    depth: usize,
    output: Option<&Path>,
) -> Result<()> {
    let bars = load_bars(bars_path)?;
    let structure = load_structure(structure_path)?;
    let scoring = load_scoring(key, profile_path)?;

    let context = PipelineContext::from_batch(key.clone(), structure, scoring, bars)
        .with_context(|| format!("building structure for {}", key))?;
    let snapshot = context.snapshot(depth);
    if let Some(result) = &snapshot.score {
        info!(
            "{}: score {:.3} stage {} ({} swings, {} trends, {} zones)",
            key,
            result.score,
            result.stage,
            context.sealed_swings().len(),
            context.trends().len(),
            context.zones().len()
        );
    }

    let json = serde_json::to_string_pretty(&snapshot)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote snapshot to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn run_verify(
    key: &ContextKey,
    bars_path: &Path,
    structure_path: Option<&Path>,
    profile_path: Option<&Path>,
) -> Result<()> {
    let bars = load_bars(bars_path)?;
    let structure = load_structure(structure_path)?;
    let scoring = load_scoring(key, profile_path)?;

    let batch = PipelineContext::from_batch(key.clone(), structure.clone(), scoring.clone(), bars.clone())
        .context("batch build")?;
    let mut incremental = PipelineContext::new(key.clone(), structure, scoring)?;
    incremental.extend(bars).context("incremental build")?;

    let mut mismatches = Vec::new();
    if incremental.consolidated() != batch.consolidated() {
        mismatches.push("consolidated bars");
    }
    if incremental.labels() != batch.labels() {
        mismatches.push("fractal labels");
    }
    if incremental.fractals() != batch.fractals() {
        mismatches.push("fractals");
    }
    if incremental.sealed_swings() != batch.sealed_swings() || incremental.active_swing() != batch.active_swing() {
        mismatches.push("swings");
    }
    if incremental.trends() != batch.trends() {
        mismatches.push("trends");
    }
    if incremental.zones() != batch.zones() {
        mismatches.push("key zones");
    }
    if incremental.latest_result() != batch.latest_result() {
        mismatches.push("score");
    }

    incremental.audit().context("incremental invariant audit")?;
    batch.audit().context("batch invariant audit")?;

    info!(
        "{}: {} raw -> {} consolidated, {} fractals, {} swings, {} trends, {} zones",
        key,
        incremental.raw().len(),
        incremental.consolidated().len(),
        incremental.fractals().len(),
        incremental.sealed_swings().len(),
        incremental.trends().len(),
        incremental.zones().len()
    );

    if !mismatches.is_empty() {
        for what in &mismatches {
            warn!("incremental and batch disagree on {}", what);
        }
        bail!("{} entity sets differ between incremental and batch", mismatches.len());
    }
    info!("Incremental and batch results are identical; all invariants hold");
    Ok(())
}

fn run_check_config(path: &Path, symbols: Vec<String>, timeframes: Vec<Timeframe>) -> Result<()> {
    let document = load_profile(path)?;
    let symbols: Vec<String> = if symbols.is_empty() {
        document.symbols().into_iter().collect()
    } else {
        symbols
    };
    let timeframes = if timeframes.is_empty() {
        Timeframe::ALL.to_vec()
    } else {
        timeframes
    };
    info!("Profile {} is valid", path.display());

    for symbol in &symbols {
        for timeframe in &timeframes {
            let resolved = document.resolve(symbol, *timeframe)?;
            println!("{}.{} {}", symbol, timeframe, serde_json::to_string(&resolved)?);
        }
    }
    Ok(())
}
