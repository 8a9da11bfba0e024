use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use terralens::{load_map_image, AnalysisConfig, MapAnalyzer, NullEngine, QualityPreset};

#[derive(Parser)]
#[command(name = "terralens")]
#[command(about = "TerraLens - map image analysis: terrain features and object placements", long_about = None)]
struct Cli {
    /// Input map image path
    image: PathBuf,

    /// Minimum detection confidence
    #[arg(long, default_value_t = 0.5)]
    confidence_threshold: f32,

    /// IoU threshold for non-max suppression
    #[arg(long, default_value_t = 0.45)]
    nms_threshold: f32,

    /// Height field resolution preset
    #[arg(long, value_enum, default_value_t = Quality::Standard)]
    quality: Quality,

    /// Print per-stage progress to stderr
    #[arg(long)]
    progress: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Quality {
    Draft,
    Standard,
    High,
}

impl From<Quality> for QualityPreset {
    fn from(q: Quality) -> Self {
        match q {
            Quality::Draft => QualityPreset::Draft,
            Quality::Standard => QualityPreset::Standard,
            Quality::High => QualityPreset::High,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum OutputFormat {
    /// JSON output with full details
    Json,
    /// Plain text, one line per terrain feature or placement
    Text,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terralens=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AnalysisConfig::default();
    config.detector.confidence_threshold = cli.confidence_threshold;
    config.detector.nms_threshold = cli.nms_threshold;
    config.quality = cli.quality.into();

    let mut analyzer = MapAnalyzer::new(NullEngine).with_config(config);
    if cli.progress {
        analyzer = analyzer.with_progress(Arc::new(|stage, fraction| {
            eprintln!("[{:>3.0}%] {}", fraction * 100.0, stage);
        }));
    }

    let image = load_map_image(&cli.image)?;
    let results = analyzer.analyze(&image).await?;

    match cli.format {
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "terrain_modifications": results.terrain_modifications,
                "object_placements": results.object_placements,
                "metadata": results.metadata,
            });
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        }
        OutputFormat::Text => {
            for tm in &results.terrain_modifications {
                println!(
                    "terrain\t{}\tbase {:.1}\tslope {:.1}\t{}",
                    tm.terrain_type, tm.base_height, tm.slope, tm.description
                );
            }
            for op in &results.object_placements {
                println!(
                    "object\t{}\tat ({:.2}, {:.2})\trot {:.1}\tscale {:.2}\tconf {:.2}",
                    op.object_type,
                    op.position[0],
                    op.position[1],
                    op.rotation,
                    op.scale,
                    op.confidence
                );
            }
        }
    }

    Ok(())
}
