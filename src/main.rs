use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use image::ImageFormat;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, Level};
use walkdir::WalkDir;

use waste_sort_rs::{AggregatedResult, Config, OnnxPipeline};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify the waste items in one stored upload
    Classify {
        image: PathBuf,

        #[arg(short, long, default_value = "uploads")]
        transient_dir: PathBuf,

        /// Delete the upload when it cannot be decoded
        #[arg(long)]
        discard_on_failure: bool,
    },
    /// Classify every image under a directory, one JSON line per image
    Batch {
        input_dir: PathBuf,

        #[arg(short, long, default_value = "uploads")]
        transient_dir: PathBuf,

        #[arg(short = 'j', long, default_value_t = std::thread::available_parallelism().map_or(1, |n| n.get()))]
        num_threads: usize,
    },
    /// Delete an upload and its stored summaries
    Delete {
        filename: String,

        #[arg(short, long, default_value = "uploads")]
        upload_dir: PathBuf,
    },
    /// Print the most recent stored summaries
    Recent {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct BatchLine<'a> {
    image: &'a Path,
    #[serde(flatten)]
    outcome: BatchOutcome,
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchOutcome {
    Ok(AggregatedResult),
    Err { error: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let pipeline = OnnxPipeline::from_config(cli.config).context("Invalid configuration")?;

    match cli.command {
        Command::Classify {
            image,
            transient_dir,
            discard_on_failure,
        } => {
            ensure!(image.exists(), "Image does not exist: {}", image.display());
            match pipeline.classify(&image, &transient_dir) {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    if discard_on_failure && e.is_decode() {
                        fs::remove_file(&image).with_context(|| {
                            format!("Failed to discard upload: {}", image.display())
                        })?;
                    }
                    return Err(e).with_context(|| format!("Prediction failed: {}", image.display()));
                }
            }
        }
        Command::Batch {
            input_dir,
            transient_dir,
            num_threads,
        } => {
            ensure!(
                input_dir.exists(),
                "Input directory does not exist: {}",
                input_dir.display()
            );
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()?;

            let image_paths = WalkDir::new(&input_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| ImageFormat::from_path(e.path()).is_ok())
                .map(|e| e.into_path())
                .collect::<Vec<_>>();

            let progress_bar = ProgressBar::new(image_paths.len() as u64);
            progress_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
                )?
                .progress_chars("#>-"),
            );

            let lines = image_paths
                .par_iter()
                .progress_with(progress_bar.clone())
                .map(|path| {
                    let outcome = match pipeline.classify(path, &transient_dir) {
                        Ok(result) => BatchOutcome::Ok(result),
                        Err(e) => {
                            error!(image = %path.display(), error = %e, "classification failed");
                            BatchOutcome::Err {
                                error: e.to_string(),
                            }
                        }
                    };
                    serde_json::to_string(&BatchLine {
                        image: path,
                        outcome,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            progress_bar.finish();
            for line in lines {
                println!("{line}");
            }
        }
        Command::Delete {
            filename,
            upload_dir,
        } => {
            let removed = pipeline.forget(&filename, &upload_dir)?;
            println!("{}", serde_json::json!({ "success": true, "records_removed": removed }));
        }
        Command::Recent { limit } => {
            println!("{}", serde_json::to_string_pretty(&pipeline.recent(limit))?);
        }
    }

    Ok(())
}
