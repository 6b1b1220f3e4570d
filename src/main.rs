use std::path::PathBuf;
use std::str::FromStr;

use sitesafe::common::VideoRef;
use sitesafe::pipeline::collaborators::{FfmpegFrameSource, FrameSource};
use sitesafe::{AppError, CollaboratorError, Configuration, PipelineError};
use tracing::{info, Level};

fn init_logging(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn usage() -> AppError {
    AppError::InvalidConfig("usage: sitesafe <video> [config file]".to_string())
}

// Samples frames from a site video with the configured extraction settings.
// The remaining collaborators are network services wired up by the embedding
// application through `SafetyPipeline::builder`.
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let mut args = std::env::args().skip(1);
    let video = VideoRef::new(args.next().ok_or_else(usage)?);
    let config_path = args.next().map(PathBuf::from);

    let configuration = Configuration::load(config_path.as_deref())?;
    init_logging(&configuration.log_level);

    let source = FfmpegFrameSource::new();
    let frames = source
        .extract_frames(
            &video,
            configuration.extraction.fps,
            configuration.extraction.max_frames,
        )
        .await
        .map_err(|e| match e {
            CollaboratorError::InvalidResponse { reason, .. } => {
                PipelineError::NoFramesExtracted(format!("{}: {}", video, reason))
            }
            other => PipelineError::ExtractionFailure(other.to_string()),
        })?;

    if frames.is_empty() {
        return Err(PipelineError::NoFramesExtracted(video.to_string()).into());
    }

    for frame in &frames {
        info!(
            "Frame {} at {:.2}s ({}x{})",
            frame.index(),
            frame.timestamp(),
            frame.image().width(),
            frame.image().height()
        );
    }
    info!("Extracted {} frames from {}", frames.len(), video);
    Ok(())
}
