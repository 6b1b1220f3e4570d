use std::process::Stdio;

use async_trait::async_trait;
use image::RgbImage;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::FrameSource;
use crate::common::{Frame, VideoRef};
use crate::error::CollaboratorError;

const NAME: &str = "ffmpeg";

/// Width, height and frame rate of the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoProperties {
    /// Parses `ffprobe -show_entries stream=width,height,r_frame_rate` output
    /// in `default=noprint_wrappers=1:nokey=1` format.
    pub fn parse_probe(output: &str) -> Result<Self, String> {
        let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
        let (width, height, rate) = match (lines.next(), lines.next(), lines.next()) {
            (Some(w), Some(h), Some(r)) => (w, h, r),
            _ => return Err(format!("unexpected ffprobe output: {:?}", output)),
        };

        let width: u32 = width
            .parse()
            .map_err(|_| format!("bad width '{}'", width))?;
        let height: u32 = height
            .parse()
            .map_err(|_| format!("bad height '{}'", height))?;
        if width == 0 || height == 0 {
            return Err(format!("degenerate frame size {}x{}", width, height));
        }

        // "30" or "30000/1001"
        let fps = match rate.split_once('/') {
            Some((num, den)) => {
                let num: f64 = num.parse().map_err(|_| format!("bad frame rate '{}'", rate))?;
                let den: f64 = den.parse().map_err(|_| format!("bad frame rate '{}'", rate))?;
                if den == 0.0 {
                    return Err(format!("bad frame rate '{}'", rate));
                }
                num / den
            }
            None => rate
                .parse()
                .map_err(|_| format!("bad frame rate '{}'", rate))?,
        };

        Ok(Self { width, height, fps })
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Samples frames by piping raw `rgb24` output of the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn probe(&self, video: &VideoRef) -> Result<VideoProperties, CollaboratorError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(video.path())
            .output()
            .await
            .map_err(|e| CollaboratorError::failed(NAME, format!("could not run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(CollaboratorError::invalid(
                NAME,
                format!(
                    "unreadable video: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        VideoProperties::parse_probe(&String::from_utf8_lossy(&output.stdout))
            .map_err(|reason| CollaboratorError::invalid(NAME, reason))
    }
}

impl Default for FfmpegFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn extract_frames(
        &self,
        video: &VideoRef,
        fps: u32,
        max_frames: usize,
    ) -> Result<Vec<Frame>, CollaboratorError> {
        let props = self.probe(video).await?;
        info!(
            "Processing video {}: {}x{} @ {:.2}fps",
            video, props.width, props.height, props.fps
        );

        let fps_filter = format!("fps={}", fps.max(1));
        let mut child = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(video.path())
            .args([
                "-vf",
                fps_filter.as_str(),
                "-f",
                "image2pipe",
                "-pix_fmt",
                "rgb24",
                "-vcodec",
                "rawvideo",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CollaboratorError::failed(NAME, format!("could not run ffmpeg: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CollaboratorError::failed(NAME, "ffmpeg stdout not captured"))?;

        let mut frames = Vec::with_capacity(max_frames);
        let mut buffer = vec![0u8; props.frame_bytes()];
        while frames.len() < max_frames {
            // A short read means the stream ended mid-frame or cleanly; both end extraction.
            if stdout.read_exact(&mut buffer).await.is_err() {
                break;
            }
            let index = frames.len() as u32;
            let image = RgbImage::from_raw(props.width, props.height, buffer.clone())
                .ok_or_else(|| CollaboratorError::invalid(NAME, "frame buffer size mismatch"))?;
            frames.push(Frame::new(index, index as f64 / fps.max(1) as f64, image));
            debug!("Extracted frame {}", index);
        }

        drop(stdout);
        if frames.len() >= max_frames {
            let _ = child.kill().await;
        } else {
            match child.wait().await {
                Ok(status) if !status.success() && frames.is_empty() => {
                    return Err(CollaboratorError::invalid(
                        NAME,
                        format!("unreadable video, ffmpeg exited with {}", status),
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to reap ffmpeg: {}", e),
            }
        }

        info!("Extracted {} frames from {}", frames.len(), video);
        Ok(frames)
    }
}
