//! FFmpeg video recompression and container conversion.
//!
//! Size-capped compression probes the duration with ffprobe and runs a
//! two-pass encode at the bitrate that fits the cap. Each pass gets the
//! full engine timeout.

use super::{Engine, EngineError, EngineJob, process};
use crate::services::strategy::{QualityTier, Strategy, target_bitrate_kbps, video_settings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

const AUDIO_BITRATE: &str = "128k";

#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: String,
    ffprobe: String,
}

/// WebM gets VP9/Opus; every other container H.264/AAC.
fn is_webm(format: &str) -> bool {
    format == "webm"
}

impl FfmpegEngine {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn base(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-i"]).arg(input);
        cmd
    }

    /// Single pass constant-quality encode.
    pub fn build_crf_command(
        &self,
        format: &str,
        tier: QualityTier,
        input: &Path,
        output: &Path,
    ) -> Command {
        let settings = video_settings(tier);
        let mut cmd = self.base(input);
        if is_webm(format) {
            cmd.args(["-c:v", "libvpx-vp9", "-b:v", "0"])
                .arg("-crf")
                .arg(settings.crf.to_string())
                .args(["-c:a", "libopus", "-b:a", AUDIO_BITRATE]);
        } else {
            cmd.args(["-c:v", "libx264"])
                .arg("-crf")
                .arg(settings.crf.to_string())
                .args(["-preset", settings.preset])
                .args(["-c:a", "aac", "-b:a", AUDIO_BITRATE]);
        }
        cmd.arg(output);
        cmd
    }

    /// Analysis pass: video only, written to the null muxer.
    pub fn build_first_pass(
        &self,
        format: &str,
        bitrate_kbps: u64,
        passlog: &Path,
        input: &Path,
    ) -> Command {
        let mut cmd = self.base(input);
        cmd.arg("-c:v")
            .arg(if is_webm(format) { "libvpx-vp9" } else { "libx264" })
            .arg("-b:v")
            .arg(format!("{bitrate_kbps}k"))
            .args(["-pass", "1", "-passlogfile"])
            .arg(passlog)
            .args(["-an", "-f", "null", "-"]);
        cmd
    }

    /// Final pass at the same bitrate, with audio.
    pub fn build_second_pass(
        &self,
        format: &str,
        bitrate_kbps: u64,
        passlog: &Path,
        input: &Path,
        output: &Path,
    ) -> Command {
        let mut cmd = self.base(input);
        cmd.arg("-c:v")
            .arg(if is_webm(format) { "libvpx-vp9" } else { "libx264" })
            .arg("-b:v")
            .arg(format!("{bitrate_kbps}k"))
            .args(["-pass", "2", "-passlogfile"])
            .arg(passlog);
        if is_webm(format) {
            cmd.args(["-c:a", "libopus", "-b:a", AUDIO_BITRATE]);
        } else {
            cmd.args(["-c:a", "aac", "-b:a", AUDIO_BITRATE]);
        }
        cmd.arg(output);
        cmd
    }

    /// Container conversion with FFmpeg's default codecs for the target.
    pub fn build_reformat_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = self.base(input);
        cmd.arg(output);
        cmd
    }

    pub fn build_probe_command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input);
        cmd
    }

    /// Duration of `input` in seconds.
    pub async fn probe_duration(&self, input: &Path, timeout: Duration) -> Result<f64, EngineError> {
        let out = process::run("ffprobe", self.build_probe_command(input), timeout).await?;
        parse_duration(&out.stdout)
    }

    async fn two_pass(
        &self,
        format: &str,
        bitrate_kbps: u64,
        job: &EngineJob,
    ) -> Result<(), EngineError> {
        let passlog = job.workdir.join(format!(".2pass-{}", Uuid::new_v4()));
        let result = async {
            let first = self.build_first_pass(format, bitrate_kbps, &passlog, &job.input);
            process::run(self.name(), first, job.timeout).await?;
            let second =
                self.build_second_pass(format, bitrate_kbps, &passlog, &job.input, &job.output);
            process::run(self.name(), second, job.timeout).await?;
            Ok::<(), EngineError>(())
        }
        .await;
        remove_passlogs(&passlog).await;
        result
    }
}

/// Parse ffprobe's bare `duration` output.
pub fn parse_duration(stdout: &str) -> Result<f64, EngineError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty());
    let Some(line) = line else {
        return Err(EngineError::Probe("ffprobe printed no duration".into()));
    };
    match line.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(EngineError::Probe(format!("unparseable duration `{}`", line))),
    }
}

async fn remove_passlogs(prefix: &Path) {
    let base = prefix.display().to_string();
    for suffix in ["-0.log", "-0.log.mbtree", "-0.log.temp", "-0.log.mbtree.temp"] {
        let path = PathBuf::from(format!("{base}{suffix}"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove {}: {}", path.display(), err),
        }
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn handles(&self, strategy: &Strategy) -> bool {
        matches!(
            strategy,
            Strategy::VideoRecompress { .. } | Strategy::VideoReformat { .. }
        )
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        process::probe_binary(self.name(), &self.ffmpeg, "-version").await?;
        process::probe_binary("ffprobe", &self.ffprobe, "-version").await
    }

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
        match strategy {
            Strategy::VideoRecompress {
                format,
                tier,
                max_size_mb,
            } => {
                if let Some(mb) = max_size_mb {
                    let duration = self.probe_duration(&job.input, job.timeout).await?;
                    match target_bitrate_kbps(*mb, duration) {
                        Some(kbps) => {
                            debug!("two-pass at {}k for {:.1}s", kbps, duration);
                            return self.two_pass(format, kbps, job).await;
                        }
                        None => warn!(
                            "no usable bitrate for {} MB over {}s, using {:?} quality",
                            mb, duration, tier
                        ),
                    }
                }
                let cmd = self.build_crf_command(format, *tier, &job.input, &job.output);
                process::run(self.name(), cmd, job.timeout).await?;
                Ok(())
            }
            Strategy::VideoReformat { .. } => {
                let cmd = self.build_reformat_command(&job.input, &job.output);
                process::run(self.name(), cmd, job.timeout).await?;
                Ok(())
            }
            _ => Err(EngineError::Unhandled(strategy.name())),
        }
    }
}
