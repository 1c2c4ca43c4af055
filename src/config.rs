use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;
use std::fmt::Display;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Per-file upload ceiling in bytes.
    pub max_upload_bytes: u64,
    /// Files accepted by one upload request.
    pub max_files: usize,
    /// Bound on every engine invocation (each ffmpeg pass separately).
    pub engine_timeout: Duration,
    /// Artifacts older than this are swept.
    pub max_age: Duration,
    pub sweep_interval: Duration,
    pub rate_limit_max: NonZeroU32,
    pub rate_limit_window: Duration,
    pub ghostscript_bin: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub libreoffice_bin: String,
    pub imagemagick_bin: String,
    /// Start even if an engine binary fails its availability probe.
    pub allow_missing_engines: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File compression and conversion service")]
pub struct Args {
    /// Host to bind to (overrides FILE_FORGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_FORGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding uploaded and derived files (overrides FILE_FORGE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Per-file upload limit in bytes (overrides FILE_FORGE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Files per upload request (overrides FILE_FORGE_MAX_FILES)
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Engine timeout in seconds (overrides FILE_FORGE_ENGINE_TIMEOUT_SECS)
    #[arg(long)]
    pub engine_timeout_secs: Option<u64>,

    /// Retention window in seconds (overrides FILE_FORGE_MAX_AGE_SECS)
    #[arg(long)]
    pub max_age_secs: Option<u64>,

    /// Seconds between retention sweeps (overrides FILE_FORGE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Requests per client IP per window on /api (overrides FILE_FORGE_RATE_LIMIT_MAX)
    #[arg(long)]
    pub rate_limit_max: Option<u32>,

    /// Rate limit window in seconds (overrides FILE_FORGE_RATE_LIMIT_WINDOW_SECS)
    #[arg(long)]
    pub rate_limit_window_secs: Option<u64>,

    /// Ghostscript binary (overrides FILE_FORGE_GHOSTSCRIPT_BIN)
    #[arg(long)]
    pub ghostscript_bin: Option<String>,

    /// ffmpeg binary (overrides FILE_FORGE_FFMPEG_BIN)
    #[arg(long)]
    pub ffmpeg_bin: Option<String>,

    /// ffprobe binary (overrides FILE_FORGE_FFPROBE_BIN)
    #[arg(long)]
    pub ffprobe_bin: Option<String>,

    /// LibreOffice binary (overrides FILE_FORGE_LIBREOFFICE_BIN)
    #[arg(long)]
    pub libreoffice_bin: Option<String>,

    /// ImageMagick binary (overrides FILE_FORGE_IMAGEMAGICK_BIN)
    #[arg(long)]
    pub imagemagick_bin: Option<String>,

    /// Start even when an engine binary is missing
    #[arg(long)]
    pub allow_missing_engines: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse(), |key| env::var(key).ok())
    }

    /// CLI flags win over `FILE_FORGE_*` variables, which win over defaults.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvSource { lookup: &lookup };

        let rate_limit_max = match args.rate_limit_max {
            Some(value) => value,
            None => env.parse("FILE_FORGE_RATE_LIMIT_MAX", 100u32)?,
        };
        let Some(rate_limit_max) = NonZeroU32::new(rate_limit_max) else {
            bail!("rate limit must allow at least one request per window");
        };
        let rate_limit_window = secs(
            args.rate_limit_window_secs,
            env.parse("FILE_FORGE_RATE_LIMIT_WINDOW_SECS", 900)?,
        );
        if rate_limit_window.is_zero() {
            bail!("rate limit window must be at least one second");
        }
        let max_files = args
            .max_files
            .unwrap_or(env.parse("FILE_FORGE_MAX_FILES", 10)?);
        if max_files == 0 {
            bail!("max files must be at least 1");
        }
        let sweep_interval = secs(
            args.sweep_interval_secs,
            env.parse("FILE_FORGE_SWEEP_INTERVAL_SECS", 3600)?,
        );
        if sweep_interval.is_zero() {
            bail!("sweep interval must be at least one second");
        }

        let allow_missing_engines = args.allow_missing_engines
            || env.parse("FILE_FORGE_ALLOW_MISSING_ENGINES", false)?;

        Ok(Self {
            host: args.host.unwrap_or(env.string("FILE_FORGE_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env.parse("FILE_FORGE_PORT", 4000)?),
            storage_dir: args
                .storage_dir
                .unwrap_or(env.string("FILE_FORGE_STORAGE_DIR", "./data/temp")),
            max_upload_bytes: args
                .max_upload_bytes
                .unwrap_or(env.parse("FILE_FORGE_MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?),
            max_files,
            engine_timeout: secs(
                args.engine_timeout_secs,
                env.parse("FILE_FORGE_ENGINE_TIMEOUT_SECS", 300)?,
            ),
            max_age: secs(args.max_age_secs, env.parse("FILE_FORGE_MAX_AGE_SECS", 3600)?),
            sweep_interval,
            rate_limit_max,
            rate_limit_window,
            ghostscript_bin: args
                .ghostscript_bin
                .unwrap_or(env.string("FILE_FORGE_GHOSTSCRIPT_BIN", "gs")),
            ffmpeg_bin: args
                .ffmpeg_bin
                .unwrap_or(env.string("FILE_FORGE_FFMPEG_BIN", "ffmpeg")),
            ffprobe_bin: args
                .ffprobe_bin
                .unwrap_or(env.string("FILE_FORGE_FFPROBE_BIN", "ffprobe")),
            libreoffice_bin: args
                .libreoffice_bin
                .unwrap_or(env.string("FILE_FORGE_LIBREOFFICE_BIN", "soffice")),
            imagemagick_bin: args
                .imagemagick_bin
                .unwrap_or(env.string("FILE_FORGE_IMAGEMAGICK_BIN", "convert")),
            allow_missing_engines,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whole-request body cap: every file at the per-file limit plus
    /// multipart framing.
    pub fn body_limit(&self) -> usize {
        let files = self.max_upload_bytes.saturating_mul(self.max_files as u64);
        usize::try_from(files.saturating_add(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

fn secs(flag: Option<u64>, env_value: u64) -> Duration {
    Duration::from_secs(flag.unwrap_or(env_value))
}

struct EnvSource<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<'_, F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.lookup)(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("{}", err))
                .with_context(|| format!("parsing {} value `{}`", key, value)),
            None => Ok(default),
        }
    }
}
