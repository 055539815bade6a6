/// Daemon configuration, read from the environment (and `.env` via dotenvy).
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use smasher_downloader::MAX_PARTS;
use smasher_shared::errors::{SmasherError, SmasherResult};
use smasher_shared::progress::DEFAULT_BAR_WIDTH;

pub const DEFAULT_CODEC_PARAMS: &str = "-c:v copy -c:a copy -c:s copy -map 0";

#[derive(Debug, Clone)]
pub struct Config {
    pub download_dir: PathBuf,
    pub encode_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub ytdlp_bin: String,
    pub cookies_path: Option<PathBuf>,
    pub default_codec_params: String,
    pub download_parts: usize,
    pub progress_interval: Duration,
    pub transcode_poll_interval: Duration,
    pub extract_workers: usize,
    pub max_processes: usize,
    pub bar_width: usize,
}

impl Config {
    pub fn from_env() -> SmasherResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> SmasherResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let download_dir = PathBuf::from(get("DOWNLOAD_DIR").unwrap_or_else(|| "./downloads".to_string()));
        let encode_dir = get("ENCODE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| download_dir.join("Encode"));

        let config = Self {
            encode_dir,
            download_dir,
            ffmpeg_bin: get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: get("FFPROBE_BIN").unwrap_or_else(|| "ffprobe".to_string()),
            ytdlp_bin: get("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            cookies_path: get("COOKIES_PATH").map(PathBuf::from),
            default_codec_params: get("DEFAULT_CODEC_PARAMS")
                .unwrap_or_else(|| DEFAULT_CODEC_PARAMS.to_string()),
            download_parts: parse_or(&get, "DOWNLOAD_PARTS", 10)?,
            progress_interval: Duration::from_secs(parse_or(&get, "PROGRESS_INTERVAL_SECS", 5)?),
            transcode_poll_interval: Duration::from_secs(parse_or(&get, "TRANSCODE_POLL_SECS", 10)?),
            extract_workers: parse_or(&get, "EXTRACT_WORKERS", 4)?,
            max_processes: parse_or(&get, "MAX_PROCESSES", 8)?,
            bar_width: parse_or(&get, "BAR_WIDTH", DEFAULT_BAR_WIDTH)?,
        };

        for (key, value) in [
            ("DOWNLOAD_PARTS", config.download_parts),
            ("EXTRACT_WORKERS", config.extract_workers),
            ("MAX_PROCESSES", config.max_processes),
        ] {
            if value == 0 {
                return Err(SmasherError::Config(format!("{} must be at least 1", key)));
            }
        }
        if config.download_parts > MAX_PARTS {
            return Err(SmasherError::Config(format!(
                "DOWNLOAD_PARTS must be at most {}",
                MAX_PARTS
            )));
        }
        if config.transcode_poll_interval.is_zero() {
            return Err(SmasherError::Config("TRANSCODE_POLL_SECS must be at least 1".to_string()));
        }

        Ok(config)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> SmasherResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| SmasherError::Config(format!("{}={:?} is invalid: {}", key, raw, e))),
        None => Ok(default),
    }
}
