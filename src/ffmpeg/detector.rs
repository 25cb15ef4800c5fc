//! 既存FFmpeg検出

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(target_os = "windows")]
const FFMPEG_NAME: &str = "ffmpeg.exe";
#[cfg(not(target_os = "windows"))]
const FFMPEG_NAME: &str = "ffmpeg";

#[cfg(target_os = "windows")]
const FFPROBE_NAME: &str = "ffprobe.exe";
#[cfg(not(target_os = "windows"))]
const FFPROBE_NAME: &str = "ffprobe";

/// FFmpeg検出器
pub struct FfmpegDetector;

/// FFmpegの検出結果
#[derive(Debug, Clone)]
pub struct FfmpegInfo {
    /// FFmpegの実行ファイルパス
    pub ffmpeg_path: PathBuf,
    /// FFprobeの実行ファイルパス
    pub ffprobe_path: Option<PathBuf>,
    /// バージョン文字列
    pub version: String,
    /// メジャーバージョン
    pub major_version: u32,
    /// マイナーバージョン
    pub minor_version: u32,
}

impl FfmpegDetector {
    /// FFmpegを検出（指定パス → FFMPEG_DIR → ビルド時パス → PATH → よくある場所）
    pub fn detect(custom_path: Option<&Path>) -> Result<FfmpegInfo> {
        if let Some(path) = custom_path {
            debug!("Checking configured ffmpeg path: {:?}", path);
            let info = if path.is_dir() {
                Self::check_ffmpeg_in_dir(path)
            } else {
                Self::get_ffmpeg_info(path)
            };
            return info.with_context(|| format!("Configured ffmpeg {:?} is not usable", path));
        }

        if let Ok(ffmpeg_dir) = std::env::var("FFMPEG_DIR") {
            debug!("Checking FFMPEG_DIR: {}", ffmpeg_dir);
            if let Ok(info) = Self::check_ffmpeg_in_dir(Path::new(&ffmpeg_dir)) {
                info!("Found FFmpeg via FFMPEG_DIR: {:?}", info.ffmpeg_path);
                return Ok(info);
            }
        }

        if let Some(bin_path) = option_env!("FFMPEG_BIN_PATH") {
            debug!("Checking FFMPEG_BIN_PATH: {}", bin_path);
            if let Ok(info) = Self::check_ffmpeg_in_dir(Path::new(bin_path)) {
                info!("Found FFmpeg via FFMPEG_BIN_PATH: {:?}", info.ffmpeg_path);
                return Ok(info);
            }
        }

        if let Ok(info) = Self::get_ffmpeg_info(Path::new(FFMPEG_NAME)) {
            info!("Found FFmpeg in PATH: {:?}", info.ffmpeg_path);
            return Ok(info);
        }

        for dir in Self::common_locations() {
            if dir.exists() {
                debug!("Checking common path: {:?}", dir);
                if let Ok(info) = Self::check_ffmpeg_in_dir(&dir) {
                    info!("Found FFmpeg at common location: {:?}", info.ffmpeg_path);
                    return Ok(info);
                }
            }
        }

        Err(anyhow!("FFmpeg not found on this system"))
    }

    /// よくあるインストール場所
    fn common_locations() -> Vec<PathBuf> {
        let mut dirs_to_check = Vec::new();

        #[cfg(target_os = "windows")]
        {
            dirs_to_check.push(PathBuf::from(r"C:\ffmpeg\bin"));
            dirs_to_check.push(PathBuf::from(r"C:\Program Files\FFmpeg\bin"));
            if let Some(home) = dirs::home_dir() {
                dirs_to_check.push(home.join("scoop").join("apps").join("ffmpeg").join("current").join("bin"));
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            dirs_to_check.push(PathBuf::from("/usr/local/bin"));
            dirs_to_check.push(PathBuf::from("/opt/homebrew/bin"));
            dirs_to_check.push(PathBuf::from("/usr/bin"));
        }

        dirs_to_check
    }

    /// 指定したディレクトリ内のFFmpegをチェック
    fn check_ffmpeg_in_dir(dir: &Path) -> Result<FfmpegInfo> {
        let ffmpeg_path = dir.join(FFMPEG_NAME);
        if ffmpeg_path.exists() {
            return Self::get_ffmpeg_info(&ffmpeg_path);
        }

        let bin_path = dir.join("bin").join(FFMPEG_NAME);
        if bin_path.exists() {
            Self::get_ffmpeg_info(&bin_path)
        } else {
            Err(anyhow!("FFmpeg not found in {:?}", dir))
        }
    }

    /// FFmpegの情報を取得
    fn get_ffmpeg_info(ffmpeg_path: &Path) -> Result<FfmpegInfo> {
        let output = Command::new(ffmpeg_path)
            .arg("-version")
            .output()
            .with_context(|| format!("Failed to execute {:?}", ffmpeg_path))?;

        if output.status.success() {
            Self::parse_ffmpeg_output(&output.stdout, ffmpeg_path.to_path_buf())
        } else {
            Err(anyhow!("FFmpeg execution failed: {:?}", ffmpeg_path))
        }
    }

    /// `-version` の出力をパース
    fn parse_ffmpeg_output(output: &[u8], ffmpeg_path: PathBuf) -> Result<FfmpegInfo> {
        let output_str = String::from_utf8_lossy(output);

        // 例: "ffmpeg version 7.0.1 Copyright ..."
        let version_line = output_str.lines().next().context("Empty ffmpeg output")?;

        let version = version_line
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .unwrap_or("unknown")
            .to_string();

        let mut version_parts = version.split(|c: char| !c.is_ascii_digit());
        let major_version = version_parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let minor_version = version_parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let ffprobe_path = sibling_ffprobe(&ffmpeg_path);

        Ok(FfmpegInfo {
            ffmpeg_path,
            ffprobe_path,
            version,
            major_version,
            minor_version,
        })
    }
}

/// ffmpeg と同じディレクトリにある ffprobe
fn sibling_ffprobe(ffmpeg_path: &Path) -> Option<PathBuf> {
    match ffmpeg_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            Some(parent.join(FFPROBE_NAME)).filter(|p| p.exists())
        }
        // PATH から見つけた場合は ffprobe も PATH 上にあるとみなす
        _ => Some(PathBuf::from(FFPROBE_NAME)),
    }
}
