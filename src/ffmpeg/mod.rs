//! FFmpegモジュール

mod detector;
mod media_info;

pub use detector::{FfmpegDetector, FfmpegInfo};
pub use media_info::{probe_media, MediaInfo};

use log::{debug, warn};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// 変換で使う外部ツールのパス
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolPaths {
    /// ffmpeg 実行ファイル
    pub ffmpeg: PathBuf,
    /// ffprobe 実行ファイル
    pub ffprobe: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl From<&FfmpegInfo> for ToolPaths {
    fn from(info: &FfmpegInfo) -> Self {
        Self {
            ffmpeg: info.ffmpeg_path.clone(),
            ffprobe: info
                .ffprobe_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("ffprobe")),
        }
    }
}

/// 短時間の診断コマンドを実行して出力を取得
///
/// 起動失敗・タイムアウト時は None。タイムアウトしたプロセスは kill される。
pub(crate) async fn run_tool(
    program: impl AsRef<OsStr>,
    args: &[&str],
    limit: Duration,
) -> Option<Output> {
    let program = program.as_ref();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(limit, command.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!("Failed to run {:?}: {}", program, e);
            None
        }
        Err(_) => {
            warn!("{:?} did not finish within {:?}", program, limit);
            None
        }
    }
}
