//! アプリケーション設定（JSON保存）

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcoder::{
    ContainerFormat, EncoderSelector, QualityMode, TranscodeSettings, VideoPreset,
    DEFAULT_BITRATE, DEFAULT_HEIGHT, DEFAULT_OUTPUT_PREFIX, DEFAULT_QUALITY, DEFAULT_TIMEOUT_SECS,
    DEFAULT_WIDTH,
};

/// アプリケーション名（設定・データディレクトリ名）
const APP_DIR_NAME: &str = "vidbatch";

/// 連番ファイル名
const SEQUENCE_FILE_NAME: &str = "sequence_number.txt";

/// アプリケーション設定
///
/// 欠けているキーはデフォルト値になる。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 出力幅（0 = 元の解像度）
    pub width: u32,
    /// 出力高さ（0 = 元の解像度）
    pub height: u32,
    /// ビットレート（例: "1000k"）
    pub bitrate: String,
    /// エンコーダー（"auto" または名前）
    pub encoder: String,
    /// FFmpegのスレッド数
    pub threads: u32,
    /// 1ファイルあたりのタイムアウト（秒）
    pub timeout_secs: u64,
    /// 成功後に元ファイルを削除
    pub delete_original: bool,
    /// プリセット名
    pub preset: String,
    /// 固定品質モードを使う
    pub use_constant_quality: bool,
    /// 固定品質の値
    pub quality: u8,
    /// 出力ファイル名プレフィックス
    pub output_prefix: String,
    /// 連番ファイルのパス（None ならデータディレクトリ）
    pub sequence_file: Option<PathBuf>,
    /// FFmpegのカスタムパス
    pub ffmpeg_custom_path: Option<PathBuf>,
    /// 最後に使用した出力ディレクトリ
    pub last_output_dir: Option<PathBuf>,
    /// 出力コンテナ（"mp4" / "mkv"）
    pub container: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            bitrate: DEFAULT_BITRATE.to_string(),
            encoder: "auto".to_string(),
            threads: 1,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            delete_original: false,
            preset: "medium".to_string(),
            use_constant_quality: false,
            quality: DEFAULT_QUALITY,
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            sequence_file: None,
            ffmpeg_custom_path: None,
            last_output_dir: None,
            container: "mp4".to_string(),
        }
    }
}

impl Settings {
    /// 設定ファイルのパスを取得
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR_NAME);
        Ok(config_dir.join("settings.json"))
    }

    /// アプリケーションデータディレクトリを取得
    pub fn app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR_NAME);
        Ok(data_dir)
    }

    /// 連番ファイルのパス
    pub fn sequence_path(&self) -> Result<PathBuf> {
        match self.sequence_file {
            Some(ref path) => Ok(path.clone()),
            None => Ok(Self::app_data_dir()?.join(SEQUENCE_FILE_NAME)),
        }
    }

    /// 設定をファイルからロード（無い・壊れている場合はデフォルト）
    pub fn load() -> Result<Self> {
        Ok(Self::load_from(&Self::config_path()?))
    }

    /// 指定パスからロード
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Failed to read settings {:?}: {}, using defaults", path, e);
                return Self::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Malformed settings {:?}: {}, using defaults", path, e);
            Self::default()
        })
    }

    /// 設定をファイルに保存
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// 指定パスに保存
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// エンジン用の設定に変換
    pub fn transcode_settings(&self) -> TranscodeSettings {
        let preset = VideoPreset::from_name(&self.preset).unwrap_or_else(|| {
            warn!("Unknown preset {:?}, using medium", self.preset);
            VideoPreset::Medium
        });

        let container = ContainerFormat::from_extension(&self.container).unwrap_or_else(|| {
            warn!("Unknown container {:?}, using mp4", self.container);
            ContainerFormat::Mp4
        });

        let quality = if self.use_constant_quality {
            QualityMode::ConstantQuality(self.quality)
        } else {
            QualityMode::Bitrate(self.bitrate.clone())
        };

        // FromStr は失敗しない
        let encoder = self
            .encoder
            .parse::<EncoderSelector>()
            .unwrap_or_default();

        TranscodeSettings {
            width: self.width,
            height: self.height,
            encoder,
            quality,
            preset,
            threads: self.threads.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
            container,
            output_prefix: self.output_prefix.clone(),
        }
    }
}
