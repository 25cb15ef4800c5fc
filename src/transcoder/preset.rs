//! 変換設定とリクエスト定義

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::HwAccelType;

/// デフォルトの出力幅
pub const DEFAULT_WIDTH: u32 = 1280;
/// デフォルトの出力高さ
pub const DEFAULT_HEIGHT: u32 = 720;
/// デフォルトのビデオビットレート
pub const DEFAULT_BITRATE: &str = "1000k";
/// デフォルトの固定品質値
pub const DEFAULT_QUALITY: u8 = 23;
/// デフォルトのタイムアウト（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// デフォルトの出力ファイル名プレフィックス
pub const DEFAULT_OUTPUT_PREFIX: &str = "av";

/// バッチ全体で共有するトランスコード設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSettings {
    /// 出力幅（0 = 元の解像度）
    pub width: u32,
    /// 出力高さ（0 = 元の解像度）
    pub height: u32,
    /// エンコーダー選択
    pub encoder: EncoderSelector,
    /// 品質モード
    pub quality: QualityMode,
    /// エンコードプリセット
    pub preset: VideoPreset,
    /// FFmpeg内部のスレッド数
    pub threads: u32,
    /// 1ファイルあたりの最大変換時間
    pub timeout: Duration,
    /// 出力コンテナ形式
    pub container: ContainerFormat,
    /// 出力ファイル名プレフィックス
    pub output_prefix: String,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            encoder: EncoderSelector::Auto,
            quality: QualityMode::default(),
            preset: VideoPreset::Medium,
            threads: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            container: ContainerFormat::Mp4,
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
        }
    }
}

impl TranscodeSettings {
    /// 1ファイル分のリクエストを作成
    pub fn request_for(&self, input_path: &Path, output_path: Option<PathBuf>) -> ConversionRequest {
        ConversionRequest {
            input_path: input_path.to_path_buf(),
            output_path,
            width: self.width,
            height: self.height,
            encoder: self.encoder.clone(),
            quality: self.quality.clone(),
            preset: self.preset,
            threads: self.threads,
            timeout: self.timeout,
            container: self.container,
        }
    }

    /// 連番から出力ファイル名を生成
    ///
    /// 高さが分かる場合は `<prefix>-<height>p-<seq:04>.<ext>`、
    /// そうでなければ `<prefix>-<seq:04>.<ext>`。
    pub fn output_file_name(&self, sequence: u64) -> String {
        let extension = self.container.extension();
        if self.height > 0 {
            format!(
                "{}-{}p-{:04}.{}",
                self.output_prefix, self.height, sequence, extension
            )
        } else {
            format!("{}-{:04}.{}", self.output_prefix, sequence, extension)
        }
    }
}

/// 1ファイル分の変換リクエスト（不変）
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionRequest {
    /// 入力ファイルパス
    pub input_path: PathBuf,
    /// 明示的な出力ファイルパス
    pub output_path: Option<PathBuf>,
    /// 出力幅（0 = 元の解像度）
    pub width: u32,
    /// 出力高さ（0 = 元の解像度）
    pub height: u32,
    /// エンコーダー選択
    pub encoder: EncoderSelector,
    /// 品質モード
    pub quality: QualityMode,
    /// エンコードプリセット
    pub preset: VideoPreset,
    /// FFmpeg内部のスレッド数
    pub threads: u32,
    /// 変換全体のタイムアウト
    pub timeout: Duration,
    /// 出力コンテナ形式
    pub container: ContainerFormat,
}

impl ConversionRequest {
    /// デフォルト設定でリクエストを作成
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        TranscodeSettings::default().request_for(&input_path.into(), None)
    }

    /// 出力パスを解決
    ///
    /// 明示されていなければ入力ファイルの隣に `<stem>_converted.<ext>` を置く。
    pub fn resolved_output_path(&self) -> PathBuf {
        if let Some(ref path) = self.output_path {
            return path.clone();
        }

        let stem = self
            .input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let dir = self.input_path.parent().unwrap_or_else(|| Path::new("."));

        dir.join(format!("{}_converted.{}", stem, self.container.extension()))
    }

    /// 出力解像度を維持するか（スケーリングなし）
    pub fn keeps_source_resolution(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// 元の解像度と一致するか（コピーで済むか）
    pub fn matches_resolution(&self, width: u32, height: u32) -> bool {
        self.width > 0 && self.height > 0 && self.width == width && self.height == height
    }
}

/// エンコーダー選択
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderSelector {
    /// 自動検出（最優先の利用可能エンコーダー）
    #[default]
    Auto,
    /// 明示的なエンコーダー名
    Named(String),
}

impl FromStr for EncoderSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            Ok(EncoderSelector::Auto)
        } else {
            Ok(EncoderSelector::Named(trimmed.to_string()))
        }
    }
}

impl fmt::Display for EncoderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderSelector::Auto => f.write_str("auto"),
            EncoderSelector::Named(name) => f.write_str(name),
        }
    }
}

/// 品質モード（ビットレートと固定品質は排他）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityMode {
    /// 固定ビットレート（例: "1000k"）
    Bitrate(String),
    /// 固定品質値（CRF / CQ）
    ConstantQuality(u8),
}

impl Default for QualityMode {
    fn default() -> Self {
        QualityMode::Bitrate(DEFAULT_BITRATE.to_string())
    }
}

/// ビデオコーデック
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Hevc,
}

impl VideoCodec {
    /// 表示名を取得
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264 (AVC)",
            VideoCodec::Hevc => "H.265 (HEVC)",
        }
    }

    /// FFmpegエンコーダー名を取得
    pub fn encoder_name(&self, hwaccel: HwAccelType) -> &'static str {
        match (self, hwaccel) {
            (VideoCodec::H264, HwAccelType::Nvenc) => "h264_nvenc",
            (VideoCodec::Hevc, HwAccelType::Nvenc) => "hevc_nvenc",
            (VideoCodec::H264, HwAccelType::Qsv) => "h264_qsv",
            (VideoCodec::Hevc, HwAccelType::Qsv) => "hevc_qsv",
            (VideoCodec::H264, HwAccelType::Amf) => "h264_amf",
            (VideoCodec::Hevc, HwAccelType::Amf) => "hevc_amf",
            (VideoCodec::H264, HwAccelType::Software) => "libx264",
            (VideoCodec::Hevc, HwAccelType::Software) => "libx265",
        }
    }

    /// エンコーダー名からコーデックを推定
    pub fn from_encoder_name(name: &str) -> Option<VideoCodec> {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("hevc") || lower.starts_with("h265") || lower == "libx265" {
            Some(VideoCodec::Hevc)
        } else if lower.starts_with("h264") || lower == "libx264" {
            Some(VideoCodec::H264)
        } else {
            None
        }
    }
}

/// コンテナ形式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerFormat {
    Mp4,
    Mkv,
}

impl ContainerFormat {
    /// 拡張子を取得
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
        }
    }

    /// 拡張子からコンテナ形式を取得
    pub fn from_extension(ext: &str) -> Option<ContainerFormat> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Some(ContainerFormat::Mp4),
            "mkv" => Some(ContainerFormat::Mkv),
            _ => None,
        }
    }
}

/// エンコードプリセット
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoPreset {
    Ultrafast,
    Fast,
    Medium,
    Slow,
    Veryslow,
}

impl VideoPreset {
    /// 名前からプリセットを取得
    pub fn from_name(name: &str) -> Option<VideoPreset> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ultrafast" => Some(VideoPreset::Ultrafast),
            "fast" => Some(VideoPreset::Fast),
            "medium" => Some(VideoPreset::Medium),
            "slow" => Some(VideoPreset::Slow),
            "veryslow" => Some(VideoPreset::Veryslow),
            _ => None,
        }
    }

    /// FFmpegプリセット名を取得（libx264/libx265）
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoPreset::Ultrafast => "ultrafast",
            VideoPreset::Fast => "fast",
            VideoPreset::Medium => "medium",
            VideoPreset::Slow => "slow",
            VideoPreset::Veryslow => "veryslow",
        }
    }

    /// NVENCプリセット（p1 = 最速, p7 = 最高品質）
    pub fn nvenc_name(&self) -> &'static str {
        match self {
            VideoPreset::Ultrafast => "p1",
            VideoPreset::Fast => "p3",
            VideoPreset::Medium => "p4",
            VideoPreset::Slow => "p6",
            VideoPreset::Veryslow => "p7",
        }
    }

    /// QSVプリセット（ultrafastは存在しない）
    pub fn qsv_name(&self) -> &'static str {
        match self {
            VideoPreset::Ultrafast => "veryfast",
            other => other.ffmpeg_name(),
        }
    }

    /// AMF品質プリセット
    pub fn amf_quality(&self) -> &'static str {
        match self {
            VideoPreset::Ultrafast | VideoPreset::Fast => "speed",
            VideoPreset::Medium => "balanced",
            VideoPreset::Slow | VideoPreset::Veryslow => "quality",
        }
    }
}

impl Default for VideoPreset {
    fn default() -> Self {
        VideoPreset::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_file_name_with_height() {
        let settings = TranscodeSettings::default();
        assert_eq!(settings.output_file_name(7), "av-720p-0007.mp4");
    }

    #[test]
    fn test_output_file_name_without_height() {
        let settings = TranscodeSettings {
            width: 0,
            height: 0,
            output_prefix: "clip".to_string(),
            container: ContainerFormat::Mkv,
            ..Default::default()
        };
        assert_eq!(settings.output_file_name(12345), "clip-12345.mkv");
    }

    #[test]
    fn test_encoder_selector_parse() {
        assert_eq!("auto".parse::<EncoderSelector>().unwrap(), EncoderSelector::Auto);
        assert_eq!("AUTO".parse::<EncoderSelector>().unwrap(), EncoderSelector::Auto);
        assert_eq!(
            " hevc_qsv ".parse::<EncoderSelector>().unwrap(),
            EncoderSelector::Named("hevc_qsv".to_string())
        );
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let request = ConversionRequest::new("/videos/in.mov");
        assert_eq!(request.width, 1280);
        assert_eq!(request.height, 720);
        assert_eq!(request.quality, QualityMode::Bitrate("1000k".to_string()));
        assert_eq!(request.encoder, EncoderSelector::Auto);
        assert_eq!(request.threads, 1);
        assert_eq!(request.timeout, Duration::from_secs(300));
        assert_eq!(request.preset, VideoPreset::Medium);
    }

    #[test]
    fn test_resolved_output_path_defaults_next_to_input() {
        let request = ConversionRequest::new("/videos/holiday.mov");
        assert_eq!(
            request.resolved_output_path(),
            PathBuf::from("/videos/holiday_converted.mp4")
        );
    }

    #[test]
    fn test_matches_resolution_requires_both_dimensions() {
        let mut request = ConversionRequest::new("in.mp4");
        assert!(request.matches_resolution(1280, 720));
        assert!(!request.matches_resolution(1920, 1080));
        request.width = 0;
        request.height = 0;
        assert!(!request.matches_resolution(0, 0));
        assert!(request.keeps_source_resolution());
    }

    #[test]
    fn test_codec_from_encoder_name() {
        assert_eq!(VideoCodec::from_encoder_name("hevc_nvenc"), Some(VideoCodec::Hevc));
        assert_eq!(VideoCodec::from_encoder_name("libx264"), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_encoder_name("libvpx-vp9"), None);
    }
}
