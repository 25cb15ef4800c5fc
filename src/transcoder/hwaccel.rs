//! HWアクセラレーション検出
//!
//! FFmpegに組み込まれたエンコーダー一覧とドライバーのバージョンから、
//! 実際に使えるエンコーダーを優先度順に列挙する。

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{EncoderSelector, VideoCodec};
use crate::ffmpeg::run_tool;

/// 診断用サブプロセスのタイムアウト
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// NVENCに必要なNVIDIAドライバーの最小バージョン (major, minor)
pub const MIN_NVIDIA_DRIVER: (u32, u32) = (570, 0);

/// すべての検出に失敗した場合でも返すエンコーダー
pub const BASELINE_ENCODER: &str = "libx264";

/// 検出の優先順位（HEVCのHW → H.264のHW → ソフトウェア）
const CANDIDATES: &[(VideoCodec, HwAccelType)] = &[
    (VideoCodec::Hevc, HwAccelType::Nvenc),
    (VideoCodec::Hevc, HwAccelType::Qsv),
    (VideoCodec::Hevc, HwAccelType::Amf),
    (VideoCodec::H264, HwAccelType::Nvenc),
    (VideoCodec::H264, HwAccelType::Qsv),
    (VideoCodec::H264, HwAccelType::Amf),
    (VideoCodec::Hevc, HwAccelType::Software),
    (VideoCodec::H264, HwAccelType::Software),
];

/// HWアクセラレーションタイプ（エンコーダーのベンダー系統）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwAccelType {
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync Video
    Qsv,
    /// AMD AMF
    Amf,
    /// ソフトウェアエンコード
    Software,
}

impl HwAccelType {
    /// 表示名を取得
    pub fn display_name(&self) -> &'static str {
        match self {
            HwAccelType::Nvenc => "NVIDIA NVENC",
            HwAccelType::Qsv => "Intel QSV",
            HwAccelType::Amf => "AMD AMF",
            HwAccelType::Software => "Software",
        }
    }

    /// エンコーダー名から系統を判定
    pub fn from_encoder_name(name: &str) -> HwAccelType {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("_nvenc") {
            HwAccelType::Nvenc
        } else if lower.ends_with("_qsv") {
            HwAccelType::Qsv
        } else if lower.ends_with("_amf") {
            HwAccelType::Amf
        } else {
            HwAccelType::Software
        }
    }

    /// ハードウェアエンコーダーか
    pub fn is_hardware(&self) -> bool {
        !matches!(self, HwAccelType::Software)
    }
}

/// エンコーダー情報
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderInfo {
    /// FFmpegエンコーダー名（例: h264_nvenc）
    pub name: String,
    /// ベンダー系統
    pub hwaccel: HwAccelType,
    /// コーデック
    pub codec: VideoCodec,
    /// 利用可能か
    pub available: bool,
    /// 利用不可の理由など
    pub note: Option<String>,
}

impl EncoderInfo {
    fn new(codec: VideoCodec, hwaccel: HwAccelType) -> Self {
        Self {
            name: codec.encoder_name(hwaccel).to_string(),
            hwaccel,
            codec,
            available: false,
            note: None,
        }
    }

    fn baseline() -> Self {
        Self {
            available: true,
            note: Some("baseline fallback".to_string()),
            ..Self::new(VideoCodec::H264, HwAccelType::Software)
        }
    }
}

/// NVIDIAドライバーの判定結果
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    /// NVENCが使えるバージョンか
    pub supported: bool,
    /// 診断メッセージ
    pub message: String,
}

impl DriverStatus {
    /// `nvidia-smi` の出力からドライバーを判定
    pub fn evaluate(raw_version: Option<&str>) -> Self {
        let Some(raw) = raw_version.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self {
                supported: false,
                message: "unable to query NVIDIA driver version".to_string(),
            };
        };

        let version = raw.lines().next().unwrap_or(raw).trim();
        let Some((major, minor)) = parse_major_minor(version) else {
            // 形式が読めないだけなら使える前提で進める
            return Self {
                supported: true,
                message: format!("driver version {}", version),
            };
        };

        let (min_major, min_minor) = MIN_NVIDIA_DRIVER;
        if (major, minor) >= (min_major, min_minor) {
            Self {
                supported: true,
                message: format!("driver version {} supports NVENC", version),
            }
        } else {
            Self {
                supported: false,
                message: format!(
                    "driver version {} is too old, NVENC requires {}.{}+ (found {}.{})",
                    version, min_major, min_minor, major, minor
                ),
            }
        }
    }
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| Regex::new(r"(\d+)\.(\d+)").expect("valid regex"));
    let caps = re.captures(version)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    Some((major, minor))
}

/// エンコーダー一覧に名前が含まれるか（トークン単位で比較）
pub fn encoder_listed(listing: &str, encoder: &str) -> bool {
    listing
        .lines()
        .flat_map(str::split_whitespace)
        .any(|token| token == encoder)
}

/// 検出結果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityReport {
    /// FFmpegが起動できたか
    pub transcoder_available: bool,
    /// `-version` の1行目
    pub transcoder_version: Option<String>,
    /// 全候補（優先度順、利用可否付き）
    pub candidates: Vec<EncoderInfo>,
    /// NVIDIAドライバーの判定（NVENCが組み込まれている場合のみ）
    pub nvidia_driver: Option<DriverStatus>,
}

impl CapabilityReport {
    /// 利用可能なエンコーダー（空にはならない）
    pub fn available(&self) -> Vec<EncoderInfo> {
        let available: Vec<EncoderInfo> = self
            .candidates
            .iter()
            .filter(|e| e.available)
            .cloned()
            .collect();

        if available.is_empty() {
            vec![EncoderInfo::baseline()]
        } else {
            available
        }
    }
}

/// 検出に使う外部情報源
///
/// マッチング方法やプロセス起動を差し替えられるように分離している。
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    /// FFmpegのバージョン行（起動できなければ None）
    async fn transcoder_version(&self) -> Option<String>;

    /// `-encoders` の出力
    async fn encoder_listing(&self) -> Option<String>;

    /// NVIDIAドライバーのバージョン文字列
    async fn nvidia_driver_version(&self) -> Option<String>;
}

/// FFmpeg / nvidia-smi を実行する情報源
#[derive(Clone, Debug)]
pub struct FfmpegCapabilitySource {
    ffmpeg_path: PathBuf,
    nvidia_smi_path: PathBuf,
}

impl FfmpegCapabilitySource {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            nvidia_smi_path: PathBuf::from("nvidia-smi"),
        }
    }
}

#[async_trait]
impl CapabilitySource for FfmpegCapabilitySource {
    async fn transcoder_version(&self) -> Option<String> {
        let output = run_tool(&self.ffmpeg_path, &["-version"], VERSION_CHECK_TIMEOUT).await?;
        if !output.status.success() {
            debug!("{:?} -version exited with {}", self.ffmpeg_path, output.status);
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn encoder_listing(&self) -> Option<String> {
        let output =
            run_tool(&self.ffmpeg_path, &["-hide_banner", "-encoders"], QUERY_TIMEOUT).await?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn nvidia_driver_version(&self) -> Option<String> {
        let output = run_tool(
            &self.nvidia_smi_path,
            &["--query-gpu=driver_version", "--format=csv,noheader"],
            QUERY_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// エンコーダー能力の検出器
///
/// 結果はインスタンスの生存期間中キャッシュされ、外部プロセスは一度しか起動しない。
pub struct EncoderCapabilityProbe {
    source: Box<dyn CapabilitySource>,
    report: OnceCell<CapabilityReport>,
}

impl EncoderCapabilityProbe {
    /// FFmpegを直接調べる検出器を作成
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self::with_source(FfmpegCapabilitySource::new(ffmpeg_path))
    }

    /// 任意の情報源で検出器を作成
    pub fn with_source(source: impl CapabilitySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            report: OnceCell::new(),
        }
    }

    /// 検出結果を取得（初回のみ検出を実行）
    pub async fn report(&self) -> &CapabilityReport {
        self.report.get_or_init(|| self.detect()).await
    }

    /// FFmpegが起動できるか
    pub async fn transcoder_available(&self) -> bool {
        self.report().await.transcoder_available
    }

    /// 利用可能なエンコーダーを優先度順に取得（空にはならない）
    pub async fn detect_available(&self) -> Vec<EncoderInfo> {
        self.report().await.available()
    }

    /// 最優先のエンコーダー名
    pub async fn best_encoder(&self) -> String {
        self.detect_available()
            .await
            .into_iter()
            .next()
            .map(|e| e.name)
            .unwrap_or_else(|| BASELINE_ENCODER.to_string())
    }

    /// NVIDIAドライバーの判定結果
    pub async fn nvidia_driver_status(&self) -> Option<DriverStatus> {
        self.report().await.nvidia_driver.clone()
    }

    /// ハードウェアエンコーダーか
    pub fn is_hardware_accelerated(&self, encoder: &str) -> bool {
        HwAccelType::from_encoder_name(encoder).is_hardware()
    }

    /// 選択を実際のエンコーダー名に解決
    pub async fn resolve(&self, selector: &EncoderSelector) -> String {
        match selector {
            EncoderSelector::Auto => self.best_encoder().await,
            EncoderSelector::Named(name) => {
                let listed = self
                    .detect_available()
                    .await
                    .iter()
                    .any(|e| e.name == *name);
                if !listed {
                    warn!(
                        "Encoder {} was not detected as available, using it anyway (may fail)",
                        name
                    );
                }
                name.clone()
            }
        }
    }

    async fn detect(&self) -> CapabilityReport {
        let mut candidates: Vec<EncoderInfo> = CANDIDATES
            .iter()
            .map(|(codec, hwaccel)| EncoderInfo::new(*codec, *hwaccel))
            .collect();

        let Some(version) = self.source.transcoder_version().await else {
            warn!("ffmpeg is not invocable, only {} is assumed", BASELINE_ENCODER);
            for candidate in &mut candidates {
                candidate.note = Some("ffmpeg not available".to_string());
            }
            return CapabilityReport {
                transcoder_available: false,
                transcoder_version: None,
                candidates,
                nvidia_driver: None,
            };
        };
        debug!("ffmpeg version: {}", version);

        let listing = self.source.encoder_listing().await.unwrap_or_default();
        if listing.is_empty() {
            warn!("ffmpeg returned no encoder list");
        }

        let mut nvidia_driver: Option<DriverStatus> = None;
        for candidate in &mut candidates {
            if !encoder_listed(&listing, &candidate.name) {
                candidate.note = Some("not compiled into ffmpeg".to_string());
                continue;
            }

            if candidate.hwaccel == HwAccelType::Nvenc {
                if nvidia_driver.is_none() {
                    let raw = self.source.nvidia_driver_version().await;
                    nvidia_driver = Some(DriverStatus::evaluate(raw.as_deref()));
                }
                if let Some(ref status) = nvidia_driver {
                    if !status.supported {
                        warn!("{}: {}", candidate.name, status.message);
                        candidate.note = Some(status.message.clone());
                        continue;
                    }
                }
            }

            candidate.available = true;
        }

        let report = CapabilityReport {
            transcoder_available: true,
            transcoder_version: Some(version),
            candidates,
            nvidia_driver,
        };

        let names: Vec<&str> = report
            .candidates
            .iter()
            .filter(|e| e.available)
            .map(|e| e.name.as_str())
            .collect();
        info!("Available encoders detected: {:?}", names);

        report
    }
}
