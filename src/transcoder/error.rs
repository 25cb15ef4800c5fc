//! FFmpegエラー解析
//!
//! 失敗したファイルの診断出力を分類し、一行の要約を作る。

use super::HwAccelType;

/// FFmpegエラーの種類
#[derive(Debug, Clone, PartialEq)]
pub enum FfmpegErrorKind {
    /// エンコーダーがビルドに含まれていない
    EncoderNotSupported(String),
    /// HWアクセラレーションの初期化に失敗
    HwAccelNotAvailable(HwAccelType),
    /// 入力のコーデックをデコードできない
    DecoderNotSupported,
    /// 入力ファイルが見つからない
    InputNotFound,
    /// 入力ファイルが壊れている
    InputCorrupted,
    /// 出力先に書き込めない
    OutputWriteError,
    /// ディスク容量不足
    DiskFull,
    /// メモリ不足
    OutOfMemory,
    /// 権限エラー
    PermissionDenied,
    /// オプションが無効
    InvalidOption,
    /// 分類できないエラー
    Unknown,
}

/// FFmpegエラー解析結果
#[derive(Debug, Clone)]
pub struct FfmpegError {
    /// エラーの種類
    pub kind: FfmpegErrorKind,
    /// 一行の要約
    pub summary: String,
    /// 解決策の提案
    pub suggestion: Option<String>,
}

/// 要約に残す最大文字数
const SUMMARY_MAX_CHARS: usize = 160;

impl FfmpegError {
    /// 診断出力からエラーを分類
    pub fn parse(diagnostic: &str) -> Self {
        let lower = diagnostic.to_lowercase();
        let has = |needle: &str| lower.contains(needle);

        if has("unknown encoder") || has("no such encoder") || (has("encoder") && has("not found")) {
            let encoder = quoted_after(diagnostic, "encoder").unwrap_or_else(|| "?".to_string());
            return Self::encoder_not_supported(encoder);
        }

        if let Some(hwaccel) = hwaccel_failure(&lower) {
            return Self {
                kind: FfmpegErrorKind::HwAccelNotAvailable(hwaccel),
                summary: format!("{} could not be initialized", hwaccel.display_name()),
                suggestion: Some(
                    "update the graphics driver or choose the libx264 encoder".to_string(),
                ),
            };
        }

        if has("unknown decoder") || (has("decoder") && has("not found")) {
            return Self::simple(
                FfmpegErrorKind::DecoderNotSupported,
                "The input codec cannot be decoded by this ffmpeg build",
                None,
            );
        }

        if has("no such file") || has("does not exist") {
            return Self::simple(
                FfmpegErrorKind::InputNotFound,
                "Input file not found",
                Some("check that the file was not moved or deleted"),
            );
        }

        if has("invalid data found") || has("moov atom not found") || has("corrupt") {
            return Self::simple(
                FfmpegErrorKind::InputCorrupted,
                "The input file is corrupted or in an unsupported format",
                None,
            );
        }

        if has("permission denied") || has("access denied") {
            return Self::simple(
                FfmpegErrorKind::PermissionDenied,
                "Permission denied",
                Some("check write access to the output folder"),
            );
        }

        if has("no space left") || has("disk full") {
            return Self::simple(
                FfmpegErrorKind::DiskFull,
                "Not enough disk space",
                Some("free up space on the output drive"),
            );
        }

        if has("out of memory") || has("cannot allocate memory") {
            return Self::simple(
                FfmpegErrorKind::OutOfMemory,
                "Out of memory",
                Some("lower the thread count or the output resolution"),
            );
        }

        if has("cannot open") && (has("output") || has("writing")) {
            return Self::simple(
                FfmpegErrorKind::OutputWriteError,
                "The output file could not be created",
                None,
            );
        }

        if has("unrecognized option") || has("invalid option") || (has("option") && has("not found"))
        {
            return Self::simple(
                FfmpegErrorKind::InvalidOption,
                "The encoder does not support the given options",
                None,
            );
        }

        Self {
            kind: FfmpegErrorKind::Unknown,
            summary: last_error_line(diagnostic),
            suggestion: None,
        }
    }

    fn encoder_not_supported(encoder: String) -> Self {
        let suggestion = match HwAccelType::from_encoder_name(&encoder) {
            HwAccelType::Software => "choose another encoder or use auto".to_string(),
            hwaccel => format!(
                "{} is not available on this machine; use auto instead",
                hwaccel.display_name()
            ),
        };
        Self {
            summary: format!("Encoder '{}' is not available in this ffmpeg build", encoder),
            kind: FfmpegErrorKind::EncoderNotSupported(encoder),
            suggestion: Some(suggestion),
        }
    }

    fn simple(kind: FfmpegErrorKind, summary: &str, suggestion: Option<&str>) -> Self {
        Self {
            kind,
            summary: summary.to_string(),
            suggestion: suggestion.map(str::to_string),
        }
    }

    /// 要約と提案をまとめた表示用メッセージ
    pub fn format_user_message(&self) -> String {
        match &self.suggestion {
            Some(suggestion) => format!("{} ({})", self.summary, suggestion),
            None => self.summary.clone(),
        }
    }
}

/// ベンダー固有の初期化失敗を判定
///
/// 失敗の語とベンダー名が同じ行にある場合だけ一致とする。
/// ストリーム対応表の行 (`Stream #0:0 -> #0:0 (... (hevc_nvenc))`) は対象外。
fn hwaccel_failure(lower: &str) -> Option<HwAccelType> {
    lower
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("stream #"))
        .find_map(hwaccel_failure_line)
}

fn hwaccel_failure_line(line: &str) -> Option<HwAccelType> {
    let failed = ["error", "failed", "cannot load", "not found", "unavailable", "no capable devices"]
        .iter()
        .any(|word| line.contains(word));
    let has = |needle: &str| line.contains(needle);

    if has("no nvenc capable devices")
        || has("cannot load nvcuda")
        || has("cannot load libcuda")
        || (failed && (has("nvenc") || has("cuda")))
    {
        return Some(HwAccelType::Nvenc);
    }
    if has("no qsv-supporting device") || (failed && (has("qsv") || has("mfx"))) {
        return Some(HwAccelType::Qsv);
    }
    if has("no amf capable device") || (failed && (has("amf") || has("d3d11va"))) {
        return Some(HwAccelType::Amf);
    }
    None
}

/// キーワードを含む行の最初の '...' の中身
fn quoted_after(text: &str, keyword: &str) -> Option<String> {
    text.lines()
        .filter(|line| line.to_lowercase().contains(keyword))
        .find_map(|line| {
            let start = line.find('\'')? + 1;
            let len = line[start..].find('\'')?;
            Some(line[start..start + len].to_string())
        })
}

/// 最後のエラーらしい行（無ければ最後の行）を切り詰めて返す
fn last_error_line(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let line = lines
        .iter()
        .rev()
        .find(|line| {
            let lower = line.to_lowercase();
            ["error", "failed", "cannot", "unable", "invalid"]
                .iter()
                .any(|word| lower.contains(word))
        })
        .or_else(|| lines.last())
        .copied()
        .unwrap_or("Conversion failed with no diagnostic output");

    truncate(line, SUMMARY_MAX_CHARS)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
