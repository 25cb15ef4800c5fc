//! ffprobe によるメタデータ取得

use log::{debug, warn};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::run_tool;

/// ffprobe のタイムアウト
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// 入力ファイルのメタデータ
///
/// 取得できなかった値は 0 / None のまま。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaInfo {
    /// 再生時間（秒）
    pub duration_secs: f64,
    /// 映像の幅
    pub width: u32,
    /// 映像の高さ
    pub height: u32,
    /// 映像コーデック名
    pub codec_name: Option<String>,
    /// コンテナ形式（ffprobe の format_name）
    pub format_name: Option<String>,
}

impl MediaInfo {
    /// 再生時間が分かっている場合のみ返す
    pub fn duration(&self) -> Option<Duration> {
        if self.duration_secs <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.duration_secs).ok()
    }

    /// 表示用の一行説明（例: "mov h264 1920x1080"）
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref format) = self.format_name {
            // "mov,mp4,m4a,..." は先頭だけ
            parts.push(format.split(',').next().unwrap_or(format).to_string());
        }
        if let Some(ref codec) = self.codec_name {
            parts.push(codec.clone());
        }
        if self.width > 0 && self.height > 0 {
            parts.push(format!("{}x{}", self.width, self.height));
        }

        if parts.is_empty() {
            "unknown source".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// ffprobe の JSON をパース（壊れていればデフォルト値）
    pub fn from_json(json: &str) -> Self {
        #[derive(Deserialize)]
        struct ProbeOutput {
            #[serde(default)]
            format: Option<ProbeFormat>,
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
            format_name: Option<String>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: Option<String>,
            codec_name: Option<String>,
            width: Option<u32>,
            height: Option<u32>,
        }

        let probe: ProbeOutput = match serde_json::from_str(json) {
            Ok(probe) => probe,
            Err(e) => {
                debug!("Failed to parse ffprobe output: {}", e);
                return Self::default();
            }
        };

        let (duration, format_name) = match probe.format {
            Some(format) => (format.duration, format.format_name),
            None => (None, None),
        };
        let duration_secs = duration
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(0.0);

        let video = probe
            .streams
            .into_iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));

        match video {
            Some(stream) => Self {
                duration_secs,
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
                codec_name: stream.codec_name,
                format_name,
            },
            None => Self {
                duration_secs,
                format_name,
                ..Self::default()
            },
        }
    }
}

/// ffprobe でメタデータを取得（失敗してもエラーにしない）
pub async fn probe_media(ffprobe: &Path, input: &Path) -> MediaInfo {
    let input_str = input.to_string_lossy();
    let args = [
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        &*input_str,
    ];

    let Some(output) = run_tool(ffprobe, &args, PROBE_TIMEOUT).await else {
        warn!("ffprobe unavailable for {:?}, progress percentage disabled", input);
        return MediaInfo::default();
    };

    if !output.status.success() {
        warn!("ffprobe failed for {:?} ({})", input, output.status);
        return MediaInfo::default();
    }

    let info = MediaInfo::from_json(&String::from_utf8_lossy(&output.stdout));
    debug!(
        "Probed {:?}: {}, {:.2}s",
        input,
        info.describe(),
        info.duration_secs
    );
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_stream() {
        let json = r#"{
            "format": { "filename": "in.mkv", "format_name": "matroska,webm", "duration": "30.000000" },
            "streams": [
                { "codec_type": "audio", "codec_name": "aac" },
                { "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080 }
            ]
        }"#;

        let info = MediaInfo::from_json(json);
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.codec_name.as_deref(), Some("h264"));
        assert_eq!(info.duration(), Some(Duration::from_secs(30)));
        assert_eq!(info.describe(), "matroska h264 1920x1080");
    }

    #[test]
    fn test_describe_skips_unknown_parts() {
        let audio_only = MediaInfo::from_json(
            r#"{ "format": { "format_name": "mp3", "duration": "3.5" }, "streams": [] }"#,
        );
        assert_eq!(audio_only.describe(), "mp3");
        assert_eq!(MediaInfo::default().describe(), "unknown source");
    }

    #[test]
    fn test_malformed_json_yields_defaults() {
        assert_eq!(MediaInfo::from_json("not json"), MediaInfo::default());
        assert_eq!(MediaInfo::from_json(""), MediaInfo::default());
    }

    #[test]
    fn test_missing_fields_yield_zero() {
        let info = MediaInfo::from_json(r#"{ "format": { "duration": "N/A" }, "streams": [] }"#);
        assert_eq!(info, MediaInfo::default());
        assert_eq!(info.duration(), None);
    }

    #[test]
    fn test_unrepresentable_duration_is_unknown() {
        let huge = MediaInfo {
            duration_secs: 1e300,
            ..Default::default()
        };
        assert_eq!(huge.duration(), None);

        let nan = MediaInfo {
            duration_secs: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.duration(), None);

        let info = MediaInfo::from_json(r#"{ "format": { "duration": "1e300" }, "streams": [] }"#);
        assert_eq!(info.duration(), None);
    }

    #[tokio::test]
    async fn test_missing_ffprobe_is_not_fatal() {
        let info = probe_media(
            Path::new("/nonexistent/ffprobe-xyz"),
            Path::new("/nonexistent/input.mp4"),
        )
        .await;
        assert_eq!(info, MediaInfo::default());
    }
}
