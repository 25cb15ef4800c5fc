//! 進捗解析
//!
//! FFmpegの標準エラー出力を行単位で読み、`frame=` と `time=` を拾う。

use regex::Regex;
use std::io;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// 1ファイル分の進捗イベント
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// 処理済みフレーム数
    pub frame: Option<u64>,
    /// 処理済みのメディア時間
    pub time: Option<Duration>,
    /// 進捗率 (0.0 - 100.0)、元の長さが分かる場合のみ
    pub percent: Option<f64>,
    /// 元の出力行
    pub raw_line: String,
}

impl ProgressEvent {
    /// コピーで完了した場合の合成イベント
    pub fn completed(duration: Option<Duration>, raw_line: impl Into<String>) -> Self {
        Self {
            frame: None,
            time: duration,
            percent: Some(100.0),
            raw_line: raw_line.into(),
        }
    }
}

fn frame_regex() -> &'static Regex {
    static FRAME_RE: OnceLock<Regex> = OnceLock::new();
    FRAME_RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)").expect("valid regex"))
}

fn time_regex() -> &'static Regex {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    TIME_RE.get_or_init(|| Regex::new(r"time=(\d+):(\d+):(\d+\.\d+)").expect("valid regex"))
}

/// 進捗パーサー
#[derive(Clone, Debug, Default)]
pub struct ProgressParser {
    /// 元の再生時間（不明なら None）
    total: Option<Duration>,
}

impl ProgressParser {
    pub fn new(total: Option<Duration>) -> Self {
        Self {
            total: total.filter(|d| !d.is_zero()),
        }
    }

    /// 1行を解析（どちらのパターンにも一致しなければ None）
    pub fn parse_line(&self, line: &str) -> Option<ProgressEvent> {
        let frame = frame_regex()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());

        let time = time_regex().captures(line).and_then(|caps| {
            let hours: u64 = caps.get(1)?.as_str().parse().ok()?;
            let minutes: u64 = caps.get(2)?.as_str().parse().ok()?;
            let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
            // ファイル名やメタデータに紛れた巨大な値は無視
            let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
            Duration::try_from_secs_f64(whole as f64 + seconds).ok()
        });

        if frame.is_none() && time.is_none() {
            return None;
        }

        let percent = match (time, self.total) {
            (Some(time), Some(total)) => Some(percent_of(time, total)),
            _ => None,
        };

        Some(ProgressEvent {
            frame,
            time,
            percent,
            raw_line: line.to_string(),
        })
    }
}

/// 進捗率を [0, 100] に丸めて計算
pub fn percent_of(time: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    (time.as_secs_f64() / total.as_secs_f64() * 100.0).clamp(0.0, 100.0)
}

/// `\r` と `\n` の両方で区切る行リーダー
///
/// FFmpegは統計行を `\r` で上書きするため、通常の `lines()` では
/// 変換が終わるまで進捗が届かない。
pub struct DiagnosticLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// 次の空でない行（EOFなら None）
    ///
    /// 途中でキャンセルされても読みかけのデータは失われない。
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(pos) => {
                    self.pending.extend_from_slice(&buf[..pos]);
                    self.reader.consume(pos + 1);
                    let line = self.take_pending();
                    if !line.trim().is_empty() {
                        return Ok(Some(line));
                    }
                }
                None => {
                    let len = buf.len();
                    self.pending.extend_from_slice(buf);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

/// 時間をフォーマット
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS_LINE: &str =
        "frame=  100 fps= 25 q=28.0 size=     256kB time=00:00:30.00 bitrate= 69.9kbits/s speed=1.2x";

    #[test]
    fn test_parse_stats_line() {
        let parser = ProgressParser::new(Some(Duration::from_secs(60)));
        let event = parser.parse_line(STATS_LINE).unwrap();
        assert_eq!(event.frame, Some(100));
        assert_eq!(event.time, Some(Duration::from_secs(30)));
        assert!((event.percent.unwrap() - 50.0).abs() < 0.01);
        assert_eq!(event.raw_line, STATS_LINE);
    }

    #[test]
    fn test_either_pattern_is_enough() {
        let parser = ProgressParser::new(None);
        let frame_only = parser.parse_line("frame=12").unwrap();
        assert_eq!(frame_only.frame, Some(12));
        assert_eq!(frame_only.time, None);

        let time_only = parser.parse_line("size=1kB time=01:02:03.50").unwrap();
        assert_eq!(time_only.frame, None);
        assert_eq!(time_only.time, Some(Duration::from_secs_f64(3723.5)));

        assert!(parser.parse_line("Stream #0:0: Video: h264").is_none());
    }

    #[test]
    fn test_percent_requires_known_duration() {
        let parser = ProgressParser::new(Some(Duration::ZERO));
        let event = parser.parse_line(STATS_LINE).unwrap();
        assert_eq!(event.percent, None);
    }

    #[test]
    fn test_percent_is_clamped() {
        let parser = ProgressParser::new(Some(Duration::from_secs(10)));
        let event = parser.parse_line("time=00:01:00.00").unwrap();
        assert_eq!(event.percent, Some(100.0));
        assert_eq!(percent_of(Duration::from_secs(5), Duration::ZERO), 0.0);
    }

    #[test]
    fn test_oversized_time_is_ignored() {
        let parser = ProgressParser::new(Some(Duration::from_secs(30)));
        assert!(parser.parse_line("time=10000000000000000:00:00.00").is_none());

        let event = parser
            .parse_line("frame=  10 time=10000000000000000:00:00.00")
            .unwrap();
        assert_eq!(event.frame, Some(10));
        assert_eq!(event.time, None);
        assert_eq!(event.percent, None);
    }

    #[tokio::test]
    async fn test_lines_split_on_carriage_return() {
        let data: &[u8] = b"Input #0\nframe=1 time=00:00:01.00\rframe=2 time=00:00:02.00\r\n\nlast";
        let mut lines = DiagnosticLines::new(data);
        let mut collected = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            collected.push(line);
        }
        assert_eq!(
            collected,
            vec![
                "Input #0",
                "frame=1 time=00:00:01.00",
                "frame=2 time=00:00:02.00",
                "last"
            ]
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
