//! 1ファイル分の変換セッション
//!
//! 外部プロセスの起動から終了判定までを担当する。出力ファイルは
//! `Succeeded` / `SkippedIdentical` のときだけ残る。

use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, Instant};

use super::command::CommandBuilder;
use super::progress::{DiagnosticLines, ProgressEvent, ProgressParser};
use super::ConversionRequest;
use crate::ffmpeg::{probe_media, MediaInfo, ToolPaths};

/// キャンセル確認の間隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 保持する診断出力の行数
const DIAGNOSTIC_TAIL_LINES: usize = 200;

/// 協調的キャンセルフラグ（クローンは同じフラグを共有）
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 変換結果
#[derive(Clone, Debug, PartialEq)]
pub enum ConversionOutcome {
    /// 変換成功
    Succeeded(PathBuf),
    /// 解像度が同じなのでコピーした
    SkippedIdentical(PathBuf),
    /// 失敗（診断出力付き）
    Failed(String),
    /// タイムアウト
    TimedOut,
    /// キャンセル
    Cancelled,
}

impl ConversionOutcome {
    /// 出力ファイルが残る結果か
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ConversionOutcome::Succeeded(_) | ConversionOutcome::SkippedIdentical(_)
        )
    }

    /// 出力ファイルのパス
    pub fn output_path(&self) -> Option<&Path> {
        match self {
            ConversionOutcome::Succeeded(path) | ConversionOutcome::SkippedIdentical(path) => {
                Some(path)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConversionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionOutcome::Succeeded(path) => write!(f, "converted to {}", path.display()),
            ConversionOutcome::SkippedIdentical(path) => {
                write!(f, "copied to {} (resolution unchanged)", path.display())
            }
            ConversionOutcome::Failed(_) => write!(f, "failed"),
            ConversionOutcome::TimedOut => write!(f, "timed out"),
            ConversionOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// セッションの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// メタデータ取得中
    Probing,
    /// 解像度一致によるコピー中
    ShortCircuitCopy,
    /// 外部プロセス実行中
    Running,
    /// 終了コード判定中
    Finalizing,
    Succeeded,
    SkippedIdentical,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    fn from_outcome(outcome: &ConversionOutcome) -> Self {
        match outcome {
            ConversionOutcome::Succeeded(_) => SessionState::Succeeded,
            ConversionOutcome::SkippedIdentical(_) => SessionState::SkippedIdentical,
            ConversionOutcome::Failed(_) => SessionState::Failed,
            ConversionOutcome::TimedOut => SessionState::TimedOut,
            ConversionOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

/// メタデータ取得後に呼ばれるフック
pub type ProbeObserver = Box<dyn Fn(&MediaInfo) + Send + Sync>;

/// `select!` で起きた出来事
enum Wake<T> {
    Ready(T),
    Deadline,
    Tick,
}

/// 1ファイル分の変換セッション
pub struct ConversionSession {
    request: ConversionRequest,
    encoder: String,
    tools: ToolPaths,
    cancel: CancelFlag,
    state: SessionState,
    outcome: Option<ConversionOutcome>,
    diagnostic: VecDeque<String>,
    source: Option<MediaInfo>,
    on_probed: Option<ProbeObserver>,
}

impl ConversionSession {
    pub fn new(
        request: &ConversionRequest,
        encoder: impl Into<String>,
        tools: &ToolPaths,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            request: request.clone(),
            encoder: encoder.into(),
            tools: tools.clone(),
            cancel,
            state: SessionState::Idle,
            outcome: None,
            diagnostic: VecDeque::new(),
            source: None,
            on_probed: None,
        }
    }

    /// 元ファイルのメタデータを受け取るフックを登録
    pub fn on_probed(mut self, observer: impl Fn(&MediaInfo) + Send + Sync + 'static) -> Self {
        self.on_probed = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 保持している診断出力（末尾のみ）
    pub fn diagnostic(&self) -> String {
        self.diagnostic.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// 取得済みの元ファイル情報
    pub fn source(&self) -> Option<&MediaInfo> {
        self.source.as_ref()
    }

    /// 変換を実行
    ///
    /// 終端状態に達したあとで呼ぶと、最初の結果をそのまま返す。
    pub async fn run(
        &mut self,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> ConversionOutcome {
        if let Some(ref outcome) = self.outcome {
            return outcome.clone();
        }

        let deadline = Instant::now() + self.request.timeout;
        let output = self.request.resolved_output_path();
        let outcome = self.execute(&output, deadline, on_progress).await;

        self.transition(SessionState::from_outcome(&outcome));
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn execute(
        &mut self,
        output: &Path,
        deadline: Instant,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> ConversionOutcome {
        if self.cancel.is_cancelled() {
            return ConversionOutcome::Cancelled;
        }

        let input = self.request.input_path.clone();
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return ConversionOutcome::Failed(format!("input file not found: {}", input.display()));
        }

        self.transition(SessionState::Probing);
        let media = probe_media(&self.tools.ffprobe, &input).await;
        if let Some(ref observer) = self.on_probed {
            observer(&media);
        }
        self.source = Some(media.clone());

        if self.request.matches_resolution(media.width, media.height) {
            self.transition(SessionState::ShortCircuitCopy);
            return self.copy_source(output, media.duration(), on_progress).await;
        }

        let args = CommandBuilder::build(&self.request, &self.encoder);
        debug!("{:?} {}", self.tools.ffmpeg, args.join(" "));

        let mut child = match Command::new(&self.tools.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ConversionOutcome::Failed(format!(
                    "failed to start {}: {}",
                    self.tools.ffmpeg.display(),
                    e
                ))
            }
        };
        self.transition(SessionState::Running);

        let parser = ProgressParser::new(media.duration());
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

        if let Some(stderr) = child.stderr.take() {
            let mut lines = DiagnosticLines::new(stderr);
            loop {
                if self.cancel.is_cancelled() {
                    return self.abort(&mut child, output, ConversionOutcome::Cancelled).await;
                }

                let wake = tokio::select! {
                    line = lines.next_line() => Wake::Ready(line),
                    _ = sleep_until(deadline) => Wake::Deadline,
                    _ = poll.tick() => Wake::Tick,
                };

                match wake {
                    Wake::Ready(Ok(Some(line))) => {
                        if let Some(event) = parser.parse_line(&line) {
                            on_progress(event);
                        }
                        self.record(line);
                    }
                    Wake::Ready(Ok(None)) => break,
                    Wake::Ready(Err(e)) => {
                        debug!("Stopped reading ffmpeg diagnostics: {}", e);
                        break;
                    }
                    Wake::Deadline => {
                        return self.abort(&mut child, output, ConversionOutcome::TimedOut).await
                    }
                    Wake::Tick => {}
                }
            }
        }

        let status = loop {
            if self.cancel.is_cancelled() {
                return self.abort(&mut child, output, ConversionOutcome::Cancelled).await;
            }

            let wake = tokio::select! {
                status = child.wait() => Wake::Ready(status),
                _ = sleep_until(deadline) => Wake::Deadline,
                _ = poll.tick() => Wake::Tick,
            };

            match wake {
                Wake::Ready(status) => break status,
                Wake::Deadline => {
                    return self.abort(&mut child, output, ConversionOutcome::TimedOut).await
                }
                Wake::Tick => {}
            }
        };

        self.transition(SessionState::Finalizing);
        self.finalize(status, output).await
    }

    /// 解像度が一致する場合はそのままコピー
    async fn copy_source(
        &mut self,
        output: &Path,
        duration: Option<Duration>,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> ConversionOutcome {
        let input = &self.request.input_path;
        if input.as_path() != output {
            if let Err(e) = tokio::fs::copy(input, output).await {
                self.remove_partial(output).await;
                return ConversionOutcome::Failed(format!(
                    "failed to copy {} to {}: {}",
                    input.display(),
                    output.display(),
                    e
                ));
            }
        }

        on_progress(ProgressEvent::completed(
            duration,
            format!("copied {} (resolution unchanged)", input.display()),
        ));
        ConversionOutcome::SkippedIdentical(output.to_path_buf())
    }

    async fn finalize(&mut self, status: io::Result<ExitStatus>, output: &Path) -> ConversionOutcome {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.remove_partial(output).await;
                return ConversionOutcome::Failed(format!("failed to wait for ffmpeg: {}", e));
            }
        };

        if !status.success() {
            self.remove_partial(output).await;
            let mut diagnostic = self.diagnostic();
            if diagnostic.is_empty() {
                diagnostic = format!("ffmpeg exited with {}", status);
            }
            return ConversionOutcome::Failed(diagnostic);
        }

        if tokio::fs::try_exists(output).await.unwrap_or(false) {
            ConversionOutcome::Succeeded(output.to_path_buf())
        } else {
            ConversionOutcome::Failed(format!(
                "ffmpeg exited successfully but {} was not written",
                output.display()
            ))
        }
    }

    /// プロセスを強制終了して部分出力を消す
    async fn abort(
        &mut self,
        child: &mut Child,
        output: &Path,
        outcome: ConversionOutcome,
    ) -> ConversionOutcome {
        debug!("Killing ffmpeg ({})", outcome);
        if let Err(e) = child.start_kill() {
            debug!("ffmpeg already exited: {}", e);
        }
        let _ = child.wait().await;
        self.remove_partial(output).await;
        outcome
    }

    async fn remove_partial(&self, output: &Path) {
        if output == self.request.input_path.as_path() {
            return;
        }
        match tokio::fs::remove_file(output).await {
            Ok(()) => debug!("Removed partial output {:?}", output),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {:?}: {}", output, e),
        }
    }

    fn record(&mut self, line: String) {
        if self.diagnostic.len() == DIAGNOSTIC_TAIL_LINES {
            self.diagnostic.pop_front();
        }
        self.diagnostic.push_back(line);
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "{:?}: {:?} -> {:?}",
            self.request.input_path.file_name().unwrap_or_default(),
            self.state,
            next
        );
        self.state = next;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transcoder::fixtures::{fake_tools, write_input, PROBE_1080P_30S};
    use crate::transcoder::TranscodeSettings;
    use std::sync::Mutex;

    fn request(input: &Path, output: PathBuf, width: u32, height: u32) -> ConversionRequest {
        let settings = TranscodeSettings {
            width,
            height,
            timeout: Duration::from_secs(30),
            ..Default::default()
        };
        settings.request_for(input, Some(output))
    }

    fn ignore(_: ProgressEvent) {}

    #[tokio::test]
    async fn test_successful_conversion_reports_full_progress() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(
            dir.path(),
            r#"echo "frame=  100 fps=50 time=00:00:30.00 bitrate=1.0kbits/s" >&2
printf converted > "$last"
exit 0"#,
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let events = Mutex::new(Vec::new());
        let sink = |event: ProgressEvent| events.lock().unwrap().push(event);
        let mut session = ConversionSession::new(
            &request(&input, output.clone(), 640, 360),
            "libx264",
            &tools,
            CancelFlag::new(),
        );

        let outcome = session.run(&sink).await;
        assert_eq!(outcome, ConversionOutcome::Succeeded(output.clone()));
        assert_eq!(session.state(), SessionState::Succeeded);
        assert!(output.exists());

        let events = events.into_inner().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.frame, Some(100));
        assert!((last.percent.unwrap() - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_source_info_is_reported_before_progress() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(
            dir.path(),
            r#"echo "frame=  10 time=00:00:03.00" >&2
printf converted > "$last""#,
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let log = Arc::new(Mutex::new(Vec::new()));
        let probed = log.clone();
        let mut session = ConversionSession::new(
            &request(&input, output, 640, 360),
            "libx264",
            &tools,
            CancelFlag::new(),
        )
        .on_probed(move |info: &MediaInfo| {
            probed.lock().unwrap().push(format!(
                "{} {}x{}",
                info.codec_name.as_deref().unwrap_or("?"),
                info.width,
                info.height
            ))
        });

        let progress = log.clone();
        let sink = move |_: ProgressEvent| progress.lock().unwrap().push("progress".to_string());
        assert!(session.run(&sink).await.is_success());

        assert_eq!(*log.lock().unwrap(), vec!["h264 1920x1080", "progress"]);
        let source = session.source().unwrap();
        assert_eq!(source.duration(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(
            dir.path(),
            r#"printf partial > "$last"
echo "Unknown encoder 'hevc_amf'" >&2
exit 1"#,
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let mut session = ConversionSession::new(
            &request(&input, output.clone(), 640, 360),
            "hevc_amf",
            &tools,
            CancelFlag::new(),
        );
        let outcome = session.run(&ignore).await;

        match outcome {
            ConversionOutcome::Failed(diagnostic) => assert!(diagnostic.contains("Unknown encoder")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!output.exists());
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(
            dir.path(),
            r#"printf partial > "$last"
exec sleep 10"#,
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let mut req = request(&input, output.clone(), 640, 360);
        req.timeout = Duration::from_millis(500);
        let mut session = ConversionSession::new(&req, "libx264", &tools, CancelFlag::new());

        let started = std::time::Instant::now();
        let outcome = session.run(&ignore).await;
        assert_eq!(outcome, ConversionOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_run() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(
            dir.path(),
            r#"printf partial > "$last"
echo "frame=1 time=00:00:00.04" >&2
exec sleep 10"#,
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let sink = move |_: ProgressEvent| trigger.cancel();
        let mut session = ConversionSession::new(
            &request(&input, output.clone(), 640, 360),
            "libx264",
            &tools,
            cancel,
        );

        let outcome = session.run(&sink).await;
        assert_eq!(outcome, ConversionOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_matching_resolution_copies_without_transcoding() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("invoked");
        let tools = fake_tools(
            dir.path(),
            &format!("touch {:?}\nexit 1", marker),
            PROBE_1080P_30S,
        );
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let events = Mutex::new(Vec::new());
        let sink = |event: ProgressEvent| events.lock().unwrap().push(event);
        let mut session = ConversionSession::new(
            &request(&input, output.clone(), 1920, 1080),
            "libx264",
            &tools,
            CancelFlag::new(),
        );

        let outcome = session.run(&sink).await;
        assert_eq!(outcome, ConversionOutcome::SkippedIdentical(output.clone()));
        assert!(!marker.exists());
        assert_eq!(std::fs::read(&input).unwrap(), std::fs::read(&output).unwrap());

        let events = events.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(dir.path(), r#"printf x > "$last""#, PROBE_1080P_30S);
        let output = dir.path().join("out.mp4");

        let mut session = ConversionSession::new(
            &request(&dir.path().join("missing.mov"), output.clone(), 640, 360),
            "libx264",
            &tools,
            CancelFlag::new(),
        );

        assert!(matches!(session.run(&ignore).await, ConversionOutcome::Failed(_)));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(dir.path(), "exit 0", PROBE_1080P_30S);
        let input = write_input(dir.path(), "source.mov");

        let mut session = ConversionSession::new(
            &request(&input, dir.path().join("out.mp4"), 640, 360),
            "libx264",
            &tools,
            CancelFlag::new(),
        );

        assert!(matches!(session.run(&ignore).await, ConversionOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_terminal_state_is_absorbing() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_tools(dir.path(), r#"printf x > "$last""#, PROBE_1080P_30S);
        let input = write_input(dir.path(), "source.mov");
        let output = dir.path().join("out.mp4");

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut session = ConversionSession::new(
            &request(&input, output.clone(), 640, 360),
            "libx264",
            &tools,
            cancel.clone(),
        );

        assert_eq!(session.run(&ignore).await, ConversionOutcome::Cancelled);
        cancel.reset();
        assert_eq!(session.run(&ignore).await, ConversionOutcome::Cancelled);
        assert!(!output.exists());
    }
}
