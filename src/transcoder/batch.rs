//! バッチ変換
//!
//! ファイルを指定順に1つずつ変換し、結果を集計する。

use anyhow::{bail, Context, Result};
use futures::FutureExt;
use log::{error, info, warn};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::FfmpegError;
use super::progress::ProgressEvent;
use super::sequence::SequenceAllocator;
use super::session::{CancelFlag, ConversionOutcome, ConversionSession};
use super::{EncoderCapabilityProbe, TranscodeSettings};
use crate::ffmpeg::{MediaInfo, ToolPaths};

/// バッチの進捗イベント
#[derive(Clone, Debug)]
pub enum BatchEvent {
    /// これから変換するファイル（index は 0 始まり）
    Position {
        index: usize,
        total: usize,
        file: PathBuf,
    },
    /// 元ファイルのメタデータ（取得できなかった値は 0 / None）
    Probed { index: usize, info: MediaInfo },
    /// 変換中ファイルの細かい進捗
    File(ProgressEvent),
    /// 1ファイル完了
    Finished {
        index: usize,
        file: PathBuf,
        outcome: ConversionOutcome,
    },
}

/// バッチ全体の進捗率 (0.0 - 100.0)
///
/// `index` 番目のファイルが `file_percent` まで進んだときの値。
pub fn overall_percent(index: usize, total: usize, file_percent: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let done = index as f64 + file_percent.clamp(0.0, 100.0) / 100.0;
    (done / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// 進捗コールバック（ワーカー側で呼ばれるので重い処理をしないこと）
pub type BatchCallback = Arc<dyn Fn(BatchEvent) + Send + Sync>;

/// 失敗理由
#[derive(Clone, Debug, PartialEq)]
pub enum FailureReason {
    /// 外部プロセスが失敗した
    Failed { summary: String, diagnostic: String },
    /// タイムアウト
    TimedOut,
    /// 変換途中でキャンセルされた
    Cancelled,
    /// 変換処理がパニックした
    Panicked(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Failed { summary, .. } => write!(f, "{}", summary),
            FailureReason::TimedOut => write!(f, "timed out"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Panicked(message) => write!(f, "internal error: {}", message),
        }
    }
}

/// 失敗したファイル
#[derive(Clone, Debug, PartialEq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: FailureReason,
}

/// バッチ結果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResult {
    /// 要求されたファイル数
    pub total: usize,
    /// 成功数（コピーを含む）
    pub succeeded: usize,
    /// 失敗数
    pub failed: usize,
    /// 失敗したファイル（入力順）
    pub failures: Vec<FileFailure>,
    /// 最後の失敗の診断出力
    pub last_error: Option<String>,
    /// 途中で打ち切られたか
    pub cancelled: bool,
}

impl BatchResult {
    /// 試行されなかったファイル数
    pub fn skipped(&self) -> usize {
        self.total - self.succeeded - self.failed
    }
}

/// バッチ変換の実行者
pub struct BatchOrchestrator {
    settings: TranscodeSettings,
    tools: ToolPaths,
    sequence: Arc<SequenceAllocator>,
    probe: EncoderCapabilityProbe,
    cancel: CancelFlag,
}

impl BatchOrchestrator {
    pub fn new(settings: TranscodeSettings, tools: ToolPaths, sequence: Arc<SequenceAllocator>) -> Self {
        let probe = EncoderCapabilityProbe::new(tools.ffmpeg.clone());
        Self {
            settings,
            tools,
            sequence,
            probe,
            cancel: CancelFlag::new(),
        }
    }

    /// 能力検出器を差し替える
    pub fn with_probe(mut self, probe: EncoderCapabilityProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn probe(&self) -> &EncoderCapabilityProbe {
        &self.probe
    }

    /// 呼び出し側がキャンセルに使うフラグ
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 変換を始められるか確認し、使うエンコーダー名を返す
    pub async fn preflight(&self) -> Result<String> {
        if !self.probe.transcoder_available().await {
            bail!(
                "ffmpeg at {} cannot be executed; no conversion can run",
                self.tools.ffmpeg.display()
            );
        }

        let encoder = self.probe.resolve(&self.settings.encoder).await;
        info!(
            "Using encoder {} ({})",
            encoder,
            if self.probe.is_hardware_accelerated(&encoder) {
                "hardware"
            } else {
                "software"
            }
        );
        Ok(encoder)
    }

    /// ファイルを順番に変換
    ///
    /// 環境エラーだけが `Err` になる。ファイル単位の失敗は結果に記録される。
    pub async fn run_batch(
        &self,
        files: &[PathBuf],
        output_folder: &Path,
        delete_original: bool,
        on_event: Option<BatchCallback>,
    ) -> Result<BatchResult> {
        self.cancel.reset();

        let encoder = self.preflight().await?;
        let total = files.len();
        let mut result = BatchResult {
            total,
            ..Default::default()
        };

        if let Err(e) = tokio::fs::create_dir_all(output_folder).await {
            warn!("Failed to create output folder {:?}: {}", output_folder, e);
        }

        let emit = |event: BatchEvent| {
            if let Some(ref callback) = on_event {
                callback(event);
            }
        };

        for (index, file) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Batch cancelled, {} file(s) not attempted", total - index);
                result.cancelled = true;
                break;
            }

            // 連番ファイルへの書き込みはブロッキング
            let allocator = Arc::clone(&self.sequence);
            let sequence = tokio::task::spawn_blocking(move || allocator.next())
                .await
                .context("Sequence allocation stopped unexpectedly")?;
            let output = output_folder.join(self.settings.output_file_name(sequence));

            emit(BatchEvent::Position {
                index,
                total,
                file: file.clone(),
            });
            info!("[{}/{}] {:?} -> {:?}", index + 1, total, file, output);

            let request = self.settings.request_for(file, Some(output.clone()));
            let forward = |event: ProgressEvent| emit(BatchEvent::File(event));
            let mut session =
                ConversionSession::new(&request, encoder.as_str(), &self.tools, self.cancel.clone());
            if let Some(ref callback) = on_event {
                let callback = Arc::clone(callback);
                session = session.on_probed(move |info: &MediaInfo| {
                    callback(BatchEvent::Probed {
                        index,
                        info: info.clone(),
                    })
                });
            }

            let outcome = match AssertUnwindSafe(session.run(&forward)).catch_unwind().await {
                Ok(outcome) => {
                    self.record(&mut result, file, &outcome, delete_original).await;
                    outcome
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Conversion of {:?} panicked: {}", file, message);
                    if output.as_path() != file.as_path() {
                        remove_output(&output).await;
                    }
                    result.failed += 1;
                    result.last_error = Some(message.clone());
                    result.failures.push(FileFailure {
                        path: file.clone(),
                        reason: FailureReason::Panicked(message.clone()),
                    });
                    ConversionOutcome::Failed(message)
                }
            };

            emit(BatchEvent::Finished {
                index,
                file: file.clone(),
                outcome,
            });
        }

        if self.cancel.is_cancelled() {
            result.cancelled = true;
        }

        info!(
            "Batch finished: {} succeeded, {} failed, {} not attempted",
            result.succeeded,
            result.failed,
            result.skipped()
        );
        Ok(result)
    }

    async fn record(
        &self,
        result: &mut BatchResult,
        file: &Path,
        outcome: &ConversionOutcome,
        delete_original: bool,
    ) {
        let reason = match outcome {
            ConversionOutcome::Succeeded(output) | ConversionOutcome::SkippedIdentical(output) => {
                info!("{:?}: {}", file, outcome);
                result.succeeded += 1;
                if delete_original && output.as_path() != file {
                    delete_source(file).await;
                }
                return;
            }
            ConversionOutcome::Failed(diagnostic) => {
                let error = FfmpegError::parse(diagnostic);
                FailureReason::Failed {
                    summary: error.format_user_message(),
                    diagnostic: diagnostic.clone(),
                }
            }
            ConversionOutcome::TimedOut => FailureReason::TimedOut,
            ConversionOutcome::Cancelled => FailureReason::Cancelled,
        };

        warn!("{:?}: {}", file, reason);
        result.failed += 1;
        result.last_error = Some(match &reason {
            FailureReason::Failed { diagnostic, .. } => diagnostic.clone(),
            FailureReason::TimedOut => format!(
                "conversion exceeded the {}s timeout",
                self.settings.timeout.as_secs()
            ),
            other => other.to_string(),
        });
        result.failures.push(FileFailure {
            path: file.to_path_buf(),
            reason,
        });
    }
}

/// 元ファイルを削除（失敗しても成功扱いのまま）
async fn delete_source(file: &Path) {
    match tokio::fs::remove_file(file).await {
        Ok(()) => info!("Deleted original {:?}", file),
        Err(e) => warn!("Failed to delete original {:?}: {}", file, e),
    }
}

/// 中断されたセッションの出力を消す
async fn remove_output(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => info!("Removed unfinished output {:?}", output),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove unfinished output {:?}: {}", output, e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
