//! vidbatch - 動画一括変換
//!
//! FFmpeg を使ってフォルダ内の動画をまとめて変換する。
//!
//! # ライセンス
//! GPL-3.0 (GPLビルドのFFmpegを使用するため)

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use vidbatch::config::Settings;
use vidbatch::ffmpeg::{FfmpegDetector, ToolPaths};
use vidbatch::files::collect_inputs;
use vidbatch::transcoder::{
    format_duration, overall_percent, BatchCallback, BatchEvent, BatchOrchestrator, BatchResult,
    EncoderCapabilityProbe, SequenceAllocator,
};

const PROGRESS_BAR_CHARS: &str = "=>-";
const PROGRESS_BAR_TEMPLATE: &str =
    "{prefix:.bold} [{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}";

#[derive(Parser, Debug)]
#[command(author, version, name = env!("CARGO_BIN_NAME"), about = "Batch convert videos with FFmpeg")]
struct Args {
    /// Input files or directories
    #[arg(
        value_hint = clap::ValueHint::AnyPath,
        required_unless_present_any = ["list_encoders", "reset_sequence"]
    )]
    inputs: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long, value_hint = clap::ValueHint::DirPath)]
    output: Option<PathBuf>,

    /// Target width (0 keeps aspect ratio)
    #[arg(long)]
    width: Option<u32>,

    /// Target height (0 keeps aspect ratio)
    #[arg(long)]
    height: Option<u32>,

    /// Video bitrate, e.g. 1000k
    #[arg(short, long, conflicts_with = "quality")]
    bitrate: Option<String>,

    /// Constant quality value (CRF / CQ), replaces the bitrate
    #[arg(short, long)]
    quality: Option<u8>,

    /// Encoder name or "auto"
    #[arg(short, long)]
    encoder: Option<String>,

    /// Preset: ultrafast, fast, medium, slow, veryslow
    #[arg(short, long)]
    preset: Option<String>,

    /// FFmpeg thread count
    #[arg(short, long)]
    threads: Option<u32>,

    /// Per-file timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Delete source files after a successful conversion (off by default, unlike the previous
    /// converter, which deleted them unless told not to)
    #[arg(short = 'x', long)]
    delete_original: bool,

    /// Output file name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Sequence number store
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    sequence_file: Option<PathBuf>,

    /// Path to the ffmpeg binary or its directory
    #[arg(long, value_hint = clap::ValueHint::AnyPath)]
    ffmpeg: Option<PathBuf>,

    /// Save the given options as new defaults
    #[arg(long)]
    save: bool,

    /// Show detected encoders and exit
    #[arg(long)]
    list_encoders: bool,

    /// Reset the next sequence number
    #[arg(long, value_name = "N")]
    reset_sequence: Option<u64>,

    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// コマンドライン引数で設定を上書き
    fn apply(&self, settings: &mut Settings) {
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(ref bitrate) = self.bitrate {
            settings.bitrate = bitrate.clone();
            settings.use_constant_quality = false;
        }
        if let Some(quality) = self.quality {
            settings.quality = quality;
            settings.use_constant_quality = true;
        }
        if let Some(ref encoder) = self.encoder {
            settings.encoder = encoder.clone();
        }
        if let Some(ref preset) = self.preset {
            settings.preset = preset.clone();
        }
        if let Some(threads) = self.threads {
            settings.threads = threads;
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_secs = timeout;
        }
        if self.delete_original {
            settings.delete_original = true;
        }
        if let Some(ref prefix) = self.prefix {
            settings.output_prefix = prefix.clone();
        }
        if let Some(ref path) = self.sequence_file {
            settings.sequence_file = Some(path.clone());
        }
        if let Some(ref path) = self.ffmpeg {
            settings.ffmpeg_custom_path = Some(path.clone());
        }
        if let Some(ref output) = self.output {
            settings.last_output_dir = Some(output.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ロガー初期化
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("vidbatch v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load().unwrap_or_else(|e| {
        warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    });
    args.apply(&mut settings);

    if args.save {
        settings.save().context("Failed to save settings")?;
        info!("Settings saved to {:?}", Settings::config_path()?);
    }

    let sequence = Arc::new(SequenceAllocator::open(settings.sequence_path()?));
    if let Some(start) = args.reset_sequence {
        sequence.reset(start);
        println!("Next sequence number: {}", sequence.peek());
        if args.inputs.is_empty() && !args.list_encoders {
            return Ok(());
        }
    }

    let ffmpeg = FfmpegDetector::detect(settings.ffmpeg_custom_path.as_deref())
        .context("FFmpeg is required; install it or pass --ffmpeg")?;
    info!("Using FFmpeg {} at {:?}", ffmpeg.version, ffmpeg.ffmpeg_path);

    let tools = ToolPaths::from(&ffmpeg);
    let batch = BatchOrchestrator::new(settings.transcode_settings(), tools, sequence);

    if args.list_encoders {
        print_encoders(batch.probe()).await;
        return Ok(());
    }

    let files = collect_inputs(&args.inputs)?;
    if files.is_empty() {
        println!("No video files to convert found");
        return Ok(());
    }

    let output_dir = settings
        .last_output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    println!(
        "Converting {} file(s) into {}",
        files.len(),
        output_dir.display()
    );

    // Ctrl+C で残りのファイルを中止
    let cancel = batch.cancel_flag();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("\nReceived Ctrl+C, stopping the current file...");
        cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let (sender, mut receiver) = mpsc::unbounded_channel::<BatchEvent>();
    let callback: BatchCallback = Arc::new(move |event: BatchEvent| {
        // 受信側が閉じていれば捨てる
        let _ = sender.send(event);
    });

    let batch = Arc::new(batch);
    let worker = {
        let batch = Arc::clone(&batch);
        let delete_original = settings.delete_original;
        let output_dir = output_dir.clone();
        tokio::spawn(async move {
            batch
                .run_batch(&files, &output_dir, delete_original, Some(callback))
                .await
        })
    };

    let progress_bar = ProgressBar::new(100);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_BAR_TEMPLATE)?
            .progress_chars(PROGRESS_BAR_CHARS),
    );

    let mut current_file = String::new();
    let mut current_source = String::new();
    let (mut current_index, mut current_total) = (0, 0);
    while let Some(event) = receiver.recv().await {
        match event {
            BatchEvent::Position { index, total, file } => {
                current_file = file
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                current_source.clear();
                (current_index, current_total) = (index, total);
                progress_bar.reset();
                progress_bar.set_prefix(batch_prefix(index, total, 0.0));
                progress_bar.set_message(current_file.clone());
            }
            BatchEvent::Probed { info, .. } => {
                current_source = info.describe();
                progress_bar.set_message(format!("{} [{}]", current_file, current_source));
            }
            BatchEvent::File(progress) => {
                if let Some(percent) = progress.percent {
                    progress_bar.set_position(percent.round() as u64);
                    progress_bar.set_prefix(batch_prefix(current_index, current_total, percent));
                }
                if let Some(time) = progress.time {
                    progress_bar.set_message(format!(
                        "{} [{}] {}",
                        current_file,
                        current_source,
                        format_duration(time)
                    ));
                }
            }
            BatchEvent::Finished { file, outcome, .. } => {
                let mark = if outcome.is_success() { "✔" } else { "✘" };
                progress_bar.println(format!("{} {}: {}", mark, file.display(), outcome));
            }
        }
    }
    progress_bar.finish_and_clear();

    let result = worker.await.context("Batch worker stopped unexpectedly")??;
    print_summary(&result);

    if result.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// "[2/5 30%]" 形式のプレフィックス（全体の進捗率付き）
fn batch_prefix(index: usize, total: usize, file_percent: f64) -> String {
    format!(
        "[{}/{} {:>3.0}%]",
        index + 1,
        total,
        overall_percent(index, total, file_percent)
    )
}

/// エンコーダー検出結果を表示
async fn print_encoders(probe: &EncoderCapabilityProbe) {
    let report = probe.report().await;
    println!(
        "FFmpeg: {}",
        report.transcoder_version.as_deref().unwrap_or("not available")
    );

    for encoder in &report.candidates {
        let mark = if encoder.available { "✔" } else { "✘" };
        let note = encoder.note.as_deref().unwrap_or("");
        println!(
            "  {} {:<12} {:<14} {:<10} {}",
            mark,
            encoder.name,
            encoder.hwaccel.display_name(),
            encoder.codec.display_name(),
            note
        );
    }

    if let Some(status) = probe.nvidia_driver_status().await {
        println!("NVIDIA driver: {}", status.message);
    }
    println!("Selected by auto: {}", probe.best_encoder().await);
}

/// バッチ結果のまとめを表示
fn print_summary(result: &BatchResult) {
    println!();
    println!(
        "Converted {} of {} file(s), {} failed",
        result.succeeded, result.total, result.failed
    );
    if result.cancelled {
        println!("Cancelled: {} file(s) not attempted", result.skipped());
    }

    for failure in &result.failures {
        println!("  ✘ {}: {}", failure.path.display(), failure.reason);
    }

    if let Some(ref last_error) = result.last_error {
        println!("\nLast error output:\n{}", last_error);
    }
}
