//! トランスコーダーモジュール

mod batch;
mod command;
mod error;
mod hwaccel;
mod preset;
pub mod progress;
mod sequence;
mod session;

#[cfg(all(test, unix))]
mod fixtures;

pub use batch::{
    overall_percent, BatchCallback, BatchEvent, BatchOrchestrator, BatchResult, FailureReason,
    FileFailure,
};
pub use command::{CommandBuilder, AUDIO_CODEC};
pub use error::{FfmpegError, FfmpegErrorKind};
pub use hwaccel::{
    encoder_listed, CapabilityReport, CapabilitySource, DriverStatus, EncoderCapabilityProbe,
    EncoderInfo, FfmpegCapabilitySource, HwAccelType, BASELINE_ENCODER, MIN_NVIDIA_DRIVER,
};
pub use preset::{
    ContainerFormat, ConversionRequest, EncoderSelector, QualityMode, TranscodeSettings,
    VideoCodec, VideoPreset, DEFAULT_BITRATE, DEFAULT_HEIGHT, DEFAULT_OUTPUT_PREFIX,
    DEFAULT_QUALITY, DEFAULT_TIMEOUT_SECS, DEFAULT_WIDTH,
};
pub use progress::{format_duration, ProgressEvent, ProgressParser};
pub use sequence::{SequenceAllocator, INITIAL_SEQUENCE};
pub use session::{CancelFlag, ConversionOutcome, ConversionSession, ProbeObserver, SessionState};
