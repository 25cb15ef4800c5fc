//! vidbatch - 動画一括変換エンジン
//!
//! 実際のエンコードは外部の FFmpeg に任せ、エンコーダー検出・コマンド生成・
//! プロセス管理・連番管理を行う。
//!
//! # ライセンス
//! GPL-3.0

pub mod config;
pub mod ffmpeg;
pub mod files;
pub mod transcoder;
