//! 設定モジュール

mod settings;

pub use settings::Settings;
