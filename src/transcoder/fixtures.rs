//! テスト用の偽 ffmpeg / ffprobe

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::ffmpeg::ToolPaths;

/// 1920x1080, 30秒の動画として応答する ffprobe
pub const PROBE_1080P_30S: &str = r#"echo '{"format":{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"30.000000"},"streams":[{"codec_type":"audio","codec_name":"aac"},{"codec_type":"video","codec_name":"h264","width":1920,"height":1080}]}'"#;

/// 変換本体の前に置く、能力検出への応答
const CAPABILITY_PRELUDE: &str = r#"case "$1" in
  -version) echo "ffmpeg version 7.0.2 Copyright (c) 2000-2024"; exit 0 ;;
esac
if [ "$1" = "-hide_banner" ] && [ "$2" = "-encoders" ]; then
  echo " V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC"
  exit 0
fi
for last; do :; done
"#;

/// 実行可能なシェルスクリプトを書き出す
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// 偽ツール一式を作る
///
/// `convert` は変換時に実行される部分で、`$last` が出力パス。
pub fn fake_tools(dir: &Path, convert: &str, probe: &str) -> ToolPaths {
    let ffmpeg = write_script(dir, "ffmpeg", &format!("{}{}", CAPABILITY_PRELUDE, convert));
    let ffprobe = write_script(dir, "ffprobe", probe);
    ToolPaths { ffmpeg, ffprobe }
}

/// 中身のある入力ファイルを作る
pub fn write_input(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("fake video payload for {}", name)).unwrap();
    path
}
