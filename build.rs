//! FFmpegパス設定のためのビルドスクリプト
//!
//! 環境変数 FFMPEG_DIR が設定されている場合、そのbinディレクトリを
//! FFMPEG_BIN_PATH としてバイナリに埋め込みます。

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    let Ok(ffmpeg_dir) = env::var("FFMPEG_DIR") else {
        return;
    };

    let dir = PathBuf::from(&ffmpeg_dir);
    let bin_dir = if dir.join("bin").is_dir() {
        dir.join("bin")
    } else {
        dir
    };

    println!("cargo:warning=Embedding ffmpeg search path: {}", bin_dir.display());
    println!("cargo:rustc-env=FFMPEG_BIN_PATH={}", bin_dir.display());
}
