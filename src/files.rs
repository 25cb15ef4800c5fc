//! 入力ファイルの収集

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// 変換対象の拡張子
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm"];

/// 対応している動画形式か（拡張子の大文字小文字は無視）
pub fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// 指定されたパスから変換対象を集める
///
/// ファイルは指定順のまま残す。ディレクトリは直下の対応ファイルを名前順に展開する。
pub fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory {:?}", path))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_supported_format(p))
                .collect();
            entries.sort();
            debug!("{:?}: {} video file(s)", path, entries.len());
            files.extend(entries);
        } else if path.is_file() {
            if is_supported_format(path) {
                files.push(path.clone());
            } else {
                warn!("Skipping unsupported file {:?}", path);
            }
        } else {
            warn!("Input {:?} does not exist", path);
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_format(Path::new("a.mp4")));
        assert!(is_supported_format(Path::new("clip.MKV")));
        assert!(!is_supported_format(Path::new("notes.txt")));
        assert!(!is_supported_format(Path::new("no_extension")));
    }

    #[test]
    fn test_collect_expands_directories_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mov", "a.mp4", "readme.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let explicit = dir.path().join("z.webm");
        fs::write(&explicit, b"x").unwrap();

        let files = collect_inputs(&[explicit.clone(), dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            files,
            vec![
                explicit.clone(),
                dir.path().join("a.mp4"),
                dir.path().join("b.mov"),
                explicit,
            ]
        );
    }

    #[test]
    fn test_missing_and_unsupported_inputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.txt");
        fs::write(&text, b"x").unwrap();

        let files = collect_inputs(&[dir.path().join("gone.mp4"), text]).unwrap();
        assert!(files.is_empty());
    }
}
