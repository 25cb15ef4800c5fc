//! 出力ファイル用の連番管理
//!
//! 「次に払い出す番号」を1行のテキストファイルに永続化する。
//! 払い出しはプロセス内で直列化され、同じ番号が二度返ることはない。

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// 保存ファイルが無い・壊れている場合の初期値
pub const INITIAL_SEQUENCE: u64 = 1;

/// スレッドセーフな連番アロケーター
#[derive(Debug)]
pub struct SequenceAllocator {
    /// 連番ファイルのパス
    path: PathBuf,
    /// 次に払い出す番号
    next: Mutex<u64>,
}

impl SequenceAllocator {
    /// 連番ファイルを読み込んでアロケーターを作成
    ///
    /// ファイルが存在しない、読めない、整数でない場合は 1 から始める。
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let next = Self::load(&path);
        debug!("Sequence store {:?} starts at {}", path, next);
        Self {
            path,
            next: Mutex::new(next),
        }
    }

    /// 次の番号を取得して進める
    pub fn next(&self) -> u64 {
        let mut next = self.lock();
        let allocated = *next;
        *next = allocated.checked_add(1).unwrap_or_else(|| {
            warn!(
                "Sequence store {:?} reached {}, wrapping to {}",
                self.path, allocated, INITIAL_SEQUENCE
            );
            INITIAL_SEQUENCE
        });
        self.persist(*next);
        allocated
    }

    /// 現在の番号を進めずに取得
    pub fn peek(&self) -> u64 {
        *self.lock()
    }

    /// 番号を上書き
    pub fn reset(&self, start: u64) {
        let mut next = self.lock();
        *next = start;
        self.persist(start);
    }

    /// 連番ファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // 値は常に整合しているので、poisonされていてもそのまま使う
        self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(path: &Path) -> u64 {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return INITIAL_SEQUENCE,
            Err(e) => {
                warn!("Failed to read sequence store {:?}: {}", path, e);
                return INITIAL_SEQUENCE;
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return INITIAL_SEQUENCE;
        }

        match trimmed.parse::<u64>() {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Sequence store {:?} contains {:?} ({}), starting from {}",
                    path, trimmed, e, INITIAL_SEQUENCE
                );
                INITIAL_SEQUENCE
            }
        }
    }

    /// ロック保持中に呼ぶこと
    fn persist(&self, value: u64) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!("Failed to create directory for sequence store {:?}: {}", parent, e);
                }
            }
        }

        if let Err(e) = fs::write(&self.path, value.to_string()) {
            warn!("Failed to save sequence store {:?}: {}", self.path, e);
        }
    }
}
