// ソース列挙サービス
//
// マイグレーションディレクトリを非再帰的に走査し、名前順に並べたソースの一覧を作成します。
// 所有者の実行ビットが立った通常ファイルは実行ファイルとして扱い、その標準出力を内容とします。

use crate::core::error::MigrateError;
use crate::core::migration::SourceKind;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;

/// 所有者の実行ビット
pub const MODE_OWNER_EXECUTE: u32 = 0o100;

/// ソースの内容を読み出すリーダー
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// マイグレーションソース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSource {
    /// ソースのパス
    pub path: PathBuf,

    /// ソースの種類
    pub kind: SourceKind,
}

impl MigrationSource {
    pub fn new(path: impl Into<PathBuf>, kind: SourceKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// 内容を読み出すリーダーを開く
    ///
    /// 実行ファイルは引数なし・標準入力なしで起動し、終了を待ってから
    /// 標準出力をリーダーとして返します。起動失敗や0以外の終了コードは
    /// Readエラーになり、途中までの出力が適用されることはありません。
    /// 待機中にフューチャーが破棄された場合、子プロセスは強制終了されます。
    ///
    /// # Arguments
    ///
    /// * `name` - エラーに含める記録名
    pub async fn open(&self, name: &str) -> Result<SourceReader, MigrateError> {
        match self.kind {
            SourceKind::Read => {
                let file = tokio::fs::File::open(&self.path)
                    .await
                    .map_err(|e| MigrateError::read(name, e))?;
                Ok(Box::new(file))
            }
            SourceKind::Execute => {
                let output = tokio::process::Command::new(&self.path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| MigrateError::read(name, format!("failed to execute: {}", e)))?;

                if !output.status.success() {
                    return Err(MigrateError::read(
                        name,
                        format!("{} exited with {}", self.path.display(), output.status),
                    ));
                }

                Ok(Box::new(Cursor::new(output.stdout)))
            }
        }
    }
}

/// ソース列挙サービス
#[derive(Debug, Clone, Default)]
pub struct SourceEnumerator {}

impl SourceEnumerator {
    pub fn new() -> Self {
        Self {}
    }

    /// ディレクトリ直下のソースを名前順に列挙
    ///
    /// サブディレクトリと通常ファイル以外のエントリは読み飛ばします。
    /// シンボリックリンクはリンク先の種類で判定します。
    ///
    /// # Errors
    ///
    /// ディレクトリを読み込めない場合は Read エラー
    pub fn enumerate(&self, dir: &Path) -> Result<Vec<MigrationSource>, MigrateError> {
        let dir_name = dir.display().to_string();
        let entries = fs::read_dir(dir).map_err(|e| MigrateError::read(&dir_name, e))?;

        let mut sources = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrateError::read(&dir_name, e))?;
            let path = entry.path();

            let metadata = fs::metadata(&path)
                .map_err(|e| MigrateError::read(&path.display().to_string(), e))?;
            if !metadata.is_file() {
                continue;
            }

            let kind = if is_executable(&metadata) {
                SourceKind::Execute
            } else {
                SourceKind::Read
            };
            sources.push(MigrationSource::new(path, kind));
        }

        // ファイル名でソート（連番プレフィックスの順序を保証）
        sources.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

        Ok(sources)
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & MODE_OWNER_EXECUTE != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
