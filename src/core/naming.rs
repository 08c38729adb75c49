// 命名ポリシー
//
// アプリケーション名、既定の記録テーブル名、マイグレーション名の導出規則を提供します。

use crate::core::error::MigrateError;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// 現行アプリケーション名
pub const APP_NAME: &str = "migrate-ledger";

/// 既定の設定ファイル名
pub const CONFIG_FILE: &str = ".migrate-ledger.yaml";

/// 既定のマイグレーションディレクトリ
pub const MIGRATIONS_DIR: &str = "migrations";

/// 既定の記録テーブル名
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// 既定のマイグレーション名導出
///
/// パスの最後の要素を記録名とします。
///
/// # Examples
/// ```
/// use migrate_ledger::core::naming::final_component;
/// use std::path::Path;
/// assert_eq!(final_component(Path::new("migrations/001-create.sql")), "001-create.sql");
/// ```
pub fn final_component(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// 識別子の最大長（PostgreSQLの制限に合わせる）
pub const MAX_IDENTIFIER_LEN: usize = 63;

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// スキーマ名・テーブル名として使用できる識別子かどうかを検証
pub fn validate_identifier(name: &str) -> Result<(), MigrateError> {
    if name.is_empty() {
        return Err(MigrateError::InvalidIdentifier {
            name: name.to_string(),
            reason: "identifier is empty".to_string(),
        });
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrateError::InvalidIdentifier {
            name: name.to_string(),
            reason: format!("longer than {} characters", MAX_IDENTIFIER_LEN),
        });
    }
    if !identifier_pattern().is_some_and(|pattern| pattern.is_match(name)) {
        return Err(MigrateError::InvalidIdentifier {
            name: name.to_string(),
            reason: "only ASCII letters, digits and '_' are allowed".to_string(),
        });
    }
    Ok(())
}
