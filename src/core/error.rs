// エラー型定義
//
// マイグレーション実行全体で使用されるエラー型を提供します。
// 呼び出し側はメッセージを解析せず、ErrorKind で分岐できます。

use chrono::{DateTime, Utc};
use thiserror::Error;

/// エラーの種類
///
/// 具象エラー型ではなく、実行が失敗した理由の分類を表します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// バックエンドに到達できない
    Connectivity,
    /// 記録テーブルの作成・ロック取得に失敗
    Setup,
    /// 適用済みマイグレーションの内容が変更されている
    Tamper,
    /// バックエンドがマイグレーションのSQLを拒否した
    Execution,
    /// マイグレーション内容を取得できない
    Read,
    /// DDLを取り消せないバックエンドでのロールバック
    RollbackLimitation,
    /// 未登録のバックエンド、登録の重複など
    Registry,
    /// 不正な識別子・状態遷移など呼び出し側の誤用
    Usage,
    /// ホストによるキャンセル
    Cancelled,
}

/// マイグレーションエラー
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Connectivity error
    #[error("Connection error ({driver}): {message} (cause: {cause})")]
    Connectivity {
        /// バックエンドID
        driver: String,
        /// エラーメッセージ
        message: String,
        /// エラー原因
        cause: String,
    },

    /// Setup error
    #[error("Setup error: {message} (cause: {cause})")]
    Setup {
        /// エラーメッセージ
        message: String,
        /// エラー原因
        cause: String,
        /// 失敗したSQL
        sql: Option<String>,
    },

    /// Tamper error
    #[error("{name:?} has been altered since it was run on {completed}")]
    Tamper {
        /// マイグレーション名
        name: String,
        /// 初回適用日時
        completed: DateTime<Utc>,
        /// 記録済みのチェックサム
        recorded: String,
        /// 今回計算したチェックサム
        computed: String,
    },

    /// Execution error
    #[error("Migration {name:?} failed: {cause}")]
    Execution {
        /// マイグレーション名
        name: String,
        /// エラー原因
        cause: String,
        /// 失敗したSQL
        sql: Option<String>,
    },

    /// Transaction error
    #[error("Transaction {operation} failed: {cause}")]
    Transaction {
        /// 失敗した操作（commit, rollback など）
        operation: &'static str,
        /// エラー原因
        cause: String,
    },

    /// Read error
    #[error("Failed to read migration {name:?}: {cause}")]
    Read {
        /// マイグレーション名
        name: String,
        /// エラー原因
        cause: String,
    },

    /// Rollback limitation
    #[error("{driver} does not support rollback; DDL changes are permanent")]
    RollbackLimitation {
        /// バックエンドID
        driver: String,
    },

    /// 元のエラーに加えてロールバックも失敗した
    #[error("{cause}; rollback: {rollback}")]
    Unreversed {
        /// 実行を中断させた元のエラー
        cause: Box<MigrateError>,
        /// ロールバックが返したエラー
        rollback: Box<MigrateError>,
    },

    /// Unknown backend
    #[error("Unknown backend {id:?}. Available backends: {available:?}")]
    UnknownBackend {
        /// 要求されたバックエンドID
        id: String,
        /// 登録済みのバックエンドID
        available: Vec<String>,
    },

    /// Duplicate backend registration
    #[error("Backend {id:?} is already registered")]
    DuplicateBackend {
        /// バックエンドID
        id: String,
    },

    /// Empty backend id
    #[error("Backend id must not be empty")]
    InvalidBackendId,

    /// Invalid identifier
    #[error("Invalid identifier {name:?}: {reason}")]
    InvalidIdentifier {
        /// 識別子
        name: String,
        /// 不正な理由
        reason: String,
    },

    /// Invalid state transition
    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        /// 実行しようとした操作
        operation: &'static str,
        /// 現在の状態
        state: String,
    },

    /// Cancelled by host
    #[error("Migration run cancelled")]
    Cancelled,
}

impl MigrateError {
    /// エラーの種類を取得
    ///
    /// `Unreversed` は元のエラーの種類を返します。
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Connectivity { .. } => ErrorKind::Connectivity,
            MigrateError::Setup { .. } => ErrorKind::Setup,
            MigrateError::Tamper { .. } => ErrorKind::Tamper,
            MigrateError::Execution { .. } | MigrateError::Transaction { .. } => {
                ErrorKind::Execution
            }
            MigrateError::Read { .. } => ErrorKind::Read,
            MigrateError::RollbackLimitation { .. } => ErrorKind::RollbackLimitation,
            MigrateError::Unreversed { cause, .. } => cause.kind(),
            MigrateError::UnknownBackend { .. }
            | MigrateError::DuplicateBackend { .. }
            | MigrateError::InvalidBackendId => ErrorKind::Registry,
            MigrateError::InvalidIdentifier { .. } | MigrateError::InvalidState { .. } => {
                ErrorKind::Usage
            }
            MigrateError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 改ざん検出エラーかどうか
    pub fn is_tamper(&self) -> bool {
        self.kind() == ErrorKind::Tamper
    }

    /// このエラー、またはロールバックの結果がDDLを取り消せなかったことを示すかどうか
    pub fn is_rollback_limitation(&self) -> bool {
        match self {
            MigrateError::RollbackLimitation { .. } => true,
            MigrateError::Unreversed { rollback, .. } => rollback.is_rollback_limitation(),
            _ => false,
        }
    }

    /// エラーに関連するマイグレーション名
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            MigrateError::Tamper { name, .. }
            | MigrateError::Execution { name, .. }
            | MigrateError::Read { name, .. } => Some(name),
            MigrateError::Unreversed { cause, .. } => cause.migration_name(),
            _ => None,
        }
    }

    /// 元のエラーとロールバックのエラーを結合
    pub fn with_rollback(self, rollback: MigrateError) -> Self {
        MigrateError::Unreversed {
            cause: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    pub(crate) fn connectivity(driver: &str, message: &str, cause: impl ToString) -> Self {
        MigrateError::Connectivity {
            driver: driver.to_string(),
            message: message.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn transaction(operation: &'static str, cause: impl ToString) -> Self {
        MigrateError::Transaction {
            operation,
            cause: cause.to_string(),
        }
    }

    pub(crate) fn execution(name: &str, cause: impl ToString, sql: Option<&str>) -> Self {
        MigrateError::Execution {
            name: name.to_string(),
            cause: cause.to_string(),
            sql: sql.map(str::to_string),
        }
    }

    pub(crate) fn read(name: &str, cause: impl ToString) -> Self {
        MigrateError::Read {
            name: name.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn setup(message: &str, cause: impl ToString, sql: Option<&str>) -> Self {
        MigrateError::Setup {
            message: message.to_string(),
            cause: cause.to_string(),
            sql: sql.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tamper() -> MigrateError {
        MigrateError::Tamper {
            name: "001-create.sql".to_string(),
            completed: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            recorded: "old".to_string(),
            computed: "new".to_string(),
        }
    }

    #[test]
    fn test_tamper_message_names_migration_and_time() {
        let message = tamper().to_string();
        assert!(message.contains("001-create.sql"));
        assert!(message.contains("2024-01-01 12:00:00"));
        assert!(tamper().is_tamper());
    }

    #[test]
    fn test_unreversed_keeps_cause_kind() {
        let error = tamper().with_rollback(MigrateError::RollbackLimitation {
            driver: "mysql".to_string(),
        });

        assert_eq!(error.kind(), ErrorKind::Tamper);
        assert!(error.is_rollback_limitation());
        assert_eq!(error.migration_name(), Some("001-create.sql"));
        assert!(error.to_string().contains("does not support rollback"));
    }

    #[test]
    fn test_rollback_limitation_is_not_hidden() {
        let error = MigrateError::RollbackLimitation {
            driver: "mysql".to_string(),
        };
        assert!(error.is_rollback_limitation());
        assert!(!tamper().is_rollback_limitation());
    }

    #[test]
    fn test_registry_kinds() {
        assert_eq!(MigrateError::InvalidBackendId.kind(), ErrorKind::Registry);
        assert_eq!(
            MigrateError::DuplicateBackend {
                id: "pg".to_string()
            }
            .kind(),
            ErrorKind::Registry
        );
    }
}
