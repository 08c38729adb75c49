// Migratorコントラクト
//
// 各ストレージバックエンドが実装する能力セットと、1回の実行の状態機械を定義します。
// Apply Engine はこのトレイトだけに依存し、バックエンドの違いは
// begin / commit / rollback の意味論に閉じ込められます。

use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use crate::core::migration::MigrateOutcome;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// マイグレーション内容のリーダー
pub type Content<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// バックエンドファクトリが返すFuture
pub type MigratorFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Migrator>, MigrateError>> + Send>>;

/// バックエンドファクトリ
///
/// `(接続文字列, オプション) → Migrator` を生成します。接続と疎通確認はここで行います。
pub type MigratorFactory = Arc<dyn Fn(String, MigratorOptions) -> MigratorFuture + Send + Sync>;

/// バックエンドの並行制御ファミリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    /// トランザクショナルDDL。記録テーブルを排他ロックし、ロールバックでDDLも取り消せる
    TransactionalDdl,
    /// 排他トランザクションのみ。最も強い分離レベルで実行を直列化する
    ExclusiveTransaction,
    /// DDLトランザクションなし。外部ロックで直列化し、ロールバックはエラーを返す
    NonTransactional,
}

impl BackendFamily {
    /// ロールバックで実行済みのDDLを取り消せるかどうか
    pub fn is_reversible(&self) -> bool {
        !matches!(self, BackendFamily::NonTransactional)
    }
}

/// 1回の実行の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Began,
    Committed,
    RolledBack,
    /// begin に失敗した。再利用不可
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Began => "began",
            RunState::Committed => "committed",
            RunState::RolledBack => "rolled back",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl RunState {
    /// 終端状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Committed | RunState::RolledBack | RunState::Failed
        )
    }

    /// begin を呼び出せるか検証
    pub fn check_begin(&self) -> Result<(), MigrateError> {
        self.expect(RunState::Created, "begin")
    }

    /// migrate / commit / rollback を呼び出せるか検証
    pub fn check_began(&self, operation: &'static str) -> Result<(), MigrateError> {
        self.expect(RunState::Began, operation)
    }

    fn expect(&self, expected: RunState, operation: &'static str) -> Result<(), MigrateError> {
        if *self == expected {
            Ok(())
        } else {
            Err(MigrateError::InvalidState {
                operation,
                state: self.to_string(),
            })
        }
    }
}

/// バックエンドアダプターが実装するコントラクト
///
/// 状態遷移: `Created → Began → (migrate)* → Committed | RolledBack`
#[async_trait]
pub trait Migrator: Send {
    /// バックエンドID
    fn driver(&self) -> &str;

    /// 並行制御ファミリー
    fn family(&self) -> BackendFamily;

    /// 生成時に渡されたオプション
    fn options(&self) -> &MigratorOptions;

    /// ソースのパスから記録名を導出（オプションの名前関数を使う）
    fn record_name(&self, path: &Path) -> String {
        self.options().record_name(path)
    }

    /// 記録テーブルを用意し、直列化のためのロックを取得
    async fn begin(&mut self) -> Result<(), MigrateError>;

    /// 1件のマイグレーションを適用（適用済みならスキップ）
    async fn migrate(
        &mut self,
        name: &str,
        content: Content<'_>,
    ) -> Result<MigrateOutcome, MigrateError>;

    /// begin 以降の変更を確定し、ロックと接続を解放
    async fn commit(&mut self) -> Result<(), MigrateError>;

    /// begin 以降の変更を取り消し、ロックと接続を解放
    async fn rollback(&mut self) -> Result<(), MigrateError>;
}
