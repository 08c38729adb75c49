// Apply Engine
//
// 1回の実行（Begin … Commit | Rollback）を駆動するサービス。
// バックエンドに依存せず、Migrator トレイトだけを通じて操作します。
// ソースは列挙順に1件ずつ処理し、いずれかが失敗した時点でロールバックして中断します。

use crate::core::error::MigrateError;
use crate::core::migration::{RunReport, SourceKind, SourceResult};
use crate::core::migrator::Migrator;
use crate::services::source_enumerator::{MigrationSource, SourceEnumerator};
use chrono::Utc;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Apply Engine
#[derive(Debug, Clone, Default)]
pub struct ApplyEngine {
    enumerator: SourceEnumerator,
    cancel: Option<CancellationToken>,
}

impl ApplyEngine {
    pub fn new() -> Self {
        Self {
            enumerator: SourceEnumerator::new(),
            cancel: None,
        }
    }

    /// キャンセル用トークンを設定
    ///
    /// キャンセルされると処理中のソースを中断し、ロールバックしてから
    /// `MigrateError::Cancelled` を返します。
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// ディレクトリ内のソースを1回の実行として適用
    ///
    /// # Arguments
    ///
    /// * `migrator` - begin 前の Migrator
    /// * `dir` - マイグレーションディレクトリ
    ///
    /// # Returns
    ///
    /// 各ソースの結果。失敗した場合はロールバック後に元のエラーを返します
    pub async fn run_dir(
        &self,
        migrator: &mut dyn Migrator,
        dir: &Path,
    ) -> Result<RunReport, MigrateError> {
        migrator.begin().await?;

        let sources = match self.enumerator.enumerate(dir) {
            Ok(sources) => sources,
            Err(e) => return Err(abort(migrator, e).await),
        };

        self.apply_all(migrator, &sources).await
    }

    /// 列挙済みのソースを1回の実行として適用
    pub async fn run(
        &self,
        migrator: &mut dyn Migrator,
        sources: &[MigrationSource],
    ) -> Result<RunReport, MigrateError> {
        migrator.begin().await?;
        self.apply_all(migrator, sources).await
    }

    async fn apply_all(
        &self,
        migrator: &mut dyn Migrator,
        sources: &[MigrationSource],
    ) -> Result<RunReport, MigrateError> {
        let mut report = RunReport::new(migrator.driver());

        for source in sources {
            match self.apply_cancellable(migrator, source).await {
                Ok(result) => report.sources.push(result),
                Err(e) => return Err(abort(migrator, e).await),
            }
        }

        if self.is_cancelled() {
            return Err(abort(migrator, MigrateError::Cancelled).await);
        }

        migrator.commit().await?;
        Ok(report)
    }

    async fn apply_cancellable(
        &self,
        migrator: &mut dyn Migrator,
        source: &MigrationSource,
    ) -> Result<SourceResult, MigrateError> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(MigrateError::Cancelled),
                    result = apply_one(migrator, source) => result,
                }
            }
            None => apply_one(migrator, source).await,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// 1件のソースを適用
async fn apply_one(
    migrator: &mut dyn Migrator,
    source: &MigrationSource,
) -> Result<SourceResult, MigrateError> {
    let started = Utc::now();
    let name = migrator.record_name(&source.path);

    match source.kind {
        SourceKind::Read => info!(path = %source.path.display(), "read"),
        SourceKind::Execute => info!(path = %source.path.display(), "execute"),
    }

    let mut reader = source.open(&name).await?;
    let outcome = migrator.migrate(&name, &mut *reader).await?;

    Ok(SourceResult {
        name,
        kind: source.kind,
        outcome,
        duration: Utc::now() - started,
    })
}

/// ロールバックして元のエラーを返す
///
/// ロールバック自体が失敗した場合（DDLを取り消せないバックエンドを含む）は、
/// 両方のエラーを保持した `Unreversed` を返します。
async fn abort(migrator: &mut dyn Migrator, cause: MigrateError) -> MigrateError {
    match migrator.rollback().await {
        Ok(()) => cause,
        Err(rollback) => {
            warn!(driver = migrator.driver(), error = %rollback, "rollback failed");
            cause.with_rollback(rollback)
        }
    }
}
