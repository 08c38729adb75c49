// applyコマンドハンドラー
//
// マイグレーションディレクトリを1回の実行として適用します。
// - 接続文字列とバックエンドIDの解決（フラグ > 環境変数 > 設定ファイル > スキーム）
// - レジストリからの Migrator 生成
// - Apply Engine による実行と結果の表示

use crate::adapters::connection_string;
use crate::adapters::registry::DriverRegistry;
use crate::cli::command_context::CommandContext;
use crate::cli::commands::{render_output, CommandOutput};
use crate::cli::OutputFormat;
use crate::core::migration::{MigrateOutcome, RunReport};
use crate::services::apply_engine::ApplyEngine;
use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// applyコマンドの入力パラメータ
#[derive(Debug, Clone, Default)]
pub struct ApplyCommand {
    /// マイグレーションディレクトリ（指定されない場合は設定ファイルから取得）
    pub dir: Option<PathBuf>,
    /// バックエンドID
    pub driver: Option<String>,
    /// 接続文字列
    pub dsn: Option<String>,
    /// 記録テーブルのスキーマ名
    pub schema: Option<String>,
    /// 記録テーブル名
    pub table: Option<String>,
    /// 出力フォーマット
    pub format: OutputFormat,
}

/// applyコマンドの出力構造体
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutput {
    #[serde(flatten)]
    pub report: RunReport,
    /// 適用数
    pub applied: usize,
    /// スキップ数
    pub skipped: usize,
    /// 合計処理時間
    pub duration_ms: i64,
}

impl ApplyOutput {
    pub fn new(report: RunReport) -> Self {
        Self {
            applied: report.applied_count(),
            skipped: report.skipped_count(),
            duration_ms: report.total_duration().num_milliseconds(),
            report,
        }
    }
}

impl CommandOutput for ApplyOutput {
    fn to_text(&self) -> String {
        let mut output = String::new();

        for source in &self.report.sources {
            let line = match source.outcome {
                MigrateOutcome::Applied => format!(
                    "  {} {} ({}ms)",
                    "✓".green(),
                    source.name,
                    source.duration.num_milliseconds()
                ),
                MigrateOutcome::Skipped { completed } => format!(
                    "  {} {} {}",
                    "-".dimmed(),
                    source.name,
                    format!("(applied {})", completed.format("%Y-%m-%d %H:%M:%S UTC")).dimmed()
                ),
            };
            let _ = writeln!(output, "{}", line);
        }

        let summary = format!(
            "Applied {} migration(s), skipped {} ({}, {}ms)",
            self.applied, self.skipped, self.report.driver, self.duration_ms
        );
        let _ = write!(output, "{}", summary.green().bold());
        output
    }
}

/// applyコマンドハンドラー
pub struct ApplyCommandHandler {
    registry: Arc<DriverRegistry>,
    cancel: Option<CancellationToken>,
}

impl ApplyCommandHandler {
    /// 新しいApplyCommandHandlerを作成
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            cancel: None,
        }
    }

    /// 実行中断用のトークンを設定
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// applyコマンドを実行
    ///
    /// # Arguments
    ///
    /// * `context` - 設定を読み込んだコマンドコンテキスト
    /// * `command` - applyコマンドのパラメータ
    ///
    /// # Returns
    ///
    /// 成功時は実行結果の表示文字列、失敗時は失敗したソースを含むエラー
    pub async fn execute(&self, context: &CommandContext, command: &ApplyCommand) -> Result<String> {
        let config = &context.config;

        let dsn = command
            .dsn
            .clone()
            .or_else(|| config.dsn.clone())
            .ok_or_else(|| {
                anyhow!("Connection string is not specified. Use --dsn, MIGRATE_DSN or `dsn` in the config file")
            })?;

        let driver = self.resolve_driver(command, context, &dsn)?;
        let dir = context.resolve_migrations_dir(command.dir.as_deref())?;

        let mut config = config.clone();
        if command.schema.is_some() {
            config.schema = command.schema.clone();
        }
        if command.table.is_some() {
            config.table = command.table.clone();
        }
        let options = config.migrator_options();
        options
            .validate()
            .with_context(|| "Invalid record table configuration")?;

        info!(
            driver = %driver,
            dsn = %connection_string::redact(&dsn),
            dir = %dir.display(),
            "apply"
        );

        let mut migrator = self
            .registry
            .open(&driver, &dsn, options)
            .await
            .with_context(|| format!("Failed to open {} backend", driver))?;

        let mut engine = ApplyEngine::new();
        if let Some(token) = &self.cancel {
            engine = engine.with_cancellation(token.clone());
        }

        let report = engine
            .run_dir(migrator.as_mut(), &dir)
            .await
            .map_err(|e| {
                let rollback_note = if e.is_rollback_limitation() {
                    "; changes made before the failure were not rolled back"
                } else {
                    ""
                };
                anyhow::Error::new(e).context(format!(
                    "Migration run against {} failed{}",
                    driver, rollback_note
                ))
            })?;

        render_output(&ApplyOutput::new(report), &command.format)
    }

    fn resolve_driver(
        &self,
        command: &ApplyCommand,
        context: &CommandContext,
        dsn: &str,
    ) -> Result<String> {
        if let Some(driver) = command.driver.clone().or_else(|| context.config.driver.clone()) {
            return Ok(driver);
        }

        self.registry.infer_driver(dsn).ok_or_else(|| {
            anyhow!(
                "Cannot determine the backend from the connection string. Use --driver with one of: {}",
                self.registry.drivers().join(", ")
            )
        })
    }
}
