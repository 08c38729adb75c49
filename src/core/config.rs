// 設定管理
//
// バックエンドファクトリに渡すオプションと、
// アプリケーション設定ファイル（YAML形式）の読み込み・検証を行います。

use crate::core::naming::{self, DEFAULT_TABLE_NAME, MIGRATIONS_DIR};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::Span;

/// ソースのパスから記録名を導出する関数
pub type NameFn = Arc<dyn Fn(&Path) -> String + Send + Sync>;

/// バックエンドファクトリのオプション
#[derive(Clone)]
pub struct MigratorOptions {
    /// スキーマ名（未指定の場合はバックエンド既定）
    pub schema: Option<String>,

    /// 記録テーブル名
    pub table_name: String,

    /// 記録名の導出関数
    pub name_fn: NameFn,

    /// ログ出力に使用するスパン
    pub span: Span,
}

impl MigratorOptions {
    pub fn new() -> Self {
        Self {
            schema: None,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            name_fn: Arc::new(naming::final_component),
            span: Span::none(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_name_fn<F>(mut self, name_fn: F) -> Self
    where
        F: Fn(&Path) -> String + Send + Sync + 'static,
    {
        self.name_fn = Arc::new(name_fn);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// パスから記録名を導出
    pub fn record_name(&self, path: &Path) -> String {
        (self.name_fn)(path)
    }

    /// スキーマ名と記録テーブル名を検証
    pub fn validate(&self) -> Result<(), crate::core::error::MigrateError> {
        naming::validate_identifier(&self.table_name)?;
        if let Some(schema) = &self.schema {
            naming::validate_identifier(schema)?;
        }
        Ok(())
    }
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MigratorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigratorOptions")
            .field("schema", &self.schema)
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

/// ログの出力形式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// ログレベル（trace, debug, info, warn, error）
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 出力形式
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// バックエンドID（未指定の場合は接続文字列のスキームから決定）
    #[serde(default)]
    pub driver: Option<String>,

    /// 接続文字列
    #[serde(default)]
    pub dsn: Option<String>,

    /// マイグレーションディレクトリ
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// 記録テーブルのスキーマ名
    #[serde(default)]
    pub schema: Option<String>,

    /// 記録テーブル名
    #[serde(default)]
    pub table: Option<String>,

    /// ログ設定
    #[serde(default)]
    pub log: LogConfig,
}

fn default_dir() -> PathBuf {
    PathBuf::from(MIGRATIONS_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: None,
            dsn: None,
            dir: default_dir(),
            schema: None,
            table: None,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// デフォルトの設定ファイルパス
    pub const DEFAULT_CONFIG_PATH: &'static str = naming::CONFIG_FILE;

    /// 設定ファイルを読み込む
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        content.parse()
    }

    /// 設定の妥当性を検証
    pub fn validate(&self) -> Result<()> {
        if let Some(dsn) = &self.dsn {
            if dsn.trim().is_empty() {
                return Err(anyhow!("Connection string is empty"));
            }
        }

        if self.dir.as_os_str().is_empty() {
            return Err(anyhow!("Migration directory is not specified"));
        }

        if !matches!(
            self.log.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(anyhow!("Unknown log level '{}'", self.log.level));
        }

        self.migrator_options()
            .validate()
            .with_context(|| "Invalid record table configuration")?;

        Ok(())
    }

    /// バックエンドファクトリのオプションを構築
    pub fn migrator_options(&self) -> MigratorOptions {
        let mut options = MigratorOptions::new();
        if let Some(schema) = &self.schema {
            options = options.with_schema(schema.clone());
        }
        if let Some(table) = &self.table {
            options = options.with_table_name(table.clone());
        }
        options
    }
}

/// std::str::FromStrトレイトの実装
impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(yaml: &str) -> Result<Self, Self::Err> {
        serde_saphyr::from_str(yaml).with_context(|| "Failed to parse config file")
    }
}
