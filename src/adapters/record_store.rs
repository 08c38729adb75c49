// 記録テーブルのSQL生成
//
// マイグレーション記録テーブルの作成・ロック・参照・追加のSQLを方言ごとに生成します。
// スキーマ名前空間を持たないバックエンドでは、スキーマ名とテーブル名を連結して
// 修飾名を表現します。

use crate::adapters::sql_quote::{quote_identifier_ansi, quote_identifier_mysql};
use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use std::fmt;

/// PostgreSQLの既定スキーマ
pub const POSTGRES_DEFAULT_SCHEMA: &str = "migrate";

/// データベース方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::PostgreSQL => write!(f, "postgresql"),
            Dialect::MySQL => write!(f, "mysql"),
            Dialect::SQLite => write!(f, "sqlite"),
        }
    }
}

/// 記録テーブルのSQLジェネレーター
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStoreSql {
    dialect: Dialect,
    schema: Option<String>,
    table: String,
}

impl RecordStoreSql {
    /// オプションから記録テーブルの位置を決定
    ///
    /// # Arguments
    ///
    /// * `dialect` - データベース方言
    /// * `options` - スキーマ名・テーブル名を含むファクトリオプション
    ///
    /// # Returns
    ///
    /// 識別子が不正な場合はエラー
    pub fn new(dialect: Dialect, options: &MigratorOptions) -> Result<Self, MigrateError> {
        options.validate()?;

        let schema = match dialect {
            Dialect::PostgreSQL => Some(
                options
                    .schema
                    .clone()
                    .unwrap_or_else(|| POSTGRES_DEFAULT_SCHEMA.to_string()),
            ),
            Dialect::MySQL | Dialect::SQLite => options.schema.clone(),
        };

        Ok(Self {
            dialect,
            schema,
            table: options.table_name.clone(),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// クォートなしの修飾名（ロック名やログ用）
    pub fn table_label(&self) -> String {
        match (&self.schema, self.dialect) {
            (Some(schema), Dialect::SQLite) => format!("{}_{}", schema, self.table),
            (Some(schema), _) => format!("{}.{}", schema, self.table),
            (None, _) => self.table.clone(),
        }
    }

    /// クォート済みの修飾テーブル名
    pub fn qualified_table_name(&self) -> String {
        match self.dialect {
            Dialect::PostgreSQL => match &self.schema {
                Some(schema) => format!(
                    "{}.{}",
                    quote_identifier_ansi(schema),
                    quote_identifier_ansi(&self.table)
                ),
                None => quote_identifier_ansi(&self.table),
            },
            Dialect::MySQL => match &self.schema {
                Some(schema) => format!(
                    "{}.{}",
                    quote_identifier_mysql(schema),
                    quote_identifier_mysql(&self.table)
                ),
                None => quote_identifier_mysql(&self.table),
            },
            Dialect::SQLite => quote_identifier_ansi(&self.table_label()),
        }
    }

    /// スキーマ作成SQLを生成（名前空間を持たない場合はNone）
    pub fn generate_create_schema_sql(&self) -> Option<String> {
        match (self.dialect, &self.schema) {
            (Dialect::PostgreSQL, Some(schema)) => Some(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_identifier_ansi(schema)
            )),
            (Dialect::MySQL, Some(schema)) => Some(format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                quote_identifier_mysql(schema)
            )),
            _ => None,
        }
    }

    /// 記録テーブル作成SQLを生成
    pub fn generate_create_table_sql(&self) -> String {
        let table = self.qualified_table_name();
        match self.dialect {
            Dialect::PostgreSQL => format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
    name TEXT NOT NULL PRIMARY KEY,
    checksum BYTEA NOT NULL,
    completed TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    UNIQUE (name, checksum)
)"#,
                table
            ),
            Dialect::MySQL => format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
    name VARCHAR(255) NOT NULL PRIMARY KEY,
    checksum CHAR(88) NOT NULL,
    completed TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    UNIQUE (name, checksum)
)"#,
                table
            ),
            Dialect::SQLite => format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
    name TEXT NOT NULL PRIMARY KEY,
    checksum TEXT NOT NULL,
    completed DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (name, checksum)
)"#,
                table
            ),
        }
    }

    /// 記録テーブルの排他ロックSQLを生成（テーブルロックを持たない場合はNone）
    pub fn generate_lock_table_sql(&self) -> Option<String> {
        match self.dialect {
            Dialect::PostgreSQL => Some(format!(
                "LOCK TABLE {} IN EXCLUSIVE MODE",
                self.qualified_table_name()
            )),
            Dialect::MySQL | Dialect::SQLite => None,
        }
    }

    /// トランザクション開始SQLを生成
    ///
    /// SQLiteは他の接続からの読み書きを締め出す排他トランザクションを要求します。
    pub fn generate_begin_transaction_sql(&self) -> Option<String> {
        match self.dialect {
            Dialect::PostgreSQL => Some("BEGIN".to_string()),
            Dialect::SQLite => Some("BEGIN EXCLUSIVE".to_string()),
            Dialect::MySQL => None,
        }
    }

    /// トランザクションコミットSQLを生成
    pub fn generate_commit_transaction_sql(&self) -> String {
        "COMMIT".to_string()
    }

    /// トランザクションロールバックSQLを生成
    pub fn generate_rollback_transaction_sql(&self) -> String {
        "ROLLBACK".to_string()
    }

    /// 名前による記録取得SQLを生成（パラメータ: name）
    pub fn generate_select_migration_sql(&self) -> String {
        format!(
            "SELECT name, completed, checksum FROM {} WHERE name = {}",
            self.qualified_table_name(),
            self.placeholder(1)
        )
    }

    /// 記録追加SQLを生成（パラメータ: name, checksum, completed）
    pub fn generate_insert_migration_sql(&self) -> String {
        format!(
            "INSERT INTO {} (name, checksum, completed) VALUES ({}, {}, {})",
            self.qualified_table_name(),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    fn placeholder(&self, index: usize) -> String {
        match self.dialect {
            Dialect::PostgreSQL => format!("${}", index),
            Dialect::MySQL | Dialect::SQLite => "?".to_string(),
        }
    }
}
