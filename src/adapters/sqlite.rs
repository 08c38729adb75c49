// SQLiteアダプター
//
// 排他トランザクションで実行を直列化するバックエンド。1本の接続を確保して
// BEGIN EXCLUSIVE を発行し、commit / rollback まで他の接続からの読み書きを締め出す。
// チェックサムは固定形式（base64）のテキストとして保存する。

use crate::adapters::lock::LOCK_WAIT_SECS;
use crate::adapters::log_rejected_statements;
use crate::adapters::record_store::{Dialect, RecordStoreSql};
use crate::core::checksum::read_with_checksum;
use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use crate::core::migration::{MigrateOutcome, MigrationRecord};
use crate::core::migrator::{
    BackendFamily, Content, Migrator, MigratorFactory, MigratorFuture, RunState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Instrument};

/// このアダプターを登録するバックエンドID
pub const DRIVER_ID: &str = "sqlite";

/// SQLite Migrator
pub struct SqliteMigrator {
    driver: String,
    pool: SqlitePool,
    sql: RecordStoreSql,
    options: MigratorOptions,
    conn: Option<PoolConnection<Sqlite>>,
    state: RunState,
}

impl SqliteMigrator {
    /// データベースファイルを開いて疎通を確認
    ///
    /// ファイルが存在しない場合は作成します。
    pub async fn connect(
        driver: &str,
        dsn: &str,
        options: MigratorOptions,
    ) -> Result<Self, MigrateError> {
        let sql = RecordStoreSql::new(Dialect::SQLite, &options)?;

        let connect_options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| MigrateError::connectivity(driver, "invalid connection string", e))?
            .create_if_missing(true)
            // BEGIN EXCLUSIVE は他の実行が終わるまで待つ
            .busy_timeout(Duration::from_secs(LOCK_WAIT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| MigrateError::connectivity(driver, "failed to open database", e))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| MigrateError::connectivity(driver, "ping failed", e))?;

        Ok(Self {
            driver: driver.to_string(),
            pool,
            sql,
            options,
            conn: None,
            state: RunState::Created,
        })
    }

    /// レジストリに登録するファクトリ
    pub fn factory(driver: &'static str) -> MigratorFactory {
        Arc::new(move |dsn: String, options: MigratorOptions| -> MigratorFuture {
            Box::pin(async move {
                let migrator = SqliteMigrator::connect(driver, &dsn, options).await?;
                Ok(Box::new(migrator) as Box<dyn Migrator>)
            })
        })
    }

    /// 現在の状態
    pub fn state(&self) -> RunState {
        self.state
    }

    async fn open_exclusive(
        pool: &SqlitePool,
        driver: &str,
        sql: &RecordStoreSql,
    ) -> Result<PoolConnection<Sqlite>, MigrateError> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| MigrateError::connectivity(driver, "failed to acquire connection", e))?;

        if let Some(begin) = sql.generate_begin_transaction_sql() {
            (&mut *conn).execute(sqlx::raw_sql(&begin))
                .await
                .map_err(|e| MigrateError::setup("failed to begin exclusive transaction", e, Some(&begin)))?;
        }

        let create_table = sql.generate_create_table_sql();
        if let Err(e) = (&mut *conn).execute(sqlx::raw_sql(&create_table)).await {
            let rollback = sql.generate_rollback_transaction_sql();
            let _ = (&mut *conn).execute(sqlx::raw_sql(&rollback)).await;
            return Err(MigrateError::setup(
                "failed to create migration table",
                e,
                Some(&create_table),
            ));
        }

        Ok(conn)
    }

    async fn apply(&mut self, name: &str, content: Content<'_>) -> Result<MigrateOutcome, MigrateError> {
        let (statements, checksum) = read_with_checksum(content)
            .await
            .map_err(|e| MigrateError::read(name, e))?;
        let statements = String::from_utf8(statements).map_err(|e| MigrateError::read(name, e))?;

        if let Some(previous) = self.find_record(name).await? {
            let outcome = previous.verify(&checksum)?;
            debug!(driver = %self.driver, name, completed = %previous.completed, "skip");
            return Ok(outcome);
        }

        let driver = self.driver.clone();
        let insert = self.sql.generate_insert_migration_sql();
        let conn = self.connection("migrate")?;

        if let Err(e) = (&mut **conn).execute(sqlx::raw_sql(&statements)).await {
            log_rejected_statements(&driver, name, &e, &statements);
            return Err(MigrateError::execution(name, e, Some(&statements)));
        }

        (&mut **conn).execute(sqlx::query(&insert)
            .bind(name)
            .bind(checksum.encode())
            .bind(Utc::now()))
            .await
            .map_err(|e| MigrateError::execution(name, format!("insert record: {}", e), Some(&insert)))?;

        debug!(driver = %driver, name, "applied");
        Ok(MigrateOutcome::Applied)
    }

    async fn find_record(&mut self, name: &str) -> Result<Option<MigrationRecord>, MigrateError> {
        let select = self.sql.generate_select_migration_sql();
        let conn = self.connection("migrate")?;

        let row = (&mut **conn).fetch_optional(sqlx::query(&select)
            .bind(name))
            .await
            .map_err(|e| MigrateError::execution(name, format!("select previous: {}", e), Some(&select)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let scan_error =
            |e: sqlx::Error| MigrateError::execution(name, format!("scan previous: {}", e), Some(&select));
        let completed: DateTime<Utc> = row.try_get("completed").map_err(scan_error)?;

        Ok(Some(MigrationRecord {
            name: row.try_get("name").map_err(scan_error)?,
            checksum: row.try_get("checksum").map_err(scan_error)?,
            completed,
        }))
    }

    /// 保持している接続でトランザクションを終了
    async fn finish(&mut self, operation: &'static str, sql: String) -> Result<(), MigrateError> {
        let result = match self.conn.take() {
            Some(mut conn) => conn
                .execute(sqlx::raw_sql(&sql))
                .await
                .map(|_| ())
                .map_err(|e| MigrateError::transaction(operation, e)),
            None => Ok(()),
        };
        self.pool.close().await;
        result
    }

    fn connection(&mut self, operation: &'static str) -> Result<&mut PoolConnection<Sqlite>, MigrateError> {
        let state = self.state;
        self.conn.as_mut().ok_or_else(|| MigrateError::InvalidState {
            operation,
            state: state.to_string(),
        })
    }
}

#[async_trait]
impl Migrator for SqliteMigrator {
    fn driver(&self) -> &str {
        &self.driver
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::ExclusiveTransaction
    }

    fn options(&self) -> &MigratorOptions {
        &self.options
    }

    async fn begin(&mut self) -> Result<(), MigrateError> {
        self.state.check_begin()?;
        let span = self.options.span.clone();

        let opened = Self::open_exclusive(&self.pool, &self.driver, &self.sql)
            .instrument(span)
            .await;

        match opened {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = RunState::Began;
                Ok(())
            }
            Err(e) => {
                self.state = RunState::Failed;
                self.pool.close().await;
                Err(e)
            }
        }
    }

    async fn migrate(&mut self, name: &str, content: Content<'_>) -> Result<MigrateOutcome, MigrateError> {
        self.state.check_began("migrate")?;
        let span = self.options.span.clone();
        self.apply(name, content).instrument(span).await
    }

    async fn commit(&mut self) -> Result<(), MigrateError> {
        self.state.check_began("commit")?;

        let commit = self.sql.generate_commit_transaction_sql();
        let result = self.finish("commit", commit).await;

        self.state = if result.is_ok() {
            debug!(driver = %self.driver, "commit");
            RunState::Committed
        } else {
            RunState::RolledBack
        };
        result
    }

    async fn rollback(&mut self) -> Result<(), MigrateError> {
        self.state.check_began("rollback")?;

        let rollback = self.sql.generate_rollback_transaction_sql();
        let result = self.finish("rollback", rollback).await;

        self.state = RunState::RolledBack;
        result
    }
}
