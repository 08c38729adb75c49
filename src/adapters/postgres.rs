// PostgreSQLアダプター
//
// トランザクショナルDDLを持つバックエンド。begin でトランザクションを開始し、
// 記録テーブルを排他ロックする。SQLの実行と記録の追加は同じトランザクション内で行い、
// rollback ではDDLを含めてすべて取り消される。

use crate::adapters::log_rejected_statements;
use crate::adapters::record_store::{Dialect, RecordStoreSql};
use crate::core::checksum::{read_with_checksum, Checksum};
use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use crate::core::migration::{MigrateOutcome, MigrationRecord};
use crate::core::migrator::{
    BackendFamily, Content, Migrator, MigratorFactory, MigratorFuture, RunState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Instrument};

/// このアダプターを登録するバックエンドID
pub const DRIVER_IDS: &[&str] = &["pg", "postgres", "postgresql"];

/// PostgreSQL Migrator
pub struct PostgresMigrator {
    driver: String,
    pool: PgPool,
    sql: RecordStoreSql,
    options: MigratorOptions,
    tx: Option<Transaction<'static, Postgres>>,
    state: RunState,
}

impl PostgresMigrator {
    /// 接続して疎通を確認
    ///
    /// # Arguments
    ///
    /// * `driver` - 登録に使われたバックエンドID
    /// * `dsn` - 接続文字列
    /// * `options` - ファクトリオプション
    pub async fn connect(
        driver: &str,
        dsn: &str,
        options: MigratorOptions,
    ) -> Result<Self, MigrateError> {
        let sql = RecordStoreSql::new(Dialect::PostgreSQL, &options)?;

        let connect_options = PgConnectOptions::from_str(dsn)
            .map_err(|e| MigrateError::connectivity(driver, "invalid connection string", e))?;

        // 1回の実行は1本の接続・1つのトランザクションで完結する
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| MigrateError::connectivity(driver, "failed to connect", e))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| MigrateError::connectivity(driver, "ping failed", e))?;

        Ok(Self {
            driver: driver.to_string(),
            pool,
            sql,
            options,
            tx: None,
            state: RunState::Created,
        })
    }

    /// レジストリに登録するファクトリ
    pub fn factory(driver: &'static str) -> MigratorFactory {
        Arc::new(move |dsn: String, options: MigratorOptions| -> MigratorFuture {
            Box::pin(async move {
                let migrator = PostgresMigrator::connect(driver, &dsn, options).await?;
                Ok(Box::new(migrator) as Box<dyn Migrator>)
            })
        })
    }

    /// 現在の状態
    pub fn state(&self) -> RunState {
        self.state
    }

    async fn open_transaction(
        pool: &PgPool,
        driver: &str,
        sql: &RecordStoreSql,
    ) -> Result<Transaction<'static, Postgres>, MigrateError> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| MigrateError::connectivity(driver, "failed to begin transaction", e))?;

        if let Some(create_schema) = sql.generate_create_schema_sql() {
            (&mut *tx).execute(sqlx::raw_sql(&create_schema))
                .await
                .map_err(|e| MigrateError::setup("failed to create schema", e, Some(&create_schema)))?;
        }

        let create_table = sql.generate_create_table_sql();
        (&mut *tx).execute(sqlx::raw_sql(&create_table))
            .await
            .map_err(|e| {
                MigrateError::setup("failed to create migration table", e, Some(&create_table))
            })?;

        if let Some(lock) = sql.generate_lock_table_sql() {
            (&mut *tx).execute(sqlx::raw_sql(&lock))
                .await
                .map_err(|e| MigrateError::setup("failed to lock migration table", e, Some(&lock)))?;
        }

        Ok(tx)
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

        self.execute(name, &statements).await?;
        self.insert_record(name, &checksum).await?;

        debug!(driver = %self.driver, name, "applied");
        Ok(MigrateOutcome::Applied)
    }

    async fn find_record(&mut self, name: &str) -> Result<Option<MigrationRecord>, MigrateError> {
        let select = self.sql.generate_select_migration_sql();
        let tx = self.transaction("migrate")?;

        let row = (&mut **tx).fetch_optional(sqlx::query(&select)
            .bind(name))
            .await
            .map_err(|e| MigrateError::execution(name, format!("select previous: {}", e), Some(&select)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let scan_error =
            |e: sqlx::Error| MigrateError::execution(name, format!("scan previous: {}", e), Some(&select));
        let completed: DateTime<Utc> = row.try_get("completed").map_err(scan_error)?;
        let checksum: Vec<u8> = row.try_get("checksum").map_err(scan_error)?;

        Ok(Some(MigrationRecord {
            name: row.try_get("name").map_err(scan_error)?,
            checksum: Checksum::encode_raw(&checksum),
            completed,
        }))
    }

    async fn execute(&mut self, name: &str, statements: &str) -> Result<(), MigrateError> {
        let driver = self.driver.clone();
        let tx = self.transaction("migrate")?;

        if let Err(e) = (&mut **tx).execute(sqlx::raw_sql(statements)).await {
            log_rejected_statements(&driver, name, &e, statements);
            return Err(MigrateError::execution(name, e, Some(statements)));
        }
        Ok(())
    }

    async fn insert_record(&mut self, name: &str, checksum: &Checksum) -> Result<(), MigrateError> {
        let insert = self.sql.generate_insert_migration_sql();
        let tx = self.transaction("migrate")?;

        (&mut **tx).execute(sqlx::query(&insert)
            .bind(name)
            .bind(checksum.as_bytes())
            .bind(Utc::now()))
            .await
            .map_err(|e| MigrateError::execution(name, format!("insert record: {}", e), Some(&insert)))?;
        Ok(())
    }

    fn transaction(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Transaction<'static, Postgres>, MigrateError> {
        let state = self.state;
        self.tx.as_mut().ok_or_else(|| MigrateError::InvalidState {
            operation,
            state: state.to_string(),
        })
    }
}

#[async_trait]
impl Migrator for PostgresMigrator {
    fn driver(&self) -> &str {
        &self.driver
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::TransactionalDdl
    }

    fn options(&self) -> &MigratorOptions {
        &self.options
    }

    async fn begin(&mut self) -> Result<(), MigrateError> {
        self.state.check_begin()?;
        let span = self.options.span.clone();

        let opened = Self::open_transaction(&self.pool, &self.driver, &self.sql)
            .instrument(span)
            .await;

        match opened {
            Ok(tx) => {
                self.tx = Some(tx);
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

        let result = match self.tx.take() {
            Some(tx) => tx
                .commit()
                .await
                .map_err(|e| MigrateError::transaction("commit", e)),
            None => Ok(()),
        };
        self.pool.close().await;

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

        let result = match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| MigrateError::transaction("rollback", e)),
            None => Ok(()),
        };
        self.pool.close().await;

        self.state = RunState::RolledBack;
        result
    }
}
