// MySQLアダプター
//
// DDLをトランザクションで囲めないバックエンド。begin でプロセス内ロックと
// MySQLのアドバイザリロック（GET_LOCK）を取得して実行を直列化し、各SQLは即時に確定する。
// rollback はロックを解放したうえで RollbackLimitation を返す。

use crate::adapters::lock::{ExternalLock, LockSet, ProcessLock, LOCK_WAIT_SECS};
use crate::adapters::log_rejected_statements;
use crate::adapters::record_store::{Dialect, RecordStoreSql};
use crate::core::checksum::read_with_checksum;
use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use crate::core::migration::{MigrateOutcome, MigrationRecord};
use crate::core::migrator::{
    BackendFamily, Content, Migrator, MigratorFactory, MigratorFuture, RunState,
};
use crate::core::naming::APP_NAME;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, MySqlPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

/// このアダプターを登録するバックエンドID
pub const DRIVER_ID: &str = "mysql";

/// GET_LOCK に渡せるロック名の最大長
pub const MAX_LOCK_NAME_LEN: usize = 64;

/// アドバイザリロックの待ち時間（秒）
pub const ADVISORY_LOCK_TIMEOUT_SECS: i64 = LOCK_WAIT_SECS as i64;

/// 記録テーブルの位置からアドバイザリロック名を決定
///
/// 長すぎる場合はハッシュ値に置き換えます。
pub fn advisory_lock_name(table_label: &str) -> String {
    let name = format!("{}:{}", APP_NAME, table_label);
    if name.len() <= MAX_LOCK_NAME_LEN {
        name
    } else {
        format!("{:x}", Sha256::digest(name.as_bytes()))
    }
}

/// MySQLのアドバイザリロック
///
/// GET_LOCK はセッションに紐づくため、ロック専用の接続を保持します。
pub struct MySqlAdvisoryLock {
    pool: MySqlPool,
    name: String,
    conn: Option<PoolConnection<MySql>>,
}

impl MySqlAdvisoryLock {
    pub fn new(pool: MySqlPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            conn: None,
        }
    }
}

#[async_trait]
impl ExternalLock for MySqlAdvisoryLock {
    async fn acquire(&mut self) -> Result<(), MigrateError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrateError::setup("failed to acquire lock connection", e, None))?;

        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(&self.name)
            .bind(ADVISORY_LOCK_TIMEOUT_SECS)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| MigrateError::setup("failed to acquire advisory lock", e, None))?;

        match acquired {
            Some(1) => {}
            Some(0) => {
                return Err(MigrateError::setup(
                    "failed to acquire advisory lock",
                    format!(
                        "timed out after {}s waiting for {:?}",
                        ADVISORY_LOCK_TIMEOUT_SECS, self.name
                    ),
                    None,
                ));
            }
            other => {
                return Err(MigrateError::setup(
                    "failed to acquire advisory lock",
                    format!("GET_LOCK({:?}) returned {:?}", self.name, other),
                    None,
                ));
            }
        }

        self.conn = Some(conn);
        Ok(())
    }

    async fn release(&mut self) -> Result<(), MigrateError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(&self.name)
            .execute(&mut *conn)
            .await
            .map_err(|e| MigrateError::setup("failed to release advisory lock", e, None))?;
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.conn.is_some()
    }
}

/// MySQL Migrator
pub struct MySqlMigrator {
    driver: String,
    pool: MySqlPool,
    sql: RecordStoreSql,
    options: MigratorOptions,
    locks: LockSet,
    conn: Option<PoolConnection<MySql>>,
    state: RunState,
}

impl MySqlMigrator {
    /// 接続して疎通を確認
    pub async fn connect(
        driver: &str,
        dsn: &str,
        options: MigratorOptions,
    ) -> Result<Self, MigrateError> {
        let sql = RecordStoreSql::new(Dialect::MySQL, &options)?;

        let connect_options = MySqlConnectOptions::from_str(dsn)
            .map_err(|e| MigrateError::connectivity(driver, "invalid connection string", e))?;

        // ロック用とマイグレーション用の2本
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
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
            locks: LockSet::new(Vec::new()),
            conn: None,
            state: RunState::Created,
        })
    }

    /// レジストリに登録するファクトリ
    pub fn factory(driver: &'static str) -> MigratorFactory {
        Arc::new(move |dsn: String, options: MigratorOptions| -> MigratorFuture {
            Box::pin(async move {
                let migrator = MySqlMigrator::connect(driver, &dsn, options).await?;
                Ok(Box::new(migrator) as Box<dyn Migrator>)
            })
        })
    }

    /// 現在の状態
    pub fn state(&self) -> RunState {
        self.state
    }

    /// 記録テーブルが置かれるデータベース名
    ///
    /// スキーマ未指定の場合は接続先のデフォルトデータベースを使います。
    async fn resolve_database(pool: &MySqlPool, sql: &RecordStoreSql) -> Result<String, MigrateError> {
        if let Some(schema) = sql.schema() {
            return Ok(schema.to_string());
        }

        let database: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
            .fetch_one(pool)
            .await
            .map_err(|e| MigrateError::setup("failed to resolve current database", e, None))?;

        database.ok_or_else(|| {
            MigrateError::setup(
                "failed to resolve current database",
                "no database selected; set one in the dsn or pass a schema",
                None,
            )
        })
    }

    async fn prepare(&mut self) -> Result<(), MigrateError> {
        let database = Self::resolve_database(&self.pool, &self.sql).await?;
        let lock_name = advisory_lock_name(&format!("{}.{}", database, self.sql.table()));
        debug!(driver = %self.driver, lock = %lock_name, "acquire locks");

        let locks: Vec<Box<dyn ExternalLock>> = vec![
            Box::new(ProcessLock::new(format!("{}/{}", self.driver, lock_name))),
            Box::new(MySqlAdvisoryLock::new(self.pool.clone(), lock_name)),
        ];
        self.locks = LockSet::new(locks);
        self.locks.acquire_all().await?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrateError::connectivity(&self.driver, "failed to acquire connection", e))?;

        if let Some(create_schema) = self.sql.generate_create_schema_sql() {
            (&mut *conn).execute(sqlx::raw_sql(&create_schema))
                .await
                .map_err(|e| MigrateError::setup("failed to create database", e, Some(&create_schema)))?;
        }

        let create_table = self.sql.generate_create_table_sql();
        (&mut *conn).execute(sqlx::raw_sql(&create_table))
            .await
            .map_err(|e| {
                MigrateError::setup("failed to create migration table", e, Some(&create_table))
            })?;

        self.conn = Some(conn);
        Ok(())
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
        let checksum: String = row.try_get("checksum").map_err(scan_error)?;

        Ok(Some(MigrationRecord {
            name: row.try_get("name").map_err(scan_error)?,
            checksum,
            completed,
        }))
    }

    /// 接続とロックを解放
    async fn release(&mut self) -> Result<(), MigrateError> {
        self.conn = None;
        let result = self.locks.release_all().await;
        self.pool.close().await;
        result
    }

    fn connection(&mut self, operation: &'static str) -> Result<&mut PoolConnection<MySql>, MigrateError> {
        let state = self.state;
        self.conn.as_mut().ok_or_else(|| MigrateError::InvalidState {
            operation,
            state: state.to_string(),
        })
    }
}

#[async_trait]
impl Migrator for MySqlMigrator {
    fn driver(&self) -> &str {
        &self.driver
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::NonTransactional
    }

    fn options(&self) -> &MigratorOptions {
        &self.options
    }

    async fn begin(&mut self) -> Result<(), MigrateError> {
        self.state.check_begin()?;
        let span = self.options.span.clone();

        match self.prepare().instrument(span).await {
            Ok(()) => {
                self.state = RunState::Began;
                Ok(())
            }
            Err(e) => {
                self.state = RunState::Failed;
                // 元のエラーを優先する
                let _ = self.release().await;
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
        let result = self.release().await;
        self.state = RunState::Committed;
        debug!(driver = %self.driver, "commit");
        result
    }

    async fn rollback(&mut self) -> Result<(), MigrateError> {
        self.state.check_began("rollback")?;
        let result = self.release().await;
        self.state = RunState::RolledBack;

        if let Err(e) = result {
            warn!(driver = %self.driver, error = %e, "failed to release locks");
        }
        warn!(driver = %self.driver, "rollback requested; changes already applied are permanent");
        Err(MigrateError::RollbackLimitation {
            driver: self.driver.clone(),
        })
    }
}
