// Adapters
// ストレージバックエンドへのアクセスを抽象化

pub mod connection_string;
pub mod lock;
pub mod mysql;
pub mod postgres;
pub mod record_store;
pub mod registry;
pub mod sql_quote;
pub mod sqlite;

use tracing::error;

/// バックエンドに拒否されたマイグレーションSQLをログ出力
pub(crate) fn log_rejected_statements(driver: &str, name: &str, err: &sqlx::Error, sql: &str) {
    let code = err
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .map(|code| code.into_owned())
        .unwrap_or_default();

    error!(driver, name, code = %code, error = %err, sql, "error");
}
