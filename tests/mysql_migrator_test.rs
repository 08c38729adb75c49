/// MySQLアダプターの統合テスト
///
/// testcontainersで起動したMySQLに対して、冪等性・ロールバックの制約・
/// アドバイザリロックによる直列化を検証します。
///
/// 注意: このテストはDockerが必要です。

#[cfg(test)]
mod mysql_migrator_tests {
    use migrate_ledger::adapters::mysql::advisory_lock_name;
    use migrate_ledger::adapters::registry::DriverRegistry;
    use migrate_ledger::core::config::MigratorOptions;
    use migrate_ledger::core::error::{ErrorKind, MigrateError};
    use migrate_ledger::core::migrator::{BackendFamily, Migrator};
    use migrate_ledger::services::apply_engine::ApplyEngine;
    use sqlx::mysql::MySqlPoolOptions;
    use sqlx::MySqlPool;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
    use testcontainers_modules::mysql::Mysql;

    /// MySQLコンテナを起動して接続文字列を返す
    async fn setup_mysql_container(
    ) -> Result<(ContainerAsync<Mysql>, String), Box<dyn std::error::Error>> {
        let container = Mysql::default().with_tag("8.0").start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(3306).await?;
        let dsn = format!("mysql://root@{}:{}/test", host, port);

        // MySQL起動待ち
        tokio::time::sleep(Duration::from_secs(5)).await;

        Ok((container, dsn))
    }

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    async fn open(dsn: &str) -> Box<dyn Migrator> {
        DriverRegistry::with_builtin()
            .open("mysql", dsn, MigratorOptions::default())
            .await
            .unwrap()
    }

    async fn pool(dsn: &str) -> MySqlPool {
        MySqlPoolOptions::new()
            .max_connections(1)
            .connect(dsn)
            .await
            .unwrap()
    }

    async fn count(pool: &MySqlPool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    /// 適用と再実行
    #[tokio::test]
    #[ignore] // Docker必須のため、通常のテスト実行ではスキップ
    async fn test_apply_then_rerun_skips() {
        let (_container, dsn) = setup_mysql_container().await.unwrap();
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        write(dir, "001-create.sql", "CREATE TABLE foo(id int)");
        write(dir, "002-insert.sql", "INSERT INTO foo VALUES (1)");

        let mut migrator = open(&dsn).await;
        assert_eq!(migrator.family(), BackendFamily::NonTransactional);
        let report = ApplyEngine::new()
            .run_dir(migrator.as_mut(), dir)
            .await
            .unwrap();
        assert_eq!(report.applied_count(), 2);

        let mut migrator = open(&dsn).await;
        let report = ApplyEngine::new()
            .run_dir(migrator.as_mut(), dir)
            .await
            .unwrap();
        assert_eq!(report.skipped_count(), 2);

        let pool = pool(&dsn).await;
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM foo").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM schema_migrations").await, 2);
    }

    /// 失敗時、実行済みの変更は残り、ロールバックの制約が報告される
    #[tokio::test]
    #[ignore] // Docker必須のため、通常のテスト実行ではスキップ
    async fn test_failed_run_reports_rollback_limitation() {
        let (_container, dsn) = setup_mysql_container().await.unwrap();
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        write(dir, "001-create.sql", "CREATE TABLE foo(id int)");
        write(dir, "002-broken.sql", "INSERT INTO missing_table VALUES (1)");

        let mut migrator = open(&dsn).await;
        let error = ApplyEngine::new()
            .run_dir(migrator.as_mut(), dir)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Execution);
        assert_eq!(error.migration_name(), Some("002-broken.sql"));
        assert!(error.is_rollback_limitation());
        assert!(matches!(error, MigrateError::Unreversed { .. }));

        let pool = pool(&dsn).await;
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM foo").await, 0);
        assert_eq!(
            count(
                &pool,
                "SELECT COUNT(*) FROM schema_migrations WHERE name = '001-create.sql'"
            )
            .await,
            1
        );
    }

    /// 別セッションがアドバイザリロックを保持している間は begin が待たされる
    #[tokio::test]
    #[ignore] // Docker必須のため、通常のテスト実行ではスキップ
    async fn test_begin_waits_for_advisory_lock() {
        let (_container, dsn) = setup_mysql_container().await.unwrap();

        let holder = pool(&dsn).await;
        let mut conn = holder.acquire().await.unwrap();
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, -1)")
            .bind(advisory_lock_name("test.schema_migrations"))
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(acquired, Some(1));

        let run_dsn = dsn.clone();
        let run = tokio::spawn(async move {
            let mut migrator = open(&run_dsn).await;
            migrator.begin().await?;
            migrator.commit().await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!run.is_finished(), "run should wait for the advisory lock");

        let _: Option<i64> = sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
            .bind(advisory_lock_name("test.schema_migrations"))
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        run.await.unwrap().unwrap();
    }

    /// 同じサーバー上の別データベースへの実行は互いに待たされない
    #[tokio::test]
    #[ignore] // Docker必須のため、通常のテスト実行ではスキップ
    async fn test_runs_on_different_databases_do_not_block() {
        let (_container, dsn) = setup_mysql_container().await.unwrap();

        let admin = pool(&dsn).await;
        sqlx::query("CREATE DATABASE other")
            .execute(&admin)
            .await
            .unwrap();
        let other_dsn = format!("{}other", dsn.trim_end_matches("test"));

        let mut first = open(&dsn).await;
        first.begin().await.unwrap();

        let mut second = open(&other_dsn).await;
        tokio::time::timeout(Duration::from_secs(10), second.begin())
            .await
            .expect("run on another database should not wait")
            .unwrap();

        second.commit().await.unwrap();
        first.commit().await.unwrap();

        let other = pool(&other_dsn).await;
        assert_eq!(
            count(
                &other,
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'other' AND table_name = 'schema_migrations'"
            )
            .await,
            1
        );
    }
}
