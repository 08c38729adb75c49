/// Apply Engine のテスト
///
/// 呼び出しを記録するインメモリの Migrator を使い、バックエンドに依存しない
/// 実行順序・ロールバック・キャンセルの振る舞いを検証します。

#[cfg(test)]
mod apply_engine_tests {
    use async_trait::async_trait;
    use migrate_ledger::core::config::MigratorOptions;
    use migrate_ledger::core::error::{ErrorKind, MigrateError};
    use migrate_ledger::core::migration::{MigrateOutcome, SourceKind};
    use migrate_ledger::core::migrator::{BackendFamily, Content, Migrator, RunState};
    use migrate_ledger::services::apply_engine::ApplyEngine;
    use migrate_ledger::services::source_enumerator::MigrationSource;
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    /// 呼び出しを記録する Migrator
    struct RecordingMigrator {
        family: BackendFamily,
        calls: Arc<Mutex<Vec<String>>>,
        fail_begin: bool,
        fail_on: Option<String>,
        options: MigratorOptions,
        state: RunState,
    }

    impl RecordingMigrator {
        fn new(family: BackendFamily) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let migrator = Self {
                family,
                calls: calls.clone(),
                fail_begin: false,
                fail_on: None,
                options: MigratorOptions::default(),
                state: RunState::Created,
            };
            (migrator, calls)
        }

        fn failing_on(mut self, name: &str) -> Self {
            self.fail_on = Some(name.to_string());
            self
        }

        fn with_options(mut self, options: MigratorOptions) -> Self {
            self.options = options;
            self
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Migrator for RecordingMigrator {
        fn driver(&self) -> &str {
            "recording"
        }

        fn family(&self) -> BackendFamily {
            self.family
        }

        fn options(&self) -> &MigratorOptions {
            &self.options
        }

        async fn begin(&mut self) -> Result<(), MigrateError> {
            self.state.check_begin()?;
            self.record("begin".to_string());
            if self.fail_begin {
                self.state = RunState::Failed;
                return Err(MigrateError::Setup {
                    message: "failed to lock migration table".to_string(),
                    cause: "timeout".to_string(),
                    sql: None,
                });
            }
            self.state = RunState::Began;
            Ok(())
        }

        async fn migrate(
            &mut self,
            name: &str,
            content: Content<'_>,
        ) -> Result<MigrateOutcome, MigrateError> {
            self.state.check_began("migrate")?;
            let mut statements = String::new();
            content
                .read_to_string(&mut statements)
                .await
                .map_err(|e| MigrateError::Read {
                    name: name.to_string(),
                    cause: e.to_string(),
                })?;
            self.record(format!("migrate {} {}", name, statements));

            if self.fail_on.as_deref() == Some(name) {
                return Err(MigrateError::Execution {
                    name: name.to_string(),
                    cause: "syntax error".to_string(),
                    sql: Some(statements),
                });
            }
            Ok(MigrateOutcome::Applied)
        }

        async fn commit(&mut self) -> Result<(), MigrateError> {
            self.state.check_began("commit")?;
            self.record("commit".to_string());
            self.state = RunState::Committed;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), MigrateError> {
            self.state.check_began("rollback")?;
            self.record("rollback".to_string());
            self.state = RunState::RolledBack;
            if self.family.is_reversible() {
                Ok(())
            } else {
                Err(MigrateError::RollbackLimitation {
                    driver: "recording".to_string(),
                })
            }
        }
    }

    fn write_migrations(dir: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
    }

    fn calls(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// ソースは名前順に処理され、成功時は commit のみが呼ばれる
    #[tokio::test]
    async fn test_sources_are_applied_in_name_order() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(
            temp_dir.path(),
            &[
                ("010-index.sql", "CREATE INDEX foo_id ON foo(id)"),
                ("002-insert.sql", "INSERT INTO foo VALUES (1)"),
                ("001-create.sql", "CREATE TABLE foo(id int)"),
            ],
        );
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

        let report = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(
            calls(&log),
            vec![
                "begin",
                "migrate 001-create.sql CREATE TABLE foo(id int)",
                "migrate 002-insert.sql INSERT INTO foo VALUES (1)",
                "migrate 010-index.sql CREATE INDEX foo_id ON foo(id)",
                "commit",
            ]
        );
        assert_eq!(report.driver, "recording");
        assert_eq!(report.applied_count(), 3);
        assert_eq!(report.sources[0].name, "001-create.sql");
        assert_eq!(report.sources[0].kind, SourceKind::Read);
    }

    /// 空のディレクトリでも commit される
    #[tokio::test]
    async fn test_empty_directory_commits() {
        let temp_dir = TempDir::new().unwrap();
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::ExclusiveTransaction);

        let report = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap();

        assert!(report.sources.is_empty());
        assert_eq!(calls(&log), vec!["begin", "commit"]);
    }

    /// 失敗したソース以降は処理されず、ロールバックされる
    #[tokio::test]
    async fn test_failure_rolls_back_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(
            temp_dir.path(),
            &[
                ("001-create.sql", "CREATE TABLE foo(id int)"),
                ("002-broken.sql", "INSERT INTO"),
                ("003-insert.sql", "INSERT INTO foo VALUES (1)"),
            ],
        );
        let (migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);
        let mut migrator = migrator.failing_on("002-broken.sql");

        let error = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Execution);
        assert_eq!(error.migration_name(), Some("002-broken.sql"));
        assert!(!error.is_rollback_limitation());
        assert_eq!(
            calls(&log),
            vec![
                "begin",
                "migrate 001-create.sql CREATE TABLE foo(id int)",
                "migrate 002-broken.sql INSERT INTO",
                "rollback",
            ]
        );
    }

    /// DDLを取り消せないバックエンドではロールバックの制限が呼び出し側に伝わる
    #[tokio::test]
    async fn test_rollback_limitation_is_reported_with_cause() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(
            temp_dir.path(),
            &[
                ("001-create.sql", "CREATE TABLE foo(id int)"),
                ("002-broken.sql", "INSERT INTO"),
            ],
        );
        let (migrator, _log) = RecordingMigrator::new(BackendFamily::NonTransactional);
        let mut migrator = migrator.failing_on("002-broken.sql");

        let error = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap_err();

        assert!(matches!(error, MigrateError::Unreversed { .. }));
        assert!(error.is_rollback_limitation());
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert_eq!(error.migration_name(), Some("002-broken.sql"));
    }

    /// begin に失敗した場合はソースを処理せず、ロールバックも呼ばない
    #[tokio::test]
    async fn test_begin_failure_does_not_roll_back() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(temp_dir.path(), &[("001-create.sql", "CREATE TABLE foo(id int)")]);
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);
        migrator.fail_begin = true;

        let error = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Setup);
        assert_eq!(calls(&log), vec!["begin"]);
    }

    /// ディレクトリを列挙できない場合はロールバックして Read エラー
    #[tokio::test]
    async fn test_missing_directory_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

        let error = ApplyEngine::new()
            .run_dir(&mut migrator, &temp_dir.path().join("missing"))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Read);
        assert_eq!(calls(&log), vec!["begin", "rollback"]);
    }

    /// 読み込めないソースはロールバックして Read エラー
    #[tokio::test]
    async fn test_unreadable_source_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let sources = vec![MigrationSource::new(
            temp_dir.path().join("001-gone.sql"),
            SourceKind::Read,
        )];
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

        let error = ApplyEngine::new()
            .run(&mut migrator, &sources)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Read);
        assert_eq!(error.migration_name(), Some("001-gone.sql"));
        assert_eq!(calls(&log), vec!["begin", "rollback"]);
    }

    /// 記録名はオプションの名前関数から導出される
    #[tokio::test]
    async fn test_record_name_uses_options_name_fn() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(temp_dir.path(), &[("001-create.sql", "CREATE TABLE foo(id int)")]);
        let options = MigratorOptions::new().with_name_fn(|path: &Path| {
            format!("app/{}", path.file_name().unwrap().to_string_lossy())
        });
        let (migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);
        let mut migrator = migrator.with_options(options);

        let report = ApplyEngine::new()
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(report.sources[0].name, "app/001-create.sql");
        assert_eq!(
            calls(&log),
            vec!["begin", "migrate app/001-create.sql CREATE TABLE foo(id int)", "commit"]
        );
    }

    /// キャンセルはロールバックを伴うハードエラーになる
    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        write_migrations(temp_dir.path(), &[("001-create.sql", "CREATE TABLE foo(id int)")]);
        let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

        let token = CancellationToken::new();
        token.cancel();

        let error = ApplyEngine::new()
            .with_cancellation(token)
            .run_dir(&mut migrator, temp_dir.path())
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert_eq!(calls(&log), vec!["begin", "rollback"]);
    }

    #[cfg(unix)]
    mod executable_sources {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        /// 実行ファイルの標準出力がそのまま内容として渡される
        #[tokio::test]
        async fn test_executable_output_is_content() {
            let temp_dir = TempDir::new().unwrap();
            write_script(temp_dir.path(), "003-script.sh", "printf 'SELECT 1;'");
            let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

            let report = ApplyEngine::new()
                .run_dir(&mut migrator, temp_dir.path())
                .await
                .unwrap();

            assert_eq!(
                calls(&log),
                vec!["begin", "migrate 003-script.sh SELECT 1;", "commit"]
            );
            assert_eq!(report.sources[0].kind, SourceKind::Execute);
        }

        /// 0以外で終了した実行ファイルは Read エラーになり、出力は適用されない
        #[tokio::test]
        async fn test_failing_executable_is_read_error() {
            let temp_dir = TempDir::new().unwrap();
            write_script(temp_dir.path(), "001-broken.sh", "printf 'SELECT 1;'\nexit 3");
            let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

            let error = ApplyEngine::new()
                .run_dir(&mut migrator, temp_dir.path())
                .await
                .unwrap_err();

            assert_eq!(error.kind(), ErrorKind::Read);
            assert_eq!(error.migration_name(), Some("001-broken.sh"));
            assert_eq!(calls(&log), vec!["begin", "rollback"]);
        }

        /// キャンセルされた実行ファイルは終了させられ、後続の処理を行わない
        #[tokio::test]
        async fn test_cancelled_executable_is_killed() {
            let temp_dir = TempDir::new().unwrap();
            let marker = temp_dir.path().join("finished");
            write_script(
                temp_dir.path(),
                "001-slow.sh",
                &format!("sleep 1\ntouch '{}'\nprintf 'SELECT 1;'", marker.display()),
            );
            let (mut migrator, log) = RecordingMigrator::new(BackendFamily::TransactionalDdl);

            let token = CancellationToken::new();
            let trigger = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let error = ApplyEngine::new()
                .with_cancellation(token)
                .run_dir(&mut migrator, temp_dir.path())
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Cancelled);
            assert_eq!(calls(&log), vec!["begin", "rollback"]);

            tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
            assert!(!marker.exists(), "script kept running after cancellation");
        }
    }
}
