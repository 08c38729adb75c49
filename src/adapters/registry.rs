// バックエンドレジストリ
//
// バックエンドIDからファクトリを引くための対応表。
// グローバル状態は持たず、呼び出し側が値として保持する。

use crate::adapters::connection_string;
use crate::adapters::mysql::{self, MySqlMigrator};
use crate::adapters::postgres::{self, PostgresMigrator};
use crate::adapters::sqlite::{self, SqliteMigrator};
use crate::core::config::MigratorOptions;
use crate::core::error::MigrateError;
use crate::core::migrator::{Migrator, MigratorFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::info_span;

/// バックエンドIDとファクトリの対応表
///
/// 登録と参照は複数スレッドから同時に行えます。
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, MigratorFactory>>,
}

impl DriverRegistry {
    /// 空のレジストリを作成
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// 組み込みバックエンドを登録したレジストリを作成
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        let mut factories = registry
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for &id in postgres::DRIVER_IDS {
            factories.insert(id.to_string(), PostgresMigrator::factory(id));
        }
        factories.insert(
            sqlite::DRIVER_ID.to_string(),
            SqliteMigrator::factory(sqlite::DRIVER_ID),
        );
        factories.insert(
            mysql::DRIVER_ID.to_string(),
            MySqlMigrator::factory(mysql::DRIVER_ID),
        );

        drop(factories);
        registry
    }

    /// ファクトリを登録
    ///
    /// # Arguments
    ///
    /// * `id` - バックエンドID（空文字列は不可）
    /// * `factory` - `(接続文字列, オプション) → Migrator` を生成するファクトリ
    ///
    /// # Returns
    ///
    /// IDが空、または登録済みの場合はエラー
    pub fn register(
        &self,
        id: impl Into<String>,
        factory: MigratorFactory,
    ) -> Result<(), MigrateError> {
        let id = id.into();
        if id.is_empty() {
            return Err(MigrateError::InvalidBackendId);
        }

        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&id) {
            return Err(MigrateError::DuplicateBackend { id });
        }
        factories.insert(id, factory);
        Ok(())
    }

    /// ファクトリを取得
    pub fn lookup(&self, id: &str) -> Result<MigratorFactory, MigrateError> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        factories
            .get(id)
            .cloned()
            .ok_or_else(|| MigrateError::UnknownBackend {
                id: id.to_string(),
                available: sorted_ids(&factories),
            })
    }

    /// バックエンドを選択して Migrator を生成
    ///
    /// オプションにスパンが指定されていない場合は `migrate` スパンを付与します。
    pub async fn open(
        &self,
        id: &str,
        dsn: &str,
        mut options: MigratorOptions,
    ) -> Result<Box<dyn Migrator>, MigrateError> {
        let factory = self.lookup(id)?;
        if options.span.is_none() {
            options.span = info_span!("migrate", driver = id);
        }
        factory(dsn.to_string(), options).await
    }

    /// 登録済みのバックエンドID（昇順）
    pub fn drivers(&self) -> Vec<String> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        sorted_ids(&factories)
    }

    /// 接続文字列のスキームから登録済みのバックエンドIDを推定
    pub fn infer_driver(&self, dsn: &str) -> Option<String> {
        let scheme = connection_string::scheme(dsn)?.to_lowercase();
        let factories = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        factories.contains_key(&scheme).then_some(scheme)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_ids(factories: &HashMap<String, MigratorFactory>) -> Vec<String> {
    let mut ids: Vec<String> = factories.keys().cloned().collect();
    ids.sort();
    ids
}
