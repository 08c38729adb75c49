// 外部ロック
//
// DDLトランザクションを持たないバックエンドは、バックエンド自身が直列化を提供しないため、
// begin で外部の排他リソースを取得し、commit / rollback で解放する。

use crate::core::error::MigrateError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 他の実行の終了を待つ上限（秒）
pub const LOCK_WAIT_SECS: u64 = 300;

/// begin で取得し commit / rollback で解放する排他リソース
#[async_trait]
pub trait ExternalLock: Send {
    /// ロックを取得（取得できるまで待機）
    async fn acquire(&mut self) -> Result<(), MigrateError>;

    /// ロックを解放（保持していなければ何もしない）
    async fn release(&mut self) -> Result<(), MigrateError>;

    /// ロックを保持しているかどうか
    fn is_held(&self) -> bool;
}

fn process_locks() -> &'static StdMutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<StdMutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// プロセス内の排他ロック
///
/// 同じキーを持つロック同士が、同一プロセス内で相互に排他になります。
/// 別プロセス・別ホストとの排他は提供しません。
#[derive(Debug)]
pub struct ProcessLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProcessLock {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            guard: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn mutex(&self) -> Arc<Mutex<()>> {
        let mut locks = process_locks()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(self.key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ExternalLock for ProcessLock {
    async fn acquire(&mut self) -> Result<(), MigrateError> {
        if self.guard.is_none() {
            self.guard = Some(self.mutex().lock_owned().await);
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<(), MigrateError> {
        self.guard = None;
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

/// 複数のロックを順に取得し、逆順に解放する
pub struct LockSet {
    locks: Vec<Box<dyn ExternalLock>>,
}

impl LockSet {
    pub fn new(locks: Vec<Box<dyn ExternalLock>>) -> Self {
        Self { locks }
    }

    /// すべてのロックを取得
    ///
    /// 途中で失敗した場合は、取得済みのロックを解放してからエラーを返します。
    pub async fn acquire_all(&mut self) -> Result<(), MigrateError> {
        for index in 0..self.locks.len() {
            if let Err(error) = self.locks[index].acquire().await {
                // 元のエラーを優先する
                let _ = self.release_all().await;
                return Err(error);
            }
        }
        Ok(())
    }

    /// すべてのロックを解放
    ///
    /// 途中で失敗しても残りのロックの解放を続け、最初のエラーを返します。
    pub async fn release_all(&mut self) -> Result<(), MigrateError> {
        let mut first_error = None;
        for lock in self.locks.iter_mut().rev() {
            if !lock.is_held() {
                continue;
            }
            if let Err(error) = lock.release().await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// すべてのロックを保持しているかどうか
    pub fn is_held(&self) -> bool {
        self.locks.iter().all(|lock| lock.is_held())
    }
}
