// コマンド共通コンテキスト
//
// 設定ファイル読み込みやパス解決の重複をCLI層で集約する。

use crate::core::config::Config;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

/// CLIコマンド共通の実行コンテキスト
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub project_path: PathBuf,
    /// 読み込んだ設定ファイル（既定の場所に無ければ None）
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl CommandContext {
    /// プロジェクトルートから設定を読み込んでコンテキストを作成
    ///
    /// 既定の設定ファイルが無い場合は既定値を使います。
    pub fn load(project_path: PathBuf) -> Result<Self> {
        Self::load_with_config(project_path, None)
    }

    /// カスタム設定ファイルパスを指定してコンテキストを作成
    ///
    /// 明示的に指定された設定ファイルが存在しない場合はエラーになります。
    pub fn load_with_config(
        project_path: PathBuf,
        custom_config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let (config_path, required) = match custom_config_path {
            Some(path) => (path, true),
            None => (project_path.join(Config::DEFAULT_CONFIG_PATH), false),
        };

        if !config_path.exists() {
            if required {
                return Err(anyhow!("Config file not found: {:?}", config_path));
            }
            return Ok(Self {
                project_path,
                config_path: None,
                config: Config::default(),
            });
        }

        let config = Config::from_file(&config_path)?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", config_path))?;

        Ok(Self {
            project_path,
            config_path: Some(config_path),
            config,
        })
    }

    /// マイグレーションディレクトリの絶対パス
    pub fn migrations_dir(&self) -> PathBuf {
        self.project_path.join(&self.config.dir)
    }

    /// マイグレーションディレクトリを解決して存在を確認
    ///
    /// コマンドラインで指定されたディレクトリを設定より優先します。
    pub fn resolve_migrations_dir(&self, dir: Option<&Path>) -> Result<PathBuf> {
        let path = match dir {
            Some(dir) => self.project_path.join(dir),
            None => self.migrations_dir(),
        };
        if !path.is_dir() {
            return Err(anyhow!("Migrations directory not found: {:?}", path));
        }
        Ok(path)
    }
}
