// driversコマンドハンドラー
//
// 登録済みのバックエンドIDを一覧表示します。

use crate::adapters::registry::DriverRegistry;
use crate::cli::commands::{render_output, CommandOutput};
use crate::cli::OutputFormat;
use anyhow::Result;
use serde::Serialize;

/// driversコマンドの入力パラメータ
#[derive(Debug, Clone, Default)]
pub struct DriversCommand {
    /// 出力フォーマット
    pub format: OutputFormat,
}

/// driversコマンドの出力構造体
#[derive(Debug, Clone, Serialize)]
pub struct DriversOutput {
    pub drivers: Vec<String>,
}

impl CommandOutput for DriversOutput {
    fn to_text(&self) -> String {
        self.drivers.join("\n")
    }
}

/// driversコマンドハンドラー
#[derive(Debug, Clone, Default)]
pub struct DriversCommandHandler {}

impl DriversCommandHandler {
    pub fn new() -> Self {
        Self {}
    }

    pub fn execute(&self, registry: &DriverRegistry, command: &DriversCommand) -> Result<String> {
        let output = DriversOutput {
            drivers: registry.drivers(),
        };
        render_output(&output, &command.format)
    }
}
