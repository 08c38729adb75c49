// コマンドハンドラー層
// 各CLIコマンドの実装

pub mod apply;
pub mod drivers;

use crate::cli::OutputFormat;
use anyhow::{Context, Result};
use serde::Serialize;

/// テキストとJSONの両方で出力できるコマンド結果
pub trait CommandOutput: Serialize {
    /// 人間向けのテキスト表現
    fn to_text(&self) -> String;
}

/// 出力フォーマットに従ってコマンド結果を文字列化
pub fn render_output<T: CommandOutput>(output: &T, format: &OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(output.to_text()),
        OutputFormat::Json => {
            serde_json::to_string_pretty(output).with_context(|| "Failed to serialize output")
        }
    }
}
