use anyhow::{Context, Result};
use clap::Parser;
use colored::control as color_control;
use colored::Colorize;
use migrate_ledger::adapters::registry::DriverRegistry;
use migrate_ledger::cli::command_context::CommandContext;
use migrate_ledger::cli::commands::apply::{ApplyCommand, ApplyCommandHandler};
use migrate_ledger::cli::commands::drivers::{DriversCommand, DriversCommandHandler};
use migrate_ledger::cli::{Cli, Commands};
use migrate_ledger::core::config::{LogConfig, LogFormat};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() {
    // CLIをパースして実行
    let cli = Cli::parse();

    // 非同期ランタイムを作成して実行
    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create Tokio runtime")
        .unwrap_or_else(|e| {
            report_error(&e);
            process::exit(1);
        });

    let result = runtime.block_on(run_command(cli));

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            report_error(&e);
            process::exit(1);
        }
    }
}

fn report_error(e: &anyhow::Error) {
    eprintln!("{} {:#}", "error:".red().bold(), e);
}

/// コマンドを実行する
async fn run_command(cli: Cli) -> Result<String> {
    // --no-color フラグの処理
    if cli.no_color {
        color_control::set_override(false);
    }

    // プロジェクトのルートパスを取得
    let project_path = env::current_dir()?;

    // --config フラグの処理（絶対パスに変換）
    let config_path: Option<PathBuf> = cli.config.map(|p| {
        if p.is_absolute() {
            p
        } else {
            project_path.join(p)
        }
    });

    let context = CommandContext::load_with_config(project_path, config_path)?;
    setup_logging(&context.config.log, cli.verbose);

    let registry = Arc::new(DriverRegistry::with_builtin());

    match cli.command {
        Commands::Apply {
            dir,
            driver,
            dsn,
            schema,
            table,
        } => {
            let handler =
                ApplyCommandHandler::new(registry).with_cancellation(setup_signal_handler());
            let command = ApplyCommand {
                dir,
                driver,
                dsn,
                schema,
                table,
                format: cli.format,
            };
            handler.execute(&context, &command).await
        }

        Commands::Drivers => {
            let handler = DriversCommandHandler::new();
            let command = DriversCommand { format: cli.format };
            handler.execute(&registry, &command)
        }
    }
}

/// ログ出力を初期化する
///
/// RUST_LOG が設定されていればそれを優先し、次に --verbose、設定ファイルの順で
/// レベルを決定します。ログは標準エラー出力に書き出します。
fn setup_logging(config: &LogConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Ctrl-C で実行を中断するトークンを作成する
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Rolling back...");
            token.cancel();
        }
    });

    cancel_token
}
