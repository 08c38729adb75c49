// CLI Layer
// ユーザー入力の受付とコマンドルーティング

pub mod command_context;
pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// 出力フォーマット
#[derive(Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output (default)
    #[default]
    Text,
    /// Structured JSON output
    Json,
}

/// migrate-ledger - Apply ordered SQL migrations exactly once
#[derive(Parser, Debug)]
#[command(name = "migrate-ledger")]
#[command(author = "migrate-ledger Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Apply ordered SQL migrations exactly once")]
#[command(long_about = "migrate-ledger - Apply ordered SQL migrations exactly once

Every file in the migrations directory is applied in name order and recorded
with a SHA-512 checksum. Files that were already applied are skipped; files
whose content changed after they were applied abort the run.

Executable files are run and their standard output is applied instead.

Supported databases: PostgreSQL, MySQL, SQLite")]
#[command(propagate_version = true)]
#[command(after_help = "GETTING STARTED:
  1. Write migrations:       migrations/001-create.sql, migrations/002-seed.sql
  2. Apply them:             migrate-ledger apply --dsn sqlite://app.db
  3. Re-run safely:          already applied files are skipped

For detailed help on each command, use: migrate-ledger <command> --help")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE", env = "MIGRATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Output format (text or json)
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply every migration in a directory
    ///
    /// Runs all sources in name order inside one run. Either every source is
    /// applied (or skipped because it already was) and the run is committed,
    /// or the run is rolled back and the failing source is reported.
    ///
    /// EXAMPLES:
    ///   # Apply ./migrations to a SQLite database
    ///   migrate-ledger apply --dsn sqlite://app.db
    ///
    ///   # Apply another directory to PostgreSQL with a custom record table
    ///   migrate-ledger apply db/migrations --dsn postgres://localhost/app --table ledger
    Apply {
        /// Migrations directory (defaults to config `dir`, then ./migrations)
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Backend id (defaults to the connection string scheme)
        #[arg(long, value_name = "ID", env = "MIGRATE_DRIVER")]
        driver: Option<String>,

        /// Connection string
        #[arg(long, value_name = "DSN", env = "MIGRATE_DSN")]
        dsn: Option<String>,

        /// Schema of the record table
        #[arg(long, value_name = "SCHEMA", env = "MIGRATE_SCHEMA")]
        schema: Option<String>,

        /// Name of the record table
        #[arg(long, value_name = "TABLE", env = "MIGRATE_TABLE")]
        table: Option<String>,
    },

    /// List registered backend ids
    Drivers,
}
