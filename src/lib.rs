// migrate-ledgerライブラリのエントリーポイント
//
// モジュール構造:
// - cli: CLIレイヤー（ユーザー入力の受付とコマンドルーティング）
// - core: コアドメインロジック（エラー分類、チェックサム、Migratorコントラクト、設定）
// - adapters: ストレージバックエンド（レジストリ、PostgreSQL / SQLite / MySQL アダプター）
// - services: 実行オーケストレーション（ソース列挙、Apply Engine）

pub mod adapters;
pub mod cli;
pub mod core;
pub mod services;
