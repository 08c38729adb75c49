// Core Domain
// マイグレーション記録、チェックサム、Migratorコントラクト、エラー分類の純粋なドメインロジック

pub mod checksum;
pub mod config;
pub mod error;
pub mod migration;
pub mod migrator;
pub mod naming;
