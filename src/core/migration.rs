// マイグレーションドメインモデル
//
// 適用済みマイグレーションの記録と、1回の実行（Run）の結果を表現する型。

use crate::core::checksum::Checksum;
use crate::core::error::MigrateError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// マイグレーション記録
///
/// 記録テーブルに保存される1行を表現します。一度書き込まれた記録は更新されません。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// マイグレーション名（ソースのパスから導出）
    pub name: String,

    /// 固定形式でエンコードされたチェックサム
    pub checksum: String,

    /// 適用が完了した日時
    pub completed: DateTime<Utc>,
}

impl MigrationRecord {
    /// 今回計算したチェックサムと記録を照合
    ///
    /// 一致すればスキップ、不一致なら改ざんとしてエラーを返します。
    pub fn verify(&self, computed: &Checksum) -> Result<MigrateOutcome, MigrateError> {
        if computed.matches(&self.checksum) {
            Ok(MigrateOutcome::Skipped {
                completed: self.completed,
            })
        } else {
            Err(MigrateError::Tamper {
                name: self.name.clone(),
                completed: self.completed,
                recorded: self.checksum.clone(),
                computed: computed.encode(),
            })
        }
    }
}

/// 1件のマイグレーション適用結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MigrateOutcome {
    /// SQLを実行して記録を追加した
    Applied,
    /// 同じ内容が適用済みのため実行しなかった
    Skipped {
        /// 初回適用日時
        completed: DateTime<Utc>,
    },
}

impl MigrateOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, MigrateOutcome::Skipped { .. })
    }
}

/// ソースの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 内容をそのまま読み込むファイル
    Read,
    /// 標準出力を内容とする実行ファイル
    Execute,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Read => write!(f, "read"),
            SourceKind::Execute => write!(f, "execute"),
        }
    }
}

/// 実行内で処理された1ソースの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResult {
    /// 記録名
    pub name: String,

    /// ソースの種類
    pub kind: SourceKind,

    /// 適用結果
    pub outcome: MigrateOutcome,

    /// 処理にかかった時間
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
}

/// 1回の実行（Begin … Commit）の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// バックエンドID
    pub driver: String,

    /// 処理順のソース結果
    pub sources: Vec<SourceResult>,
}

impl RunReport {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            sources: Vec::new(),
        }
    }

    /// 適用されたマイグレーション数
    pub fn applied_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.outcome == MigrateOutcome::Applied)
            .count()
    }

    /// スキップされたマイグレーション数
    pub fn skipped_count(&self) -> usize {
        self.sources.iter().filter(|s| s.outcome.is_skipped()).count()
    }

    /// 合計処理時間
    pub fn total_duration(&self) -> Duration {
        self.sources
            .iter()
            .fold(Duration::zero(), |total, s| total + s.duration)
    }
}

// chronoのDurationをミリ秒でシリアライズ/デシリアライズするためのヘルパー
mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_milliseconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::milliseconds(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, outcome: MigrateOutcome, millis: i64) -> SourceResult {
        SourceResult {
            name: name.to_string(),
            kind: SourceKind::Read,
            outcome,
            duration: Duration::milliseconds(millis),
        }
    }

    #[test]
    fn test_verify_matching_checksum_skips() {
        let checksum = Checksum::of(b"CREATE TABLE foo(id int)");
        let completed = Utc::now();
        let record = MigrationRecord {
            name: "001-create.sql".to_string(),
            checksum: checksum.encode(),
            completed,
        };

        assert_eq!(
            record.verify(&checksum).unwrap(),
            MigrateOutcome::Skipped { completed }
        );
    }

    #[test]
    fn test_verify_changed_checksum_is_tamper() {
        let record = MigrationRecord {
            name: "001-create.sql".to_string(),
            checksum: Checksum::of(b"CREATE TABLE foo(id int)").encode(),
            completed: Utc::now(),
        };

        let error = record
            .verify(&Checksum::of(b"CREATE TABLE foo(id bigint)"))
            .unwrap_err();

        assert!(error.is_tamper());
        assert_eq!(error.migration_name(), Some("001-create.sql"));
    }

    #[test]
    fn test_run_report_counts() {
        let mut report = RunReport::new("sqlite");
        report
            .sources
            .push(result("001-create.sql", MigrateOutcome::Applied, 100));
        report.sources.push(result(
            "002-insert.sql",
            MigrateOutcome::Skipped {
                completed: Utc::now(),
            },
            20,
        ));

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.total_duration().num_milliseconds(), 120);
    }

    #[test]
    fn test_run_report_json() {
        let mut report = RunReport::new("postgres");
        report
            .sources
            .push(result("001-create.sql", MigrateOutcome::Applied, 42));

        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["driver"], "postgres");
        assert_eq!(json["sources"][0]["name"], "001-create.sql");
        assert_eq!(json["sources"][0]["kind"], "read");
        assert_eq!(json["sources"][0]["outcome"]["status"], "applied");
        assert_eq!(json["sources"][0]["duration_ms"], 42);
    }
}
