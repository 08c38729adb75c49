// SQL識別子クォートユーティリティ
//
// 各データベース方言用の識別子クォート関数を提供します。
// 記録テーブルのSQL生成から使用されます。

/// PostgreSQL/SQLite用識別子クォート（ダブルクォート）
///
/// 識別子内のダブルクォートは二重にエスケープします。
///
/// # Examples
/// ```
/// use migrate_ledger::adapters::sql_quote::quote_identifier_ansi;
/// assert_eq!(quote_identifier_ansi("users"), r#""users""#);
/// assert_eq!(quote_identifier_ansi(r#"table"name"#), r#""table""name""#);
/// ```
pub fn quote_identifier_ansi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// MySQL用識別子クォート（バッククォート）
///
/// 識別子内のバッククォートは二重にエスケープします。
///
/// # Examples
/// ```
/// use migrate_ledger::adapters::sql_quote::quote_identifier_mysql;
/// assert_eq!(quote_identifier_mysql("users"), "`users`");
/// assert_eq!(quote_identifier_mysql("table`name"), "`table``name`");
/// ```
pub fn quote_identifier_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
