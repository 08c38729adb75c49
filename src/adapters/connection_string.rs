// 接続文字列ユーティリティ
//
// 接続文字列は不透明な文字列として扱い、スキームの取り出しと
// ログ出力用のパスワード伏せ字化だけを行う。

/// 接続文字列のスキーム（`postgres://…` の `postgres`）
///
/// # Examples
/// ```
/// use migrate_ledger::adapters::connection_string::scheme;
/// assert_eq!(scheme("postgres://localhost:5432/app"), Some("postgres"));
/// assert_eq!(scheme("sqlite:app.db"), Some("sqlite"));
/// assert_eq!(scheme("app.db"), None);
/// ```
pub fn scheme(dsn: &str) -> Option<&str> {
    let (scheme, _) = dsn.split_once(':')?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// ログ出力用にパスワードを伏せ字にした接続文字列
pub fn redact(dsn: &str) -> String {
    let Some((scheme, rest)) = dsn.split_once("://") else {
        return dsn.to_string();
    };

    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    match authority.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _password)) => format!("{}://{}:***@{}{}", scheme, user, host, tail),
            None => dsn.to_string(),
        },
        None => dsn.to_string(),
    }
}
