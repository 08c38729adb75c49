// Services Layer
// バックエンドに依存しない実行オーケストレーション

pub mod apply_engine;
pub mod source_enumerator;
