// チェックサム計算
//
// マイグレーション内容の読み込みとSHA-512ダイジェストの計算を
// 1回のストリーミングパスで行います。

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha512};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// SHA-512ダイジェストのバイト長
pub const CHECKSUM_LEN: usize = 64;

/// マイグレーション内容のチェックサム
///
/// 比較は常に固定形式のエンコード（標準base64、88文字）で行います。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    /// バイト列のチェックサムを計算
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(Sha512::digest(bytes).to_vec())
    }

    /// 生のダイジェストバイト列
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 固定形式のエンコード
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// バックエンドに保存された生バイト列を固定形式にエンコード
    pub fn encode_raw(raw: &[u8]) -> String {
        STANDARD.encode(raw)
    }

    /// 固定形式でエンコードされた値と一致するかどうか
    pub fn matches(&self, encoded: &str) -> bool {
        self.encode() == encoded.trim()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// 読み込んだバイトをダイジェストに流し込むリーダー
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha512,
}

impl<R> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
        }
    }

    /// これまでに読み込んだバイトのチェックサム
    pub fn finish(self) -> Checksum {
        Checksum(self.hasher.finalize().to_vec())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.hasher.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// 内容をすべて読み込み、同時にチェックサムを計算
pub async fn read_with_checksum<R>(reader: &mut R) -> io::Result<(Vec<u8>, Checksum)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut digest = DigestReader::new(reader);
    let mut statements = Vec::new();
    digest.read_to_end(&mut statements).await?;
    Ok((statements, digest.finish()))
}
