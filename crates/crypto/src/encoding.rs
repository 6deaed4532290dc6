//! # Hex変換レイヤー
//!
//! quote・コラテラル・ハッシュ類のhex文字列⇄バイト列変換。I/Oも状態も持たない。
//!
//! デコードエラーには入力文字列を一切含めない（秘密鍵を含む可能性があるため）。

/// hexデコードのエラー型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// 文字数が奇数
    #[error("hex文字列の長さが奇数です（{len}文字）")]
    OddLength {
        /// プレフィックス除去後の文字数
        len: usize,
    },
    /// hex以外の文字を含む（文字そのものは出力しない）
    #[error("hex文字列の{index}文字目が不正です")]
    InvalidCharacter {
        /// プレフィックス除去後の位置
        index: usize,
    },
    /// 固定長フィールドの長さ不一致
    #[error("{field}の長さが不正です（期待値: {expected}バイト, 実際: {actual}バイト）")]
    InvalidLength {
        /// フィールド名
        field: &'static str,
        /// 期待されるバイト長
        expected: usize,
        /// 実際のバイト長
        actual: usize,
    },
}

/// `0x` / `0X` プレフィックスを除去する。
pub fn strip_hex_prefix(hex: &str) -> &str {
    hex.strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex)
}

/// hex文字列をバイト列にデコードする。
///
/// - `0x` プレフィックスは任意
/// - 空文字列・プレフィックスのみの場合は空のバイト列
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let body = strip_hex_prefix(hex);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(body).map_err(|e| match e {
        hex::FromHexError::OddLength => DecodeError::OddLength { len: body.len() },
        hex::FromHexError::InvalidHexCharacter { index, .. } => {
            DecodeError::InvalidCharacter { index }
        }
        hex::FromHexError::InvalidStringLength => DecodeError::OddLength { len: body.len() },
    })
}

/// バイト列を小文字hex文字列（プレフィックスなし）にエンコードする。
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// hex文字列を固定長配列にデコードする。
///
/// 空文字列は全ゼロとして扱う（フィールド欠損時のデフォルト）。
pub fn hex_to_array<const N: usize>(
    field: &'static str,
    hex: &str,
) -> Result<[u8; N], DecodeError> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.is_empty() {
        return Ok([0u8; N]);
    }
    bytes.try_into().map_err(|b: Vec<u8>| DecodeError::InvalidLength {
        field,
        expected: N,
        actual: b.len(),
    })
}

/// 比較用にhex文字列を正規化する（プレフィックス除去・小文字化）。
pub fn normalize_hex(hex: &str) -> String {
    strip_hex_prefix(hex).to_ascii_lowercase()
}
