//! # Shade Agent 暗号処理
//!
//! エージェントの署名鍵（Ed25519）と、その鍵から導出されるNEARアカウントIDを扱う。
//!
//! ## 鍵導出
//! | 入力 | 導出方法 | TEE由来 |
//! |------|---------|--------|
//! | TEEの鍵素材 | HKDF-SHA256(鍵素材) | ○ |
//! | 導出パス | HKDF-SHA256(パス) | × |
//! | なし | OsRng | × |
//!
//! ## 文字列表現
//! 鍵文字列は `near-crypto` の表現をそのまま使う。
//! - 公開鍵: `ed25519:<base58(32バイト)>`
//! - 秘密鍵: `ed25519:<base58(秘密32バイト ‖ 公開32バイト)>`
//! - アカウントID: 公開鍵の小文字hex（64文字、NEARのimplicit account）

pub mod encoding;

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use near_crypto::{ED25519PublicKey, ED25519SecretKey, ParseKeyError};
use sha2::{Digest, Sha256};

pub use encoding::{bytes_to_hex, hex_to_bytes, DecodeError};

/// 導出パスから非TEEのシードを得る際のHKDF info。
const PATH_SEED_INFO: &[u8] = b"shade-agent-derivation-path";

/// TEEの鍵素材からシードを得る際のHKDF info。
const TEE_SEED_INFO: &[u8] = b"shade-agent-tee-key";

/// 鍵処理のエラー型。
///
/// どのバリアントも入力文字列を含めない。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// `ed25519:` 以外の鍵種別
    #[error("未対応の鍵種別です（ed25519のみ対応）")]
    UnsupportedKeyType,
    /// 鍵文字列のデコードに失敗
    #[error("鍵文字列のデコードに失敗しました")]
    InvalidEncoding,
    /// バイト長が不正
    #[error("鍵の長さが不正です（期待値: {expected}バイト, 実際: {actual}バイト）")]
    InvalidLength {
        /// 期待されるバイト長
        expected: usize,
        /// 実際のバイト長
        actual: usize,
    },
    /// 秘密鍵と公開鍵の組が一致しない、または曲線上の点でない
    #[error("鍵の内容が不正です")]
    InvalidKey,
    /// HKDF鍵導出エラー
    #[error("HKDF鍵導出に失敗しました: {0}")]
    HkdfError(String),
}

// ---------------------------------------------------------------------------
// 公開鍵
// ---------------------------------------------------------------------------

/// Ed25519公開鍵。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// 32バイトから公開鍵を構築する。
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// 公開鍵のバイト列。
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// この公開鍵に対応するimplicit account ID（小文字hex 64文字）。
    pub fn implicit_account_id(&self) -> String {
        bytes_to_hex(&self.0)
    }

    /// 署名を検証する。
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(signature);
        key.verify(message, &signature).is_ok()
    }

    /// `near-crypto` の公開鍵に変換する。
    pub fn to_near(&self) -> near_crypto::PublicKey {
        near_crypto::PublicKey::ED25519(ED25519PublicKey(self.0))
    }

    /// `near-crypto` の公開鍵から変換する。ed25519以外は `UnsupportedKeyType`。
    pub fn from_near(key: &near_crypto::PublicKey) -> Result<Self, KeyError> {
        match key {
            near_crypto::PublicKey::ED25519(k) => Ok(Self(k.0)),
            _ => Err(KeyError::UnsupportedKeyType),
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_near(), f)
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = near_crypto::PublicKey::from_str(s).map_err(key_error)?;
        Self::from_near(&key)
    }
}

// ---------------------------------------------------------------------------
// エージェント鍵
// ---------------------------------------------------------------------------

/// エージェントの署名鍵。
///
/// `Debug` は公開鍵のみを出力する。秘密鍵文字列は
/// [`AgentKey::to_secret_string`] からのみ取り出せる。
#[derive(Clone)]
pub struct AgentKey {
    signing_key: SigningKey,
}

impl AgentKey {
    /// 32バイトのシードから鍵を構築する。
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// OsRngで新しい鍵を生成する。
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// 公開鍵。
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// この鍵に対応するimplicit account ID。
    pub fn account_id(&self) -> String {
        self.public_key().implicit_account_id()
    }

    /// メッセージに署名する。
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// `near-crypto` の秘密鍵に変換する（トランザクション署名用）。
    pub fn to_near_secret_key(&self) -> near_crypto::SecretKey {
        near_crypto::SecretKey::ED25519(ED25519SecretKey(self.signing_key.to_keypair_bytes()))
    }

    /// 秘密鍵文字列（`ed25519:<base58(64バイト)>`）。
    ///
    /// ログやエラーメッセージに渡してはならない。
    pub fn to_secret_string(&self) -> String {
        self.to_near_secret_key().to_string()
    }

    /// 秘密鍵文字列から鍵を復元する。
    pub fn from_secret_string(s: &str) -> Result<Self, KeyError> {
        match near_crypto::SecretKey::from_str(s).map_err(key_error)? {
            near_crypto::SecretKey::ED25519(ED25519SecretKey(keypair)) => {
                let signing_key =
                    SigningKey::from_keypair_bytes(&keypair).map_err(|_| KeyError::InvalidKey)?;
                Ok(Self { signing_key })
            }
            _ => Err(KeyError::UnsupportedKeyType),
        }
    }
}

impl fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AgentKey").field(&self.public_key().to_string()).finish()
    }
}

impl PartialEq for AgentKey {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for AgentKey {}

// ---------------------------------------------------------------------------
// シード導出
// ---------------------------------------------------------------------------

/// 導出パスから決定論的なシードを得る（非TEE）。
///
/// 同じパスは常に同じシードになる。
pub fn seed_from_derivation_path(path: &str) -> Result<[u8; 32], KeyError> {
    hkdf_seed(path.as_bytes(), PATH_SEED_INFO)
}

/// TEEの鍵素材からシードを得る。
pub fn seed_from_tee_key_material(material: &[u8]) -> Result<[u8; 32], KeyError> {
    hkdf_seed(material, TEE_SEED_INFO)
}

/// OsRngで32バイトのランダム値を生成する。
pub fn random_bytes32() -> [u8; 32] {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

fn hkdf_seed(ikm: &[u8], info: &[u8]) -> Result<[u8; 32], KeyError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut seed = [0u8; 32];
    hkdf.expand(info, &mut seed)
        .map_err(|e| KeyError::HkdfError(e.to_string()))?;
    Ok(seed)
}

/// `near-crypto` のパースエラーを変換する。入力文字列は引き継がない。
fn key_error(e: ParseKeyError) -> KeyError {
    match e {
        ParseKeyError::UnknownKeyType { .. } => KeyError::UnsupportedKeyType,
        ParseKeyError::InvalidLength {
            expected_length,
            received_length,
        } => KeyError::InvalidLength {
            expected: expected_length,
            actual: received_length,
        },
        _ => KeyError::InvalidEncoding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_roundtrip() {
        let key = AgentKey::generate();
        let secret = key.to_secret_string();
        assert!(secret.starts_with("ed25519:"));

        let restored = AgentKey::from_secret_string(&secret).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_public_key_string_roundtrip() {
        let key = AgentKey::generate();
        let s = key.public_key().to_string();
        let parsed: PublicKey = s.parse().unwrap();
        assert_eq!(parsed, key.public_key());
    }

    #[test]
    fn test_account_id_is_hex_of_public_key() {
        let key = AgentKey::from_seed(&[7u8; 32]);
        let account_id = key.account_id();
        assert_eq!(account_id.len(), 64);
        assert_eq!(hex_to_bytes(&account_id).unwrap(), key.public_key().as_bytes().to_vec());
    }

    /// Debug出力に秘密鍵が含まれないことを確認
    #[test]
    fn test_debug_does_not_leak_secret() {
        let key = AgentKey::generate();
        let secret = key.to_secret_string();
        let secret_body = secret.trim_start_matches("ed25519:");
        let debug = format!("{key:?}");
        assert!(!debug.contains(secret_body));
        assert!(debug.contains(&key.public_key().to_string()));
    }

    #[test]
    fn test_derivation_path_seed_is_deterministic() {
        let a = seed_from_derivation_path("agent/path").unwrap();
        let b = seed_from_derivation_path("agent/path").unwrap();
        let c = seed_from_derivation_path("agent/other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sign_verify() {
        let key = AgentKey::generate();
        let sig = key.sign(b"shade");
        assert!(key.public_key().verify(b"shade", &sig));
        assert!(!key.public_key().verify(b"other", &sig));
    }

    /// near-cryptoの表現と相互に変換できることを確認
    #[test]
    fn test_near_crypto_conversion() {
        let key = AgentKey::from_seed(&[9u8; 32]);
        let near_secret = key.to_near_secret_key();
        assert_eq!(near_secret.public_key(), key.public_key().to_near());
        assert_eq!(PublicKey::from_near(&near_secret.public_key()).unwrap(), key.public_key());

        let sig = near_secret.sign(b"shade");
        assert!(sig.verify(b"shade", &key.public_key().to_near()));
    }

    #[test]
    fn test_invalid_key_strings() {
        assert_eq!(
            AgentKey::from_secret_string("rsa:abc").unwrap_err(),
            KeyError::UnsupportedKeyType
        );
        assert_eq!(
            AgentKey::from_secret_string("ed25519:0OIl").unwrap_err(),
            KeyError::InvalidEncoding
        );
        assert!(matches!(
            "ed25519:3yZe7d".parse::<PublicKey>().unwrap_err(),
            KeyError::InvalidLength { expected: 32, .. }
        ));
    }
}
