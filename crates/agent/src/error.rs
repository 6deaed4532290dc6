//! # エージェントエラー型
//!
//! ファサード（`ShadeAgent`）が返す共通のエラー型。
//! 各コンポーネントのエラー（TEE、Attestation、レジャー、鍵）をまとめる。
//!
//! どのバリアントのメッセージにも秘密鍵を含めてはならない。

use shade_crypto::{DecodeError, KeyError};

use crate::attestation::AttestationError;
use crate::ledger::LedgerError;
use crate::tee::TeeError;
use crate::transaction::LedgerTransactionError;

/// エージェントエラー型。
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// 設定値が不正（ネットワーク、数値範囲、スポンサー）
    #[error("設定が不正です: {0}")]
    ConfigValidation(String),
    /// 操作に必要な設定がない（レジストリ、レジャー、スポンサー）
    #[error("{0}が設定されていません")]
    NotConfigured(&'static str),
    /// TEE・Verification Serviceの失敗
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    /// 再試行後も失敗したレジャー操作
    #[error(transparent)]
    LedgerTransaction(#[from] LedgerTransactionError),
    /// 再試行対象外のレジャー呼び出し（ビュー、コントラクト呼び出し）
    #[error("レジャー呼び出しに失敗: {0}")]
    Ledger(#[from] LedgerError),
    /// TEEインターフェースの呼び出し失敗（検出後の鍵導出など）
    #[error(transparent)]
    Tee(#[from] TeeError),
    /// hexデコード失敗
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// 鍵文字列・鍵導出の失敗
    #[error(transparent)]
    Key(#[from] KeyError),
    /// 鍵プールが空
    #[error("署名に使用できる鍵がありません")]
    NoKeysAvailable,
    /// リスク確認なしの秘密鍵取り出し
    #[error("秘密鍵の取り出しには acknowledge_risk = true の指定が必要です")]
    RiskAcknowledgement,
    /// TEE由来の鍵プールに非TEE由来の鍵が混ざる
    #[error("鍵の来歴が混在します: {0}")]
    KeyProvenance(String),
    /// JSONのシリアライズ・デシリアライズ失敗
    #[error("JSON処理に失敗: {0}")]
    Json(#[from] serde_json::Error),
}
