//! # Attestationパイプライン
//!
//! レジストリに登録するためのAttestationを組み立てる。
//!
//! ## 処理フロー
//! ```text
//! TEEなし / 非TEE鍵 ──────────────────────────→ プレースホルダ
//! TEEあり → report_data構築 → quote取得 → コラテラル取得 → 組み立て
//!                                  │              │
//!                                  └──────────────┴──→ AttestationError
//! ```
//!
//! Attestationは要求ごとに新規に構築し、キャッシュしない。
//! TEEへの到達不能は [`crate::tee::detect`] の段階で「TEEなし」に読み替え済み。
//! ここでの失敗は全て致命的で、再試行しない。

pub mod transform;
pub mod verify_service;


use std::sync::Arc;
use std::time::Duration;

use shade_crypto::DecodeError;
use shade_types::{Attestation, REPORT_DATA_LEN};

use crate::tee::{TeeClient, TeeError};

pub use transform::{fake_attestation, from_contract_attestation, to_contract_attestation};

/// Verification ServiceのデフォルトURL。
pub const DEFAULT_VERIFY_URL: &str = "https://cloud-api.phala.network/api/v1/attestations/verify";

/// コラテラル取得のタイムアウト。
pub const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Attestationパイプラインのエラー型。
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    /// アカウントIDがreport_dataに収まらない
    #[error("アカウントIDがreport_dataに収まりません（{len}バイト > 64バイト）")]
    ReportData {
        /// アカウントIDのバイト長
        len: usize,
    },
    /// quote取得に失敗
    #[error("quoteの取得に失敗: {0}")]
    Quote(#[source] TeeError),
    /// TCB情報の取得に失敗
    #[error("TCB情報の取得に失敗: {0}")]
    TcbInfo(#[source] TeeError),
    /// Verification Serviceへの通信に失敗
    #[error("Verification Serviceへの通信に失敗: {0}")]
    Network(String),
    /// Verification Serviceが非2xxを返した
    #[error("Verification ServiceがHTTP {status}を返しました")]
    Status {
        /// HTTPステータスコード
        status: u16,
    },
    /// Verification Serviceがタイムアウトした
    #[error("Verification Serviceが{0:?}以内に応答しませんでした")]
    Timeout(Duration),
    /// レスポンスの形式が不正
    #[error("レスポンスの形式が不正です: {0}")]
    MalformedResponse(String),
    /// hexデコード失敗
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// アカウントIDを64バイトのreport_dataに埋め込む。
///
/// 64文字のhex（implicit account）はデコードした32バイト、それ以外は
/// UTF-8バイト列を先頭に置き、残りはゼロで埋める。
pub fn build_report_data(account_id: &str) -> Result<[u8; REPORT_DATA_LEN], AttestationError> {
    let is_implicit = account_id.len() == 64 && account_id.bytes().all(|b| b.is_ascii_hexdigit());
    let raw = if is_implicit {
        shade_crypto::hex_to_bytes(account_id)?
    } else {
        account_id.as_bytes().to_vec()
    };
    if raw.len() > REPORT_DATA_LEN {
        return Err(AttestationError::ReportData { len: raw.len() });
    }
    let mut report_data = [0u8; REPORT_DATA_LEN];
    report_data[..raw.len()].copy_from_slice(&raw);
    Ok(report_data)
}

/// Attestationパイプライン。
///
/// TEEクライアント（検出済み）とVerification Serviceの接続情報を保持する。
pub struct AttestationPipeline {
    tee: Option<Arc<dyn TeeClient>>,
    http: reqwest::Client,
    verify_url: String,
    timeout: Duration,
}

impl AttestationPipeline {
    /// パイプラインを構築する。`tee` は検出で到達を確認できたもののみ渡す。
    pub fn new(tee: Option<Arc<dyn TeeClient>>, verify_url: String, timeout: Duration) -> Self {
        Self {
            tee,
            http: reqwest::Client::new(),
            verify_url,
            timeout,
        }
    }

    /// TEE内で動作しているか。
    pub fn in_tee(&self) -> bool {
        self.tee.is_some()
    }

    /// `account_id` に紐づくAttestationを構築する。
    ///
    /// TEEがない場合、または鍵がTEE由来でない場合はプレースホルダを返す。
    pub async fn build(
        &self,
        account_id: &str,
        keys_derived_with_tee: bool,
    ) -> Result<Attestation, AttestationError> {
        let tee = match &self.tee {
            Some(tee) if keys_derived_with_tee => tee,
            _ => {
                tracing::debug!("TEE外のためプレースホルダAttestationを使用します");
                return Ok(fake_attestation());
            }
        };

        // 1. report_data
        let report_data = build_report_data(account_id)?;

        // 2. quote
        let quote_resp = tee
            .get_quote(&report_data)
            .await
            .map_err(AttestationError::Quote)?;
        let quote = shade_crypto::hex_to_bytes(&quote_resp.quote)?;
        tracing::debug!(quote_len = quote.len(), "quote取得完了");

        // 3. コラテラル
        let verification = verify_service::request_collateral(
            &self.http,
            &self.verify_url,
            &shade_crypto::bytes_to_hex(&quote),
            self.timeout,
        )
        .await?;
        let collateral = transform::collateral_from_wire(&verification.quote_collateral)?;

        // 4. TCB情報
        let info = tee.info().await.map_err(AttestationError::TcbInfo)?;
        let wire_tcb: shade_types::WireTcbInfo = serde_json::from_str(&info.tcb_info)
            .map_err(|e| AttestationError::MalformedResponse(format!("tcb_info: {e}")))?;
        let tcb_info = transform::tcb_info_from_wire(&wire_tcb)?;

        tracing::info!(account_id, "Attestationを構築しました");

        Ok(Attestation {
            quote,
            collateral,
            tcb_info,
            checksum: verification.checksum,
        })
    }
}
