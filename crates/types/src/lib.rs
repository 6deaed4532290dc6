//! # Shade Agent 共有型定義
//!
//! TEEから取得したAttestation（生データ）と、レジストリコントラクトへ渡す
//! ContractAttestation（ワイヤ形式）、およびレジストリのビュー結果を定義する。
//!
//! ## エンコーディング規則
//! - Hex（小文字・`0x`なし）: quote、コラテラルの署名/CRL、測定レジスタ、ハッシュ
//! - Base58: NEARの公開鍵・秘密鍵文字列（`ed25519:` プレフィックス付き）
//! - yoctoNEAR: 金額（`u128`、1 NEAR = 10^24）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 測定レジスタ（MRTD, RTMR0〜RTMR3）のバイト長。
pub const MEASUREMENT_LEN: usize = 48;

/// compose_hash / device_id のバイト長。
pub const HASH_LEN: usize = 32;

/// Attestationのreport_dataのバイト長。
pub const REPORT_DATA_LEN: usize = 64;

/// 1 NEAR をyoctoNEARで表した値。
pub const ONE_NEAR: u128 = 1_000_000_000_000_000_000_000_000;

// ---------------------------------------------------------------------------
// ネットワーク
// ---------------------------------------------------------------------------

/// 接続先のNEARネットワーク。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// テストネット
    Testnet,
    /// メインネット
    Mainnet,
}

impl Network {
    /// ネットワーク名（`"testnet"` / `"mainnet"`）を返す。
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    /// デフォルトのJSON-RPCエンドポイント。
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Testnet => "https://rpc.testnet.near.org",
            Network::Mainnet => "https://rpc.mainnet.near.org",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 不明なネットワーク名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNetwork(pub String);

impl fmt::Display for UnknownNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "不明なネットワーク: {} (testnet または mainnet を指定してください)",
            self.0
        )
    }
}

impl std::error::Error for UnknownNetwork {}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testnet" => Ok(Network::Testnet),
            "mainnet" => Ok(Network::Mainnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Attestation（生データ）
// ---------------------------------------------------------------------------

/// TEEとVerification Serviceから取得した生のAttestation。
///
/// バイト列はデコード済みの状態で保持する。コントラクトへ送る際は
/// ContractAttestationへ変換する。リクエストごとに新規構築し、キャッシュしない。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attestation {
    /// ハードウェア署名付きquote
    pub quote: Vec<u8>,
    /// quote検証用のコラテラル
    pub collateral: Collateral,
    /// TCB情報（測定レジスタ等）
    pub tcb_info: TcbInfo,
    /// Verification Serviceが返したchecksum（コントラクトには送らない）
    pub checksum: String,
}

/// quoteの署名チェーン検証に必要な証明書チェーン・署名・失効リスト。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collateral {
    /// PCK CRL発行者の証明書チェーン（PEM）
    pub pck_crl_issuer_chain: String,
    /// ルートCAのCRL（DER）
    pub root_ca_crl: Vec<u8>,
    /// PCK CRL（DER）
    pub pck_crl: Vec<u8>,
    /// TCB Info発行者の証明書チェーン（PEM）
    pub tcb_info_issuer_chain: String,
    /// TCB Info（JSON文字列）
    pub tcb_info: String,
    /// TCB Infoの署名
    pub tcb_info_signature: Vec<u8>,
    /// QE Identity発行者の証明書チェーン（PEM）
    pub qe_identity_issuer_chain: String,
    /// QE Identity（JSON文字列）
    pub qe_identity: String,
    /// QE Identityの署名
    pub qe_identity_signature: Vec<u8>,
    /// PCK証明書チェーン（PEM、存在しない場合は空）
    pub pck_certificate_chain: String,
}

/// TDXの測定レジスタとアプリケーション構成ハッシュ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcbInfo {
    /// MRTD（仮想ファームウェアの測定値）
    pub mrtd: [u8; MEASUREMENT_LEN],
    /// RTMR0（ブートローダ・ファームウェア設定）
    pub rtmr0: [u8; MEASUREMENT_LEN],
    /// RTMR1（カーネル・initrd）
    pub rtmr1: [u8; MEASUREMENT_LEN],
    /// RTMR2（OSアプリケーション）
    pub rtmr2: [u8; MEASUREMENT_LEN],
    /// RTMR3（実行時イベント）
    pub rtmr3: [u8; MEASUREMENT_LEN],
    /// OSイメージハッシュ（シミュレータ等では空）
    pub os_image_hash: Vec<u8>,
    /// app-composeのハッシュ
    pub compose_hash: [u8; HASH_LEN],
    /// デバイスID
    pub device_id: [u8; HASH_LEN],
    /// app-compose本体（JSON文字列）
    pub app_compose: String,
    /// RTMR3に積まれたイベントログ
    pub event_log: Vec<EventLogEntry>,
}

impl Default for TcbInfo {
    fn default() -> Self {
        Self {
            mrtd: [0; MEASUREMENT_LEN],
            rtmr0: [0; MEASUREMENT_LEN],
            rtmr1: [0; MEASUREMENT_LEN],
            rtmr2: [0; MEASUREMENT_LEN],
            rtmr3: [0; MEASUREMENT_LEN],
            os_image_hash: Vec::new(),
            compose_hash: [0; HASH_LEN],
            device_id: [0; HASH_LEN],
            app_compose: String::new(),
            event_log: Vec::new(),
        }
    }
}

/// イベントログの1エントリ。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventLogEntry {
    /// 対象の測定レジスタ番号
    pub imr: u32,
    /// イベント種別
    pub event_type: u32,
    /// ダイジェスト
    pub digest: Vec<u8>,
    /// イベント名
    pub event: String,
    /// イベントペイロード
    pub event_payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// ContractAttestation（コントラクト向けワイヤ形式）
// ---------------------------------------------------------------------------

/// レジストリコントラクトの `register_agent` に渡すAttestation。
///
/// 全てのバイト列は小文字16進文字列（`0x`なし）。検証側はこの形状を
/// バイト単位で期待するため、フィールド名・幅を変更してはならない。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractAttestation {
    /// quote（hex）
    pub quote: String,
    /// コラテラル
    pub collateral: ContractCollateral,
    /// TCB情報
    pub tcb_info: ContractTcbInfo,
}

/// コントラクト向けコラテラル。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractCollateral {
    pub pck_crl_issuer_chain: String,
    /// hex
    pub root_ca_crl: String,
    /// hex
    pub pck_crl: String,
    pub tcb_info_issuer_chain: String,
    pub tcb_info: String,
    /// hex
    pub tcb_info_signature: String,
    pub qe_identity_issuer_chain: String,
    pub qe_identity: String,
    /// hex
    pub qe_identity_signature: String,
    pub pck_certificate_chain: String,
}

/// コントラクト向けTCB情報。測定レジスタは96文字、ハッシュは64文字のhex。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractTcbInfo {
    pub mrtd: String,
    pub rtmr0: String,
    pub rtmr1: String,
    pub rtmr2: String,
    pub rtmr3: String,
    pub os_image_hash: String,
    pub compose_hash: String,
    pub device_id: String,
    pub app_compose: String,
    pub event_log: Vec<ContractEventLog>,
}

/// コントラクト向けイベントログエントリ。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractEventLog {
    pub imr: u32,
    pub event_type: u32,
    /// hex
    pub digest: String,
    pub event: String,
    /// hex
    pub event_payload: String,
}

/// `register_agent` の引数。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentArgs {
    pub attestation: ContractAttestation,
}

// ---------------------------------------------------------------------------
// 外部サービスのレスポンス形状
// ---------------------------------------------------------------------------

/// Verification Serviceのレスポンス。
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationResponse {
    /// quoteに対応するコラテラル（バイト列フィールドはhex）
    pub quote_collateral: WireCollateral,
    /// レスポンスのchecksum
    #[serde(default)]
    pub checksum: String,
}

/// Verification Serviceが返すコラテラル。欠損フィールドは空として扱う。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireCollateral {
    pub pck_crl_issuer_chain: Option<String>,
    pub root_ca_crl: Option<String>,
    pub pck_crl: Option<String>,
    pub tcb_info_issuer_chain: Option<String>,
    pub tcb_info: Option<String>,
    pub tcb_info_signature: Option<String>,
    pub qe_identity_issuer_chain: Option<String>,
    pub qe_identity: Option<String>,
    pub qe_identity_signature: Option<String>,
    pub pck_certificate_chain: Option<String>,
}

/// TEEインターフェースの `/Info` が返すTCB情報（JSON文字列の中身）。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireTcbInfo {
    pub mrtd: Option<String>,
    pub rtmr0: Option<String>,
    pub rtmr1: Option<String>,
    pub rtmr2: Option<String>,
    pub rtmr3: Option<String>,
    pub os_image_hash: Option<String>,
    pub compose_hash: Option<String>,
    pub device_id: Option<String>,
    pub app_compose: Option<String>,
    pub event_log: Vec<WireEventLog>,
}

/// TCB情報内のイベントログエントリ。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireEventLog {
    pub imr: u32,
    pub event_type: u32,
    pub digest: Option<String>,
    pub event: Option<String>,
    pub event_payload: Option<String>,
}

// ---------------------------------------------------------------------------
// レジストリコントラクトのビュー結果
// ---------------------------------------------------------------------------

/// `get_contract_info` の結果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInfo {
    /// TEE経由の登録を要求するか
    pub requires_tee: bool,
    /// Attestationの有効期間（ms、U64文字列）
    #[serde(default)]
    pub attestation_expiration_time_ms: String,
    /// コントラクトのオーナー
    #[serde(default)]
    pub owner_id: String,
    /// MPC署名コントラクト
    #[serde(default)]
    pub mpc_contract_id: String,
}

/// `get_agent` の結果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    pub account_id: String,
    /// 登録時の測定値（hex形式のオブジェクト）
    pub measurements: serde_json::Value,
    pub measurements_are_approved: bool,
    pub ppid: serde_json::Value,
    pub ppid_is_approved: bool,
    /// 有効期限（ms、U64文字列）
    pub valid_until_ms: String,
    pub timestamp_is_valid: bool,
    pub is_valid: bool,
}
