//! # エージェント設定
//!
//! `ShadeConfig` はコードで組み立てるか、[`ShadeConfig::from_env`] で環境変数から読む。
//! 検証は [`ShadeConfig::validate`] で一度だけ行い、以降は変更しない。
//!
//! ## 環境変数
//! | 変数 | 内容 |
//! |------|------|
//! | `NEAR_NETWORK` | `testnet` / `mainnet` |
//! | `NEAR_RPC_URL` | RPCエンドポイント（省略時はネットワークのデフォルト） |
//! | `AGENT_CONTRACT_ID` | レジストリコントラクト |
//! | `SPONSOR_ACCOUNT_ID` / `SPONSOR_PRIVATE_KEY` | 資金提供アカウント |
//! | `FUNDING_AMOUNT` | 資金提供額（NEAR、0.1〜10） |
//! | `NUM_KEYS` | 鍵プールの鍵数（1〜100） |
//! | `DERIVATION_PATH` | 鍵の導出パス |
//! | `ATTESTATION_VERIFY_URL` | Verification ServiceのURL |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shade_crypto::AgentKey;
use shade_types::{Network, ONE_NEAR};

use crate::attestation::{DEFAULT_VERIFY_URL, VERIFICATION_TIMEOUT};
use crate::error::AgentError;
use crate::ledger::near_rpc::NearRpcLedger;
use crate::ledger::LedgerConnection;

/// デフォルトの資金提供額（NEAR）。
pub const DEFAULT_FUNDING_AMOUNT: f64 = 0.3;

/// 資金提供額の下限（NEAR）。
pub const MIN_FUNDING_AMOUNT: f64 = 0.1;

/// 資金提供額の上限（NEAR）。
pub const MAX_FUNDING_AMOUNT: f64 = 10.0;

/// 鍵数の上限。
pub const MAX_NUM_KEYS: usize = 100;

/// 資金提供アカウント。
#[derive(Clone)]
pub struct SponsorConfig {
    /// アカウントID
    pub account_id: String,
    /// 秘密鍵（`ed25519:<base58>`）
    pub private_key: String,
}

impl fmt::Debug for SponsorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SponsorConfig")
            .field("account_id", &self.account_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl SponsorConfig {
    /// 秘密鍵をパースする。エラーには鍵文字列を含めない。
    pub fn signing_key(&self) -> Result<AgentKey, AgentError> {
        AgentKey::from_secret_string(&self.private_key).map_err(|e| {
            AgentError::ConfigValidation(format!("スポンサーの秘密鍵が不正です（{e}）"))
        })
    }
}

/// エージェント設定。
#[derive(Clone)]
pub struct ShadeConfig {
    /// 接続先ネットワーク
    pub network: Option<Network>,
    /// RPCエンドポイント（省略時はネットワークのデフォルト）
    pub rpc_url: Option<String>,
    /// レジストリコントラクト
    pub registry_contract_id: Option<String>,
    /// 資金提供アカウント
    pub sponsor: Option<SponsorConfig>,
    /// 資金提供額（NEAR）
    pub funding_amount: f64,
    /// 鍵プールの鍵数（ID鍵を含む）
    pub num_keys: usize,
    /// 鍵の導出パス
    pub derivation_path: Option<String>,
    /// 外部から注入するレジャー接続
    pub ledger: Option<Arc<dyn LedgerConnection>>,
    /// Verification ServiceのURL
    pub attestation_verify_url: String,
    /// コラテラル取得のタイムアウト
    pub attestation_timeout: Duration,
}

impl Default for ShadeConfig {
    fn default() -> Self {
        Self {
            network: None,
            rpc_url: None,
            registry_contract_id: None,
            sponsor: None,
            funding_amount: DEFAULT_FUNDING_AMOUNT,
            num_keys: 1,
            derivation_path: None,
            ledger: None,
            attestation_verify_url: DEFAULT_VERIFY_URL.to_string(),
            attestation_timeout: VERIFICATION_TIMEOUT,
        }
    }
}

impl fmt::Debug for ShadeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadeConfig")
            .field("network", &self.network)
            .field("rpc_url", &self.rpc_url)
            .field("registry_contract_id", &self.registry_contract_id)
            .field("sponsor", &self.sponsor)
            .field("funding_amount", &self.funding_amount)
            .field("num_keys", &self.num_keys)
            .field("derivation_path", &self.derivation_path)
            .field("ledger", &self.ledger.as_ref().map(|l| l.network()))
            .field("attestation_verify_url", &self.attestation_verify_url)
            .field("attestation_timeout", &self.attestation_timeout)
            .finish()
    }
}

impl ShadeConfig {
    /// ネットワークを指定した設定。
    pub fn new(network: Network) -> Self {
        Self {
            network: Some(network),
            ..Self::default()
        }
    }

    /// RPC URLを上書きする（ネットワークの指定が必要）。
    pub fn with_rpc_url(mut self, rpc_url: impl Into<String>) -> Self {
        self.rpc_url = Some(rpc_url.into());
        self
    }

    /// レジストリコントラクトを設定する。
    pub fn with_registry(mut self, contract_id: impl Into<String>) -> Self {
        self.registry_contract_id = Some(contract_id.into());
        self
    }

    /// 資金提供元のアカウントと秘密鍵（`ed25519:...`）を設定する。
    ///
    /// 作成時に `funding_amount` NEARがエージェントへ送られる。
    pub fn with_sponsor(
        mut self,
        account_id: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        self.sponsor = Some(SponsorConfig {
            account_id: account_id.into(),
            private_key: private_key.into(),
        });
        self
    }

    /// 資金提供額（NEAR単位）。
    pub fn with_funding_amount(mut self, amount: f64) -> Self {
        self.funding_amount = amount;
        self
    }

    /// 鍵プールの鍵数（1〜[`MAX_NUM_KEYS`]）。
    pub fn with_num_keys(mut self, num_keys: usize) -> Self {
        self.num_keys = num_keys;
        self
    }

    /// 鍵の導出パス。
    ///
    /// TEE内ではTEEの鍵素材のパス、TEE外では決定論的なシードの元になる。
    pub fn with_derivation_path(mut self, path: impl Into<String>) -> Self {
        self.derivation_path = Some(path.into());
        self
    }

    /// レジャー接続を注入する。指定時は `rpc_url` より優先する。
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerConnection>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Attestation検証サービスのURL。
    pub fn with_attestation_verify_url(mut self, url: impl Into<String>) -> Self {
        self.attestation_verify_url = url.into();
        self
    }

    /// Attestation検証サービスへのリクエストのタイムアウト。
    pub fn with_attestation_timeout(mut self, timeout: Duration) -> Self {
        self.attestation_timeout = timeout;
        self
    }

    /// 環境変数から設定を読む。
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 任意の取得関数から設定を読む。空文字列は未設定として扱う。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("NEAR_NETWORK") {
            config.network = Some(
                v.parse()
                    .map_err(|e: shade_types::UnknownNetwork| AgentError::ConfigValidation(e.to_string()))?,
            );
        }
        config.rpc_url = get("NEAR_RPC_URL");
        config.registry_contract_id = get("AGENT_CONTRACT_ID");
        match (get("SPONSOR_ACCOUNT_ID"), get("SPONSOR_PRIVATE_KEY")) {
            (Some(account_id), Some(private_key)) => {
                config.sponsor = Some(SponsorConfig {
                    account_id,
                    private_key,
                });
            }
            (None, None) => {}
            _ => {
                return Err(AgentError::ConfigValidation(
                    "SPONSOR_ACCOUNT_ID と SPONSOR_PRIVATE_KEY は両方指定してください".into(),
                ))
            }
        }
        if let Some(v) = get("FUNDING_AMOUNT") {
            config.funding_amount = v.trim().parse().map_err(|_| {
                AgentError::ConfigValidation(format!("FUNDING_AMOUNT が数値ではありません: {v}"))
            })?;
        }
        if let Some(v) = get("NUM_KEYS") {
            config.num_keys = v.trim().parse().map_err(|_| {
                AgentError::ConfigValidation(format!("NUM_KEYS が整数ではありません: {v}"))
            })?;
        }
        config.derivation_path = get("DERIVATION_PATH");
        if let Some(v) = get("ATTESTATION_VERIFY_URL") {
            config.attestation_verify_url = v;
        }
        Ok(config)
    }

    /// 設定値を検証する。
    pub fn validate(&self) -> Result<(), AgentError> {
        if !(1..=MAX_NUM_KEYS).contains(&self.num_keys) {
            return Err(AgentError::ConfigValidation(format!(
                "num_keys は1〜{MAX_NUM_KEYS}の範囲で指定してください（{}）",
                self.num_keys
            )));
        }
        if !self.funding_amount.is_finite()
            || !(MIN_FUNDING_AMOUNT..=MAX_FUNDING_AMOUNT).contains(&self.funding_amount)
        {
            return Err(AgentError::ConfigValidation(format!(
                "funding_amount は{MIN_FUNDING_AMOUNT}〜{MAX_FUNDING_AMOUNT} NEARの範囲で指定してください（{}）",
                self.funding_amount
            )));
        }
        if let (Some(network), Some(ledger)) = (self.network, &self.ledger) {
            if ledger.network() != network {
                return Err(AgentError::ConfigValidation(format!(
                    "レジャー接続のネットワーク（{}）が設定（{network}）と一致しません",
                    ledger.network()
                )));
            }
        }
        if let Some(sponsor) = &self.sponsor {
            if sponsor.account_id.trim().is_empty() {
                return Err(AgentError::ConfigValidation(
                    "スポンサーのアカウントIDが空です".into(),
                ));
            }
            sponsor.signing_key()?;
            if self.network.is_none() && self.ledger.is_none() {
                return Err(AgentError::ConfigValidation(
                    "スポンサーを指定する場合はネットワークまたはレジャー接続が必要です".into(),
                ));
            }
        }
        if self.rpc_url.is_some() && self.network.is_none() {
            return Err(AgentError::ConfigValidation(
                "rpc_url を指定する場合はネットワークも指定してください".into(),
            ));
        }
        Ok(())
    }

    /// レジャー接続を決定する（注入されたもの、なければネットワークのRPC）。
    pub fn resolve_ledger(&self) -> Option<Arc<dyn LedgerConnection>> {
        if let Some(ledger) = &self.ledger {
            return Some(ledger.clone());
        }
        let network = self.network?;
        let ledger = match &self.rpc_url {
            Some(url) => NearRpcLedger::with_rpc_url(network, url.clone()),
            None => NearRpcLedger::new(network),
        };
        Some(Arc::new(ledger))
    }

    /// 資金提供額（yoctoNEAR）。
    pub fn funding_amount_yocto(&self) -> u128 {
        near_to_yocto(self.funding_amount)
    }
}

/// NEAR（小数第6位まで）をyoctoNEARに変換する。
pub fn near_to_yocto(amount: f64) -> u128 {
    let micro = (amount * 1_000_000.0).round();
    if micro <= 0.0 {
        return 0;
    }
    micro as u128 * (ONE_NEAR / 1_000_000)
}
