//! # エージェントクライアント
//!
//! 設定検証・ID生成・資金提供と、レジストリに対する操作
//! （登録、呼び出し、ビュー、Attestation、許可リスト確認、鍵の取り出し）をまとめる。
//!
//! ## 処理フロー
//! ```text
//! create   → 設定検証 → TEE検出 → ID鍵生成 → [資金提供]
//! call     → 鍵プールのロック → 鍵の突き合わせ（初回のみ） → 署名鍵選択 → 送信
//! register → Attestation構築 → register_agent 呼び出し
//! ```
//!
//! `call` は鍵プールの非同期Mutexを送信完了まで保持するため、同一インスタンスへの
//! 呼び出しは直列化される。

use std::sync::Arc;

use shade_crypto::PublicKey;
use shade_types::{AgentView, ContractAttestation, ContractInfo, Network, RegisterAgentArgs, ONE_NEAR};
use tokio::sync::Mutex;

use crate::attestation::{to_contract_attestation, AttestationPipeline};
use crate::config::ShadeConfig;
use crate::error::AgentError;
use crate::keys::{self, KeyPool, KeySetup};
use crate::ledger::{
    Action, BlockReference, LedgerConnection, LedgerError, Outcome, TxOutcome, WaitUntil, TGAS,
};
use crate::tee::dstack::DstackClient;
use crate::tee::{self, TeeClient};
use crate::transaction;

/// `register_agent` に添付するデポジット（0.005 NEAR）。
pub const REGISTER_DEPOSIT: u128 = ONE_NEAR / 200;

/// `register_agent` のガス上限。
pub const REGISTER_GAS: u64 = 30 * TGAS;

/// `call` のデフォルトガス上限。
pub const DEFAULT_CALL_GAS: u64 = 30 * TGAS;

/// `call` のオプション。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// 添付するデポジット（yoctoNEAR）
    pub deposit: u128,
    /// ガス上限
    pub gas: u64,
    /// 待機レベル
    pub wait_until: WaitUntil,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            deposit: 0,
            gas: DEFAULT_CALL_GAS,
            wait_until: WaitUntil::default(),
        }
    }
}

/// Shadeエージェント。
pub struct ShadeAgent {
    config: ShadeConfig,
    account_id: String,
    ledger: Option<Arc<dyn LedgerConnection>>,
    tee: Option<Arc<dyn TeeClient>>,
    attestation: AttestationPipeline,
    pool: Mutex<KeyPool>,
}

impl std::fmt::Debug for ShadeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadeAgent")
            .field("account_id", &self.account_id)
            .field("in_tee", &self.tee.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ShadeAgent {
    /// エージェントを作成する。
    ///
    /// dstackゲストエージェントを検出し、到達できなければTEE外として動作する。
    pub async fn create(config: ShadeConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let tee = tee::detect(Arc::new(DstackClient::from_env())).await;
        Self::build(config, tee).await
    }

    /// TEEクライアントを指定してエージェントを作成する。
    ///
    /// `tee` は検出済み（到達可能）のもののみ渡す。
    pub async fn create_with_tee(
        config: ShadeConfig,
        tee: Option<Arc<dyn TeeClient>>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        Self::build(config, tee).await
    }

    /// 検証済みの設定からエージェントを組み立てる。
    async fn build(
        config: ShadeConfig,
        tee: Option<Arc<dyn TeeClient>>,
    ) -> Result<Self, AgentError> {
        let ledger = config.resolve_ledger();
        let identity =
            keys::generate_identity(tee.as_deref(), config.derivation_path.as_deref()).await?;
        let account_id = identity.account_id.clone();

        let attestation = AttestationPipeline::new(
            tee.clone(),
            config.attestation_verify_url.clone(),
            config.attestation_timeout,
        );

        let agent = Self {
            account_id,
            ledger,
            tee,
            attestation,
            pool: Mutex::new(KeyPool::new(identity)),
            config,
        };

        tracing::info!(
            account_id = %agent.account_id,
            in_tee = agent.tee.is_some(),
            network = ?agent.network(),
            "エージェントを作成しました"
        );

        if agent.config.sponsor.is_some() {
            agent.fund(agent.config.funding_amount_yocto()).await?;
        }

        Ok(agent)
    }

    // -----------------------------------------------------------------------
    // アクセサ
    // -----------------------------------------------------------------------

    /// エージェントのアカウントID（作成時に確定）。
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// 接続先ネットワーク。
    pub fn network(&self) -> Option<Network> {
        self.ledger.as_ref().map(|l| l.network()).or(self.config.network)
    }

    /// TEE内で動作しているか。
    pub fn in_tee(&self) -> bool {
        self.tee.is_some()
    }

    /// 設定。
    pub fn config(&self) -> &ShadeConfig {
        &self.config
    }

    /// 鍵プールが全てTEE由来か。
    pub async fn keys_derived_with_tee(&self) -> bool {
        self.pool.lock().await.derived_with_tee
    }

    /// 鍵プールの鍵数。
    pub async fn key_count(&self) -> usize {
        self.pool.lock().await.keys.len()
    }

    /// 鍵プールの公開鍵（プール順）。
    pub async fn public_keys(&self) -> Vec<PublicKey> {
        self.pool.lock().await.public_keys()
    }

    fn ledger(&self) -> Result<&Arc<dyn LedgerConnection>, AgentError> {
        self.ledger.as_ref().ok_or(AgentError::NotConfigured("レジャー接続"))
    }

    fn registry(&self) -> Result<&str, AgentError> {
        self.config
            .registry_contract_id
            .as_deref()
            .ok_or(AgentError::NotConfigured("レジストリコントラクト"))
    }

    // -----------------------------------------------------------------------
    // レジャー操作
    // -----------------------------------------------------------------------

    /// エージェントの残高（yoctoNEAR）。アカウントが存在しなければ0。
    pub async fn balance(&self) -> Result<u128, AgentError> {
        match self.ledger()?.view_account(&self.account_id).await {
            Ok(view) => Ok(view.amount),
            Err(LedgerError::AccountNotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// スポンサーからエージェントに `amount`（yoctoNEAR）を送る。
    pub async fn fund(&self, amount: u128) -> Result<TxOutcome, AgentError> {
        let sponsor = self
            .config
            .sponsor
            .as_ref()
            .ok_or(AgentError::NotConfigured("スポンサー"))?;
        let ledger = self.ledger()?;
        let sponsor_key = sponsor.signing_key()?;

        tracing::info!(
            sponsor = %sponsor.account_id,
            account_id = %self.account_id,
            amount = %amount,
            "エージェントに資金を提供します"
        );

        let outcome = transaction::fund(
            ledger.as_ref(),
            &sponsor.account_id,
            &sponsor_key,
            &self.account_id,
            amount,
        )
        .await?;
        Ok(outcome)
    }

    /// 鍵プールをレジャーと突き合わせる（初回のみ実行）。
    pub async fn ensure_keys_setup(&self) -> Result<KeySetup, AgentError> {
        let ledger = self.ledger()?;
        let mut pool = self.pool.lock().await;
        keys::ensure_keys_setup(
            &mut pool,
            ledger.as_ref(),
            self.tee.as_deref(),
            &self.account_id,
            self.config.num_keys,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // レジストリ操作
    // -----------------------------------------------------------------------

    /// Attestationを構築する（コントラクト形式）。
    pub async fn get_attestation(&self) -> Result<ContractAttestation, AgentError> {
        let derived_with_tee = self.keys_derived_with_tee().await;
        let attestation = self
            .attestation
            .build(&self.account_id, derived_with_tee)
            .await?;
        Ok(to_contract_attestation(&attestation))
    }

    /// レジストリに登録する。
    ///
    /// ID鍵で `register_agent` を呼び出し、成功に分類されれば `true`。
    pub async fn register(&self) -> Result<bool, AgentError> {
        let registry = self.registry()?;
        let ledger = self.ledger()?;

        let attestation = self.get_attestation().await?;
        let args = serde_json::to_value(RegisterAgentArgs { attestation })?;
        let action = Action::function_call("register_agent", &args, REGISTER_GAS, REGISTER_DEPOSIT)?;

        let identity = self.pool.lock().await.identity()?.clone();
        let outcome = ledger
            .send_transaction(
                &self.account_id,
                &identity,
                registry,
                vec![action],
                WaitUntil::default(),
            )
            .await?;

        match outcome.outcome() {
            Outcome::Success(_) => {
                tracing::info!(
                    account_id = %self.account_id,
                    registry,
                    tx_hash = %outcome.transaction_hash,
                    "レジストリに登録しました"
                );
                Ok(true)
            }
            Outcome::Failure { variant, message } => {
                tracing::warn!(
                    account_id = %self.account_id,
                    registry,
                    %variant,
                    %message,
                    "レジストリへの登録に失敗しました"
                );
                Ok(false)
            }
        }
    }

    /// レジストリのビュー関数を呼び出す（finalブロック）。
    pub async fn view(
        &self,
        method: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        self.view_at(method, args, &BlockReference::default()).await
    }

    /// ブロックを指定してレジストリのビュー関数を呼び出す。
    pub async fn view_at(
        &self,
        method: &str,
        args: &serde_json::Value,
        block: &BlockReference,
    ) -> Result<serde_json::Value, AgentError> {
        let registry = self.registry()?;
        let ledger = self.ledger()?;
        let raw = ledger.view_function(registry, method, args, block).await?;
        if raw.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    /// レジストリの関数を呼び出す。
    ///
    /// 初回は鍵プールをレジャーと突き合わせ、以降はラウンドロビンで署名鍵を選ぶ。
    /// 結果は分類せずにそのまま返す。
    pub async fn call(
        &self,
        method: &str,
        args: &serde_json::Value,
        options: CallOptions,
    ) -> Result<TxOutcome, AgentError> {
        let registry = self.registry()?;
        let ledger = self.ledger()?;
        let action = Action::function_call(method, args, options.gas, options.deposit)?;

        let mut pool = self.pool.lock().await;
        keys::ensure_keys_setup(
            &mut pool,
            ledger.as_ref(),
            self.tee.as_deref(),
            &self.account_id,
            self.config.num_keys,
        )
        .await?;

        let selected = keys::select_signer(&pool.keys, pool.current_index)?;
        let signer = selected.key.clone();
        let next_index = selected.next_index;
        pool.current_index = next_index;

        tracing::debug!(
            method,
            key_index = next_index,
            public_key = %signer.public_key(),
            "コントラクトを呼び出します"
        );

        let outcome = ledger
            .send_transaction(
                &self.account_id,
                &signer,
                registry,
                vec![action],
                options.wait_until,
            )
            .await?;
        Ok(outcome)
    }

    /// レジストリに登録されたエージェント情報。
    pub async fn get_agent(&self) -> Result<Option<AgentView>, AgentError> {
        let value = self
            .view("get_agent", &serde_json::json!({ "account_id": self.account_id }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// ローカル用の許可リストに含まれるか。
    ///
    /// コントラクトがTEEを要求する場合は許可リストを使わないため `None`。
    pub async fn is_whitelisted(&self) -> Result<Option<bool>, AgentError> {
        let info: ContractInfo =
            serde_json::from_value(self.view("get_contract_info", &serde_json::json!({})).await?)?;
        if info.requires_tee {
            return Ok(None);
        }
        let agents: Vec<String> = serde_json::from_value(
            self.view("get_whitelisted_agents_for_local", &serde_json::json!({}))
                .await?,
        )?;
        Ok(Some(agents.iter().any(|a| a == &self.account_id)))
    }

    /// 鍵プールの秘密鍵を取り出す。
    ///
    /// `acknowledge_risk` が `false` の場合は失敗する。
    pub async fn get_private_keys(&self, acknowledge_risk: bool) -> Result<Vec<String>, AgentError> {
        if !acknowledge_risk {
            return Err(AgentError::RiskAcknowledgement);
        }
        let pool = self.pool.lock().await;
        tracing::warn!(
            account_id = %self.account_id,
            count = pool.keys.len(),
            "秘密鍵が取り出されました。安全に保管してください"
        );
        Ok(pool.keys.iter().map(|k| k.to_secret_string()).collect())
    }
}
