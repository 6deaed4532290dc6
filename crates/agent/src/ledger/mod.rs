//! # レジャー接続
//!
//! NEARへの問い合わせ・トランザクション送信を抽象化するトレイトと、
//! 実行結果のデコード・分類を定義する。
//!
//! 現在の実装:
//! - `near_rpc`: NEAR JSON-RPC
//! - `mock`: テスト用（メモリ内の残高・アクセスキー）
//!
//! 実行結果は [`ExecutionStatus::from_json`] で一度だけデコードし、
//! 成否の判定は [`ExecutionStatus::outcome`] に集約する。

pub mod action;
pub mod near_rpc;
#[cfg(test)]
pub mod mock;

use base64::Engine;
use shade_crypto::{AgentKey, PublicKey};
use shade_types::Network;

pub use action::{Action, FunctionCallAction};

/// 1 Tgas。
pub const TGAS: u64 = 1_000_000_000_000;

/// 戻り値が `false` の呼び出しを失敗として扱う際のバリアント名。
pub const RETURNED_FALSE: &str = "ReturnedFalse";

/// レジャー呼び出しのエラー型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// アカウントが存在しない
    #[error("アカウントが存在しません: {0}")]
    AccountNotFound(String),
    /// RPCへの通信に失敗
    #[error("RPCへの通信に失敗: {0}")]
    Transport(String),
    /// RPCがエラーを返した
    #[error("RPCエラー ({name}): {message}")]
    Rpc {
        /// エラー名（`UNKNOWN_ACCOUNT` など）
        name: String,
        /// エラー詳細
        message: String,
    },
    /// レスポンスの形式が不正
    #[error("RPCレスポンスの形式が不正です: {0}")]
    InvalidResponse(String),
    /// NEARのアカウントIDとして不正
    #[error("アカウントIDが不正です: {0}")]
    InvalidAccountId(String),
}

// ---------------------------------------------------------------------------
// 問い合わせパラメータ
// ---------------------------------------------------------------------------

/// 参照するブロック。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockReference {
    /// 確定済みの最新ブロック
    #[default]
    Final,
    /// 楽観的な最新ブロック
    Optimistic,
    /// ブロック高を指定
    Height(u64),
}

impl BlockReference {
    /// `query` パラメータに追加するフィールド。
    pub(crate) fn apply(&self, params: &mut serde_json::Map<String, serde_json::Value>) {
        match self {
            BlockReference::Final => {
                params.insert("finality".into(), "final".into());
            }
            BlockReference::Optimistic => {
                params.insert("finality".into(), "optimistic".into());
            }
            BlockReference::Height(h) => {
                params.insert("block_id".into(), (*h).into());
            }
        }
    }
}

/// `send_tx` の待機レベル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    /// 待たない
    None,
    /// ブロックに含まれるまで
    Included,
    /// 楽観的に実行されるまで
    #[default]
    ExecutedOptimistic,
    /// 含まれたブロックが確定するまで
    IncludedFinal,
    /// 実行されるまで
    Executed,
    /// 全レシートが確定するまで
    Final,
}

impl WaitUntil {
    /// RPCでの名前。
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitUntil::None => "NONE",
            WaitUntil::Included => "INCLUDED",
            WaitUntil::ExecutedOptimistic => "EXECUTED_OPTIMISTIC",
            WaitUntil::IncludedFinal => "INCLUDED_FINAL",
            WaitUntil::Executed => "EXECUTED",
            WaitUntil::Final => "FINAL",
        }
    }
}

impl std::str::FromStr for WaitUntil {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(WaitUntil::None),
            "INCLUDED" => Ok(WaitUntil::Included),
            "EXECUTED_OPTIMISTIC" => Ok(WaitUntil::ExecutedOptimistic),
            "INCLUDED_FINAL" => Ok(WaitUntil::IncludedFinal),
            "EXECUTED" => Ok(WaitUntil::Executed),
            "FINAL" => Ok(WaitUntil::Final),
            other => Err(format!("不明なwait_until: {other}")),
        }
    }
}

/// `view_account` の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountView {
    /// 残高（yoctoNEAR）
    pub amount: u128,
    /// ステーク中の残高（yoctoNEAR）
    pub locked: u128,
    /// ストレージ使用量（バイト）
    pub storage_usage: u64,
}

// ---------------------------------------------------------------------------
// 実行結果
// ---------------------------------------------------------------------------

/// トランザクションの実行ステータス。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// 成功（戻り値）
    SuccessValue(Vec<u8>),
    /// 成功（後続レシート）
    SuccessReceiptId(String),
    /// 失敗
    Failure {
        /// 最も内側のエラー種別名
        variant: String,
        /// エラー詳細
        message: String,
    },
    /// 実行結果が未確定（`wait_until` が実行前のレベル）
    Pending(String),
}

/// 成否の分類結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 成功（戻り値があれば保持）
    Success(Option<Vec<u8>>),
    /// 失敗
    Failure {
        /// 失敗バリアント名
        variant: String,
        /// エラー詳細
        message: String,
    },
}

impl Outcome {
    /// 成功か。
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

impl ExecutionStatus {
    /// RPCの `status` フィールドをデコードする。
    pub fn from_json(status: &serde_json::Value) -> Result<Self, LedgerError> {
        if let Some(s) = status.as_str() {
            return Ok(ExecutionStatus::Pending(s.to_string()));
        }
        if let Some(value) = status.get("SuccessValue") {
            let encoded = value.as_str().unwrap_or_default();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| LedgerError::InvalidResponse(format!("SuccessValue: {e}")))?;
            return Ok(ExecutionStatus::SuccessValue(bytes));
        }
        if let Some(id) = status.get("SuccessReceiptId") {
            return Ok(ExecutionStatus::SuccessReceiptId(
                id.as_str().unwrap_or_default().to_string(),
            ));
        }
        if let Some(failure) = status.get("Failure") {
            let kind = failure
                .get("ActionError")
                .and_then(|a| a.get("kind"))
                .or_else(|| failure.get("InvalidTxError"))
                .unwrap_or(failure);
            return Ok(ExecutionStatus::Failure {
                variant: first_key(kind).unwrap_or_else(|| "Unknown".into()),
                message: innermost_message(kind),
            });
        }
        Err(LedgerError::InvalidResponse(format!(
            "不明な実行ステータス: {status}"
        )))
    }

    /// 成否を分類する。
    ///
    /// - 戻り値が `false` → 失敗（[`RETURNED_FALSE`]）
    /// - 明示的な失敗 → 失敗
    /// - それ以外 → 成功
    pub fn outcome(&self) -> Outcome {
        match self {
            ExecutionStatus::SuccessValue(v) if v.as_slice() == b"false" => Outcome::Failure {
                variant: RETURNED_FALSE.into(),
                message: "呼び出しがfalseを返しました".into(),
            },
            ExecutionStatus::SuccessValue(v) => Outcome::Success(Some(v.clone())),
            ExecutionStatus::Failure { variant, message } => Outcome::Failure {
                variant: variant.clone(),
                message: message.clone(),
            },
            ExecutionStatus::SuccessReceiptId(_) | ExecutionStatus::Pending(_) => {
                Outcome::Success(None)
            }
        }
    }
}

fn first_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => map.keys().next().cloned(),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn innermost_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) if map.len() == 1 => map
            .values()
            .next()
            .map(innermost_message)
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

/// トランザクションの送信結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    /// トランザクションハッシュ（base58）
    pub transaction_hash: String,
    /// 実行ステータス
    pub status: ExecutionStatus,
    /// 実行ログ
    pub logs: Vec<String>,
}

impl TxOutcome {
    /// `send_tx` の `result` をデコードする。
    pub fn from_rpc_result(
        transaction_hash: String,
        result: &serde_json::Value,
    ) -> Result<Self, LedgerError> {
        let status = match result.get("status") {
            Some(status) => ExecutionStatus::from_json(status)?,
            None => ExecutionStatus::Pending(
                result
                    .get("final_execution_status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("NONE")
                    .to_string(),
            ),
        };

        let mut logs = Vec::new();
        let outcomes = result
            .get("transaction_outcome")
            .into_iter()
            .chain(result.get("receipts_outcome").and_then(|v| v.as_array()).into_iter().flatten());
        for outcome in outcomes {
            if let Some(entries) = outcome["outcome"]["logs"].as_array() {
                logs.extend(entries.iter().filter_map(|l| l.as_str().map(str::to_string)));
            }
        }

        Ok(Self {
            transaction_hash,
            status,
            logs,
        })
    }

    /// 成否を分類する。
    pub fn outcome(&self) -> Outcome {
        self.status.outcome()
    }
}

// ---------------------------------------------------------------------------
// レジャー接続トレイト
// ---------------------------------------------------------------------------

/// レジャー接続のトレイト。
///
/// 外部から注入することもできる（テスト・独自RPC）。
#[async_trait::async_trait]
pub trait LedgerConnection: Send + Sync {
    /// 接続先のネットワーク。
    fn network(&self) -> Network;

    /// アカウントの残高を取得する。存在しない場合は `AccountNotFound`。
    async fn view_account(&self, account_id: &str) -> Result<AccountView, LedgerError>;

    /// アカウントに登録されたEd25519アクセスキーの一覧を取得する。
    async fn access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, LedgerError>;

    /// コントラクトのビュー関数を呼び出し、生の戻り値を返す。
    async fn view_function(
        &self,
        contract_id: &str,
        method: &str,
        args: &serde_json::Value,
        block: &BlockReference,
    ) -> Result<Vec<u8>, LedgerError>;

    /// トランザクションに署名して送信する。
    async fn send_transaction(
        &self,
        signer_id: &str,
        signer: &AgentKey,
        receiver_id: &str,
        actions: Vec<Action>,
        wait_until: WaitUntil,
    ) -> Result<TxOutcome, LedgerError>;
}
