//! # レジャートランザクションエンジン
//!
//! 資金移動・鍵の追加/削除を、有限回の再試行つきで実行する。
//!
//! ## 再試行規則
//! - 操作がエラーを返す、または結果が失敗に分類された場合、残り回数があれば即座に再試行
//! - 上限に達したら [`LedgerTransactionError`] を返す（最後の失敗バリアント名、なければ最後のエラーメッセージ）
//! - 再試行はこのモジュールにのみ存在する

use std::future::Future;

use shade_crypto::{AgentKey, PublicKey};

use crate::ledger::{Action, LedgerConnection, LedgerError, Outcome, TxOutcome, WaitUntil};

/// デフォルトの最大試行回数。
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 再試行後も失敗したレジャー操作。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}が{attempts}回の試行後も失敗しました: {reason}")]
pub struct LedgerTransactionError {
    /// 操作名
    pub operation: &'static str,
    /// 試行回数
    pub attempts: u32,
    /// 最後の失敗バリアント名（結果が失敗に分類された場合）
    pub variant: Option<String>,
    /// 最後の失敗理由（バリアント名、なければエラーメッセージ）
    pub reason: String,
}

/// 操作を最大 `max_attempts` 回実行する。
///
/// `op` は試行ごとに新しいFutureを返す。`max_attempts` が0の場合も1回は実行する。
pub async fn with_retry<F, Fut>(
    operation: &'static str,
    max_attempts: u32,
    mut op: F,
) -> Result<TxOutcome, LedgerTransactionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TxOutcome, LedgerError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_variant = None;
    let mut last_reason = String::new();

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(outcome) => match outcome.outcome() {
                Outcome::Success(_) => {
                    tracing::info!(
                        operation,
                        attempt,
                        tx_hash = %outcome.transaction_hash,
                        "レジャー操作が成功しました"
                    );
                    return Ok(outcome);
                }
                Outcome::Failure { variant, message } => {
                    tracing::warn!(operation, attempt, %variant, %message, "レジャー操作が失敗しました");
                    last_reason = variant.clone();
                    last_variant = Some(variant);
                }
            },
            Err(e) => {
                tracing::warn!(operation, attempt, error = %e, "レジャー操作でエラーが発生しました");
                last_variant = None;
                last_reason = e.to_string();
            }
        }
    }

    Err(LedgerTransactionError {
        operation,
        attempts: max_attempts,
        variant: last_variant,
        reason: last_reason,
    })
}

/// 送金する。
pub async fn fund(
    ledger: &dyn LedgerConnection,
    sender_id: &str,
    sender_key: &AgentKey,
    receiver_id: &str,
    amount: u128,
) -> Result<TxOutcome, LedgerTransactionError> {
    with_retry("fund", DEFAULT_MAX_ATTEMPTS, move || {
        ledger.send_transaction(
            sender_id,
            sender_key,
            receiver_id,
            vec![Action::Transfer { deposit: amount }],
            WaitUntil::default(),
        )
    })
    .await
}

/// フルアクセスキーを追加する（1トランザクション、鍵ごとに1アクション）。
pub async fn add_keys(
    ledger: &dyn LedgerConnection,
    account_id: &str,
    signer: &AgentKey,
    keys: &[PublicKey],
) -> Result<TxOutcome, LedgerTransactionError> {
    let actions: Vec<Action> = keys
        .iter()
        .map(|k| Action::AddKey { public_key: *k })
        .collect();
    with_retry("add_keys", DEFAULT_MAX_ATTEMPTS, move || {
        ledger.send_transaction(
            account_id,
            signer,
            account_id,
            actions.clone(),
            WaitUntil::default(),
        )
    })
    .await
}

/// アクセスキーを削除する（1トランザクション、鍵ごとに1アクション）。
pub async fn remove_keys(
    ledger: &dyn LedgerConnection,
    account_id: &str,
    signer: &AgentKey,
    keys: &[PublicKey],
) -> Result<TxOutcome, LedgerTransactionError> {
    let actions: Vec<Action> = keys
        .iter()
        .map(|k| Action::DeleteKey { public_key: *k })
        .collect();
    with_retry("remove_keys", DEFAULT_MAX_ATTEMPTS, move || {
        ledger.send_transaction(
            account_id,
            signer,
            account_id,
            actions.clone(),
            WaitUntil::default(),
        )
    })
    .await
}
