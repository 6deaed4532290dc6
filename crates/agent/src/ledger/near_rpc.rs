//! # NEAR JSON-RPC接続
//!
//! `query`（view_account / view_access_key / view_access_key_list /
//! call_function）と `send_tx` を使ってレジャーにアクセスする。
//!
//! トランザクションは `near-primitives` の型で組み立て、`near-crypto` の
//! 秘密鍵で署名する。JSON-RPCのエンベロープはreqwestで直接送る。
//!
//! ## nonce
//! アクセスキーのnonceはoptimisticブロックで取得し、鍵ごとに最後に使った値を
//! 保持する。次のnonceは `max(ローカル値, チェーン値) + 1`。

use std::collections::HashMap;

use base64::Engine;
use near_primitives::account::AccessKey;
use near_primitives::hash::CryptoHash;
use near_primitives::transaction::{
    Action as NearAction, AddKeyAction, DeleteKeyAction, FunctionCallAction as NearFunctionCall,
    SignedTransaction, Transaction, TransferAction,
};
use near_primitives::types::AccountId;
use shade_crypto::{AgentKey, PublicKey};
use shade_types::Network;
use tokio::sync::Mutex;

use super::{
    AccountView, Action, BlockReference, LedgerConnection, LedgerError, TxOutcome, WaitUntil,
};

/// アカウントが存在しない場合のRPCエラー名。
const UNKNOWN_ACCOUNT: &str = "UNKNOWN_ACCOUNT";

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// NEAR JSON-RPCクライアント。
pub struct NearRpcLedger {
    network: Network,
    rpc_url: String,
    http: reqwest::Client,
    /// 鍵ごとに最後に使ったnonce
    nonces: Mutex<HashMap<PublicKey, u64>>,
}

impl NearRpcLedger {
    /// ネットワークのデフォルトRPCに接続する。
    pub fn new(network: Network) -> Self {
        Self::with_rpc_url(network, network.default_rpc_url().to_string())
    }

    /// RPC URLを指定して接続する。
    pub fn with_rpc_url(network: Network, rpc_url: String) -> Self {
        Self {
            network,
            rpc_url,
            http: reqwest::Client::new(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// RPC URL。
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "shade-agent",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("{method}: {e}")))?;
        let status = response.status();

        let body: serde_json::Value = response.json().await.map_err(|e| {
            LedgerError::Transport(format!("{method}: HTTP {status}のレスポンスをパースできません: {e}"))
        })?;

        if let Some(error) = body.get("error") {
            return Err(rpc_error(error));
        }

        let result = body
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("{method}: resultがありません")))?;

        // 旧形式: query の失敗が result.error に入る
        if let Some(message) = result.get("error").and_then(|v| v.as_str()) {
            return Err(LedgerError::Rpc {
                name: "QUERY_ERROR".into(),
                message: message.to_string(),
            });
        }

        Ok(result)
    }

    async fn query(
        &self,
        request_type: &str,
        block: &BlockReference,
        fields: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        let mut params = serde_json::Map::new();
        params.insert("request_type".into(), request_type.into());
        block.apply(&mut params);
        if let serde_json::Value::Object(extra) = fields {
            params.extend(extra);
        }
        self.rpc("query", serde_json::Value::Object(params)).await
    }

    /// 次に使うnonceを確保する。
    async fn reserve_nonce(&self, key: PublicKey, chain_nonce: u64) -> u64 {
        let mut nonces = self.nonces.lock().await;
        let next = nonces
            .get(&key)
            .map_or(chain_nonce, |&used| used.max(chain_nonce))
            + 1;
        nonces.insert(key, next);
        next
    }
}

fn parse_account_id(account_id: &str) -> Result<AccountId, LedgerError> {
    account_id
        .parse()
        .map_err(|_| LedgerError::InvalidAccountId(account_id.to_string()))
}

fn to_near_action(action: Action) -> NearAction {
    match action {
        Action::FunctionCall(call) => NearAction::FunctionCall(Box::new(NearFunctionCall {
            method_name: call.method_name,
            args: call.args,
            gas: call.gas,
            deposit: call.deposit,
        })),
        Action::Transfer { deposit } => NearAction::Transfer(TransferAction { deposit }),
        Action::AddKey { public_key } => NearAction::AddKey(Box::new(AddKeyAction {
            public_key: public_key.to_near(),
            access_key: AccessKey::full_access(),
        })),
        Action::DeleteKey { public_key } => NearAction::DeleteKey(Box::new(DeleteKeyAction {
            public_key: public_key.to_near(),
        })),
    }
}

fn rpc_error(error: &serde_json::Value) -> LedgerError {
    let name = error["cause"]["name"]
        .as_str()
        .or_else(|| error["name"].as_str())
        .unwrap_or("UNKNOWN")
        .to_string();
    let message = error["data"]
        .as_str()
        .map(str::to_string)
        .or_else(|| error["cause"]["info"].as_object().map(|o| serde_json::Value::Object(o.clone()).to_string()))
        .or_else(|| error["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| error.to_string());
    LedgerError::Rpc { name, message }
}

fn account_not_found(account_id: &str) -> impl Fn(LedgerError) -> LedgerError + '_ {
    move |e| match e {
        LedgerError::Rpc { ref name, .. } if name == UNKNOWN_ACCOUNT => {
            LedgerError::AccountNotFound(account_id.to_string())
        }
        other => other,
    }
}

fn parse_u128(value: &serde_json::Value, field: &str) -> Result<u128, LedgerError> {
    value[field]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LedgerError::InvalidResponse(format!("{field}が不正です")))
}

#[async_trait::async_trait]
impl LedgerConnection for NearRpcLedger {
    fn network(&self) -> Network {
        self.network
    }

    async fn view_account(&self, account_id: &str) -> Result<AccountView, LedgerError> {
        let result = self
            .query(
                "view_account",
                &BlockReference::Final,
                serde_json::json!({ "account_id": account_id }),
            )
            .await
            .map_err(account_not_found(account_id))?;

        Ok(AccountView {
            amount: parse_u128(&result, "amount")?,
            locked: parse_u128(&result, "locked").unwrap_or(0),
            storage_usage: result["storage_usage"].as_u64().unwrap_or(0),
        })
    }

    async fn access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, LedgerError> {
        let result = self
            .query(
                "view_access_key_list",
                &BlockReference::Final,
                serde_json::json!({ "account_id": account_id }),
            )
            .await
            .map_err(account_not_found(account_id))?;

        let entries = result["keys"]
            .as_array()
            .ok_or_else(|| LedgerError::InvalidResponse("keysがありません".into()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(key_str) = entry["public_key"].as_str() else {
                continue;
            };
            match key_str.parse::<PublicKey>() {
                Ok(key) => keys.push(key),
                Err(_) => tracing::debug!(key = key_str, "ed25519以外のアクセスキーを無視します"),
            }
        }
        Ok(keys)
    }

    async fn view_function(
        &self,
        contract_id: &str,
        method: &str,
        args: &serde_json::Value,
        block: &BlockReference,
    ) -> Result<Vec<u8>, LedgerError> {
        let args = serde_json::to_vec(args)
            .map_err(|e| LedgerError::InvalidResponse(format!("引数のシリアライズに失敗: {e}")))?;
        let result = self
            .query(
                "call_function",
                block,
                serde_json::json!({
                    "account_id": contract_id,
                    "method_name": method,
                    "args_base64": b64().encode(args),
                }),
            )
            .await?;

        result["result"]
            .as_array()
            .ok_or_else(|| LedgerError::InvalidResponse("call_functionのresultがありません".into()))?
            .iter()
            .map(|b| {
                b.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| LedgerError::InvalidResponse("resultがバイト列ではありません".into()))
            })
            .collect()
    }

    async fn send_transaction(
        &self,
        signer_id: &str,
        signer: &AgentKey,
        receiver_id: &str,
        actions: Vec<Action>,
        wait_until: WaitUntil,
    ) -> Result<TxOutcome, LedgerError> {
        let public_key = signer.public_key();
        let signer_account = parse_account_id(signer_id)?;
        let receiver_account = parse_account_id(receiver_id)?;

        // finalは直前に追加した鍵や直前のnonceを反映していないことがある
        let access_key = self
            .query(
                "view_access_key",
                &BlockReference::Optimistic,
                serde_json::json!({
                    "account_id": signer_id,
                    "public_key": public_key.to_string(),
                }),
            )
            .await
            .map_err(account_not_found(signer_id))?;

        let chain_nonce = access_key["nonce"]
            .as_u64()
            .ok_or_else(|| LedgerError::InvalidResponse("nonceがありません".into()))?;
        let block_hash: CryptoHash = access_key["block_hash"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| LedgerError::InvalidResponse("block_hashが不正です".into()))?;
        let nonce = self.reserve_nonce(public_key, chain_nonce).await;

        let action_count = actions.len();
        let tx = Transaction {
            signer_id: signer_account,
            public_key: public_key.to_near(),
            nonce,
            receiver_id: receiver_account,
            block_hash,
            actions: actions.into_iter().map(to_near_action).collect(),
        };
        let (hash, _) = tx.get_hash_and_size();
        let signature = signer.to_near_secret_key().sign(hash.as_ref());
        let signed = SignedTransaction::new(signature, tx);
        let bytes = borsh::to_vec(&signed).map_err(|e| {
            LedgerError::InvalidResponse(format!("トランザクションのエンコードに失敗: {e}"))
        })?;
        let tx_hash = signed.get_hash().to_string();

        tracing::debug!(
            signer_id,
            receiver_id,
            nonce,
            tx_hash = %tx_hash,
            actions = action_count,
            "トランザクション送信"
        );

        let result = self
            .rpc(
                "send_tx",
                serde_json::json!({
                    "signed_tx_base64": b64().encode(&bytes),
                    "wait_until": wait_until.as_str(),
                }),
            )
            .await?;

        TxOutcome::from_rpc_result(tx_hash, &result)
    }
}
