//! # テスト用モックレジャー
//!
//! 残高とアクセスキーをメモリ内に保持し、成功したトランザクションの
//! アクションを適用する。送信結果は事前に積んだスクリプトで差し替えられる。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use shade_crypto::{AgentKey, PublicKey};
use shade_types::Network;

use super::{
    AccountView, Action, BlockReference, ExecutionStatus, LedgerConnection, LedgerError, TxOutcome,
    WaitUntil,
};

/// 送信されたトランザクションの記録。
#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub signer_id: String,
    pub signer: PublicKey,
    pub receiver_id: String,
    pub actions: Vec<Action>,
    pub wait_until: WaitUntil,
}

#[derive(Default)]
struct State {
    balances: HashMap<String, u128>,
    keys: HashMap<String, Vec<PublicKey>>,
    sent: Vec<SentTransaction>,
    scripted: VecDeque<Result<ExecutionStatus, LedgerError>>,
    views: HashMap<String, Vec<u8>>,
    access_key_queries: usize,
}

/// モックレジャー。
pub struct MockLedger {
    network: Network,
    state: Mutex<State>,
}

impl MockLedger {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(State::default()),
        }
    }

    /// アカウントを作成する。
    pub fn add_account(&self, account_id: &str, balance: u128, keys: Vec<PublicKey>) {
        let mut state = self.state.lock().unwrap();
        state.balances.insert(account_id.to_string(), balance);
        state.keys.insert(account_id.to_string(), keys);
    }

    /// 次の送信結果を積む。積まれていなければ `SuccessValue("")`。
    pub fn push_result(&self, result: Result<ExecutionStatus, LedgerError>) {
        self.state.lock().unwrap().scripted.push_back(result);
    }

    /// ビュー関数の戻り値を設定する（JSON）。
    pub fn set_view(&self, method: &str, value: serde_json::Value) {
        let bytes = serde_json::to_vec(&value).unwrap();
        self.state.lock().unwrap().views.insert(method.to_string(), bytes);
    }

    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn keys_of(&self, account_id: &str) -> Vec<PublicKey> {
        self.state
            .lock()
            .unwrap()
            .keys
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn balance_of(&self, account_id: &str) -> Option<u128> {
        self.state.lock().unwrap().balances.get(account_id).copied()
    }

    /// `access_keys` が呼ばれた回数。
    pub fn access_key_queries(&self) -> usize {
        self.state.lock().unwrap().access_key_queries
    }
}

fn apply(state: &mut State, tx: &SentTransaction) {
    for action in &tx.actions {
        match action {
            Action::Transfer { deposit } => {
                *state.balances.entry(tx.receiver_id.clone()).or_default() += deposit;
                // implicit accountは初回送金で作成され、アカウントIDの公開鍵が登録される
                let keys = state.keys.entry(tx.receiver_id.clone()).or_default();
                if keys.is_empty() {
                    if let Ok(bytes) = shade_crypto::hex_to_bytes(&tx.receiver_id) {
                        if let Ok(arr) = <[u8; 32]>::try_from(bytes) {
                            keys.push(PublicKey::from_bytes(arr));
                        }
                    }
                }
            }
            Action::AddKey { public_key } => {
                let keys = state.keys.entry(tx.receiver_id.clone()).or_default();
                if !keys.contains(public_key) {
                    keys.push(*public_key);
                }
            }
            Action::DeleteKey { public_key } => {
                if let Some(keys) = state.keys.get_mut(&tx.receiver_id) {
                    keys.retain(|k| k != public_key);
                }
            }
            Action::FunctionCall(_) => {}
        }
    }
}

#[async_trait::async_trait]
impl LedgerConnection for MockLedger {
    fn network(&self) -> Network {
        self.network
    }

    async fn view_account(&self, account_id: &str) -> Result<AccountView, LedgerError> {
        let state = self.state.lock().unwrap();
        let amount = state
            .balances
            .get(account_id)
            .copied()
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(AccountView {
            amount,
            locked: 0,
            storage_usage: 182,
        })
    }

    async fn access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.access_key_queries += 1;
        state
            .keys
            .get(account_id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    async fn view_function(
        &self,
        _contract_id: &str,
        method: &str,
        _args: &serde_json::Value,
        _block: &BlockReference,
    ) -> Result<Vec<u8>, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .views
            .get(method)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc {
                name: "MethodNotFound".into(),
                message: method.to_string(),
            })
    }

    async fn send_transaction(
        &self,
        signer_id: &str,
        signer: &AgentKey,
        receiver_id: &str,
        actions: Vec<Action>,
        wait_until: WaitUntil,
    ) -> Result<TxOutcome, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let tx = SentTransaction {
            signer_id: signer_id.to_string(),
            signer: signer.public_key(),
            receiver_id: receiver_id.to_string(),
            actions,
            wait_until,
        };
        state.sent.push(tx.clone());
        let index = state.sent.len();

        let status = match state.scripted.pop_front() {
            Some(result) => result?,
            None => ExecutionStatus::SuccessValue(Vec::new()),
        };
        if status.outcome().is_success() {
            apply(&mut state, &tx);
        }

        Ok(TxOutcome {
            transaction_hash: format!("mock-tx-{index}"),
            status,
            logs: Vec::new(),
        })
    }
}
