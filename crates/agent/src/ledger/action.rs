//! トランザクションに載せるアクション。
//!
//! レジャー実装に依存しない表現。NEARへの変換は `near_rpc` が行う。

use shade_crypto::PublicKey;

/// コントラクト関数呼び出し。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallAction {
    /// メソッド名
    pub method_name: String,
    /// 引数（JSONバイト列）
    pub args: Vec<u8>,
    /// ガス上限
    pub gas: u64,
    /// 添付するデポジット（yoctoNEAR）
    pub deposit: u128,
}

/// トランザクションのアクション。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// コントラクト関数呼び出し
    FunctionCall(FunctionCallAction),
    /// 送金（yoctoNEAR）
    Transfer {
        /// 送金額
        deposit: u128,
    },
    /// フルアクセスキーの追加
    AddKey {
        /// 追加する公開鍵
        public_key: PublicKey,
    },
    /// アクセスキーの削除
    DeleteKey {
        /// 削除する公開鍵
        public_key: PublicKey,
    },
}

impl Action {
    /// JSON引数でコントラクト関数呼び出しを構築する。
    pub fn function_call(
        method_name: &str,
        args: &serde_json::Value,
        gas: u64,
        deposit: u128,
    ) -> Result<Self, serde_json::Error> {
        Ok(Action::FunctionCall(FunctionCallAction {
            method_name: method_name.to_string(),
            args: serde_json::to_vec(args)?,
            gas,
            deposit,
        }))
    }
}
