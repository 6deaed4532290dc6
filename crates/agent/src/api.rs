//! # エージェントHTTP API
//!
//! ランナーバイナリが公開するエンドポイント。秘密鍵は一切返さない。
//!
//! | メソッド | パス | 内容 |
//! |---------|------|------|
//! | GET | `/agent-account` | アカウントIDと残高 |
//! | GET | `/attestation` | コントラクト形式のAttestation |
//! | GET | `/is-whitelisted` | 許可リストへの登録状況 |
//! | POST | `/register` | レジストリへの登録 |
//! | POST | `/call` | レジストリ関数の呼び出し |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shade_types::ContractAttestation;

use crate::agent::{CallOptions, ShadeAgent};
use crate::error::AgentError;
use crate::ledger::{Outcome, WaitUntil};

/// APIエラー型。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 不正なリクエスト
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),
    /// エージェント操作の失敗
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Agent(e) => match e {
                AgentError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
                AgentError::Attestation(_)
                | AgentError::Ledger(_)
                | AgentError::LedgerTransaction(_)
                | AgentError::Tee(_) => StatusCode::BAD_GATEWAY,
                AgentError::Json(_) | AgentError::Decode(_) => StatusCode::BAD_REQUEST,
                AgentError::RiskAcknowledgement => StatusCode::FORBIDDEN,
                AgentError::ConfigValidation(_)
                | AgentError::Key(_)
                | AgentError::NoKeysAvailable
                | AgentError::KeyProvenance(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        (status, self.to_string()).into_response()
    }
}

/// `GET /agent-account` のレスポンス。
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentAccountResponse {
    /// エージェントのアカウントID
    pub account_id: String,
    /// 残高（yoctoNEAR、10進文字列）
    pub balance: String,
}

/// `GET /is-whitelisted` のレスポンス。
#[derive(Debug, Serialize, Deserialize)]
pub struct WhitelistResponse {
    /// TEE必須のコントラクトでは `null`
    pub whitelisted: Option<bool>,
}

/// `POST /register` のレスポンス。
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// 登録トランザクションが成功したか
    pub registered: bool,
}

/// `POST /call` のリクエスト。
#[derive(Debug, Deserialize)]
pub struct CallRequest {
    /// 呼び出すメソッド名
    pub method: String,
    /// 引数（省略時は `null`）
    #[serde(default)]
    pub args: serde_json::Value,
    /// デポジット（yoctoNEAR、10進文字列）
    pub deposit: Option<String>,
    /// ガス（省略時は30 Tgas）
    pub gas: Option<u64>,
    /// 待機レベル（`EXECUTED_OPTIMISTIC` など）
    pub wait_until: Option<String>,
}

/// `POST /call` のレスポンス。
#[derive(Debug, Serialize, Deserialize)]
pub struct CallResponse {
    /// トランザクションハッシュ（base58）
    pub transaction_hash: String,
    /// 成功したか
    pub success: bool,
    /// 戻り値（JSONとして解釈できればJSON、それ以外は文字列）
    pub value: Option<serde_json::Value>,
    /// 失敗バリアント名
    pub failure: Option<String>,
    /// 実行ログ
    pub logs: Vec<String>,
}

/// ルーターを構築する。
pub fn router(agent: Arc<ShadeAgent>) -> Router {
    Router::new()
        .route("/agent-account", get(handle_agent_account))
        .route("/attestation", get(handle_attestation))
        .route("/is-whitelisted", get(handle_is_whitelisted))
        .route("/register", post(handle_register))
        .route("/call", post(handle_call))
        .with_state(agent)
}

async fn handle_agent_account(
    State(agent): State<Arc<ShadeAgent>>,
) -> Result<Json<AgentAccountResponse>, ApiError> {
    let balance = agent.balance().await?;
    Ok(Json(AgentAccountResponse {
        account_id: agent.account_id().to_string(),
        balance: balance.to_string(),
    }))
}

async fn handle_attestation(
    State(agent): State<Arc<ShadeAgent>>,
) -> Result<Json<ContractAttestation>, ApiError> {
    Ok(Json(agent.get_attestation().await?))
}

async fn handle_is_whitelisted(
    State(agent): State<Arc<ShadeAgent>>,
) -> Result<Json<WhitelistResponse>, ApiError> {
    Ok(Json(WhitelistResponse {
        whitelisted: agent.is_whitelisted().await?,
    }))
}

async fn handle_register(
    State(agent): State<Arc<ShadeAgent>>,
) -> Result<Json<RegisterResponse>, ApiError> {
    Ok(Json(RegisterResponse {
        registered: agent.register().await?,
    }))
}

async fn handle_call(
    State(agent): State<Arc<ShadeAgent>>,
    Json(req): Json<CallRequest>,
) -> Result<Json<CallResponse>, ApiError> {
    let mut options = CallOptions::default();
    if let Some(deposit) = &req.deposit {
        options.deposit = deposit
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("depositが不正です: {deposit}")))?;
    }
    if let Some(gas) = req.gas {
        options.gas = gas;
    }
    if let Some(wait_until) = &req.wait_until {
        options.wait_until = wait_until.parse::<WaitUntil>().map_err(ApiError::BadRequest)?;
    }

    let outcome = agent.call(&req.method, &req.args, options).await?;

    let response = match outcome.outcome() {
        Outcome::Success(value) => CallResponse {
            transaction_hash: outcome.transaction_hash,
            success: true,
            value: value.map(|bytes| {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
                })
            }),
            failure: None,
            logs: outcome.logs,
        },
        Outcome::Failure { variant, .. } => CallResponse {
            transaction_hash: outcome.transaction_hash,
            success: false,
            value: None,
            failure: Some(variant),
            logs: outcome.logs,
        },
    };
    Ok(Json(response))
}
