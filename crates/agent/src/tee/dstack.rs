//! # dstackゲストエージェントクライアント
//!
//! TEE内のdstackゲストエージェントとHTTP JSONで通信する。
//!
//! ## エンドポイント
//! | パス | リクエスト | レスポンス |
//! |------|-----------|-----------|
//! | `/Info` | `{}` | `{app_id, instance_id, tcb_info, ...}` |
//! | `/GetQuote` | `{"report_data": hex}` | `{quote, event_log}` |
//! | `/GetKey` | `{"path", "purpose"}` | `{key, signature_chain}` |
//!
//! ## 接続先
//! - 本番: unixソケット `/var/run/dstack.sock`（hyperのHTTP/1.1接続）
//! - 開発: `DSTACK_SIMULATOR_ENDPOINT` が設定されていればそのHTTP URL（reqwest）
//!
//! どちらの経路も1リクエストごとに [`REQUEST_TIMEOUT`] で打ち切る。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shade_types::REPORT_DATA_LEN;

use super::{QuoteResponse, TeeClient, TeeError, TeeInfo};

/// dstackゲストエージェントのデフォルトソケットパス。
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/dstack.sock";

/// シミュレータエンドポイントを指定する環境変数。
pub const SIMULATOR_ENDPOINT_ENV: &str = "DSTACK_SIMULATOR_ENDPOINT";

/// 1リクエストあたりのタイムアウト。
///
/// quote生成はTDXモジュールの呼び出しを含むため、検出時より長めに取る。
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// dstackへの接続先。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DstackEndpoint {
    /// unixソケット
    Unix(PathBuf),
    /// HTTP（シミュレータ）
    Http(String),
}

impl DstackEndpoint {
    /// 環境変数から接続先を決定する。
    ///
    /// `DSTACK_SIMULATOR_ENDPOINT` が `http(s)://` ならHTTP、それ以外の
    /// 非空値はソケットパスとして扱う。未設定ならデフォルトソケット。
    pub fn from_env() -> Self {
        match std::env::var(SIMULATOR_ENDPOINT_ENV) {
            Ok(v) if v.starts_with("http://") || v.starts_with("https://") => Self::Http(v),
            Ok(v) if !v.trim().is_empty() => Self::Unix(PathBuf::from(v)),
            _ => Self::Unix(PathBuf::from(DEFAULT_SOCKET_PATH)),
        }
    }
}

/// `/GetKey` のレスポンス。
#[derive(Debug, Deserialize)]
struct GetKeyResponse {
    /// 鍵素材（hex）
    key: String,
}

/// dstackゲストエージェントのクライアント。
pub struct DstackClient {
    endpoint: DstackEndpoint,
    http: reqwest::Client,
    timeout: Duration,
}

impl DstackClient {
    /// 接続先を指定してクライアントを構築する。
    pub fn new(endpoint: DstackEndpoint) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// リクエストごとのタイムアウトを変更する。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 環境変数から接続先を決定してクライアントを構築する。
    pub fn from_env() -> Self {
        Self::new(DstackEndpoint::from_env())
    }

    /// 接続先。
    pub fn endpoint(&self) -> &DstackEndpoint {
        &self.endpoint
    }

    /// JSONをPOSTし、2xxレスポンスのボディをデシリアライズする。
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, TeeError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| TeeError::InvalidResponse(format!("リクエストのシリアライズに失敗: {e}")))?;

        let (status, resp_body) = tokio::time::timeout(self.timeout, self.send(path, body))
            .await
            .map_err(|_| TeeError::Timeout(self.timeout))??;

        if !(200..300).contains(&status) {
            return Err(TeeError::Status { status });
        }

        tracing::debug!(path, status, len = resp_body.len(), "dstackレスポンス受信");

        serde_json::from_slice(&resp_body)
            .map_err(|e| TeeError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn send(&self, path: &str, body: Vec<u8>) -> Result<(u16, Vec<u8>), TeeError> {
        match &self.endpoint {
            DstackEndpoint::Http(base) => {
                let url = format!("{}{}", base.trim_end_matches('/'), path);
                let resp = self
                    .http
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .body(body)
                    .send()
                    .await
                    .map_err(unreachable_error)?;
                let status = resp.status().as_u16();
                let bytes = resp.bytes().await.map_err(unreachable_error)?;
                Ok((status, bytes.to_vec()))
            }
            DstackEndpoint::Unix(socket) => unix_request(socket, path, body).await,
        }
    }
}

#[async_trait::async_trait]
impl TeeClient for DstackClient {
    async fn info(&self) -> Result<TeeInfo, TeeError> {
        self.post_json("/Info", &serde_json::json!({})).await
    }

    async fn get_quote(
        &self,
        report_data: &[u8; REPORT_DATA_LEN],
    ) -> Result<QuoteResponse, TeeError> {
        let body = serde_json::json!({ "report_data": hex::encode(report_data) });
        self.post_json("/GetQuote", &body).await
    }

    async fn get_key(&self, path: &str) -> Result<Vec<u8>, TeeError> {
        let body = serde_json::json!({ "path": path, "purpose": "" });
        let resp: GetKeyResponse = self.post_json("/GetKey", &body).await?;
        // 鍵素材そのものはエラーに含めない
        shade_crypto::hex_to_bytes(&resp.key)
            .map_err(|e| TeeError::InvalidResponse(format!("/GetKey: {e}")))
    }
}

// ---------------------------------------------------------------------------
// unixソケット上のHTTP/1.1
// ---------------------------------------------------------------------------

fn unreachable_error(e: impl std::fmt::Display) -> TeeError {
    TeeError::Unreachable(e.to_string())
}

/// unixソケットに1本の接続を張り、hyperでリクエストを1回送る。
///
/// 接続タスクはspawnせず応答と同じfutureで駆動するので、呼び出し側の
/// タイムアウトで破棄されればソケットも閉じられる。
#[cfg(unix)]
async fn unix_request(
    socket: &Path,
    path: &str,
    body: Vec<u8>,
) -> Result<(u16, Vec<u8>), TeeError> {
    let stream = tokio::net::UnixStream::connect(socket)
        .await
        .map_err(|e| TeeError::Unreachable(format!("{}: {e}", socket.display())))?;
    let (mut sender, connection) = hyper::client::conn::handshake(stream)
        .await
        .map_err(unreachable_error)?;

    let request = hyper::Request::post(path)
        .header(hyper::header::HOST, "localhost")
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(body))
        .map_err(|e| TeeError::InvalidResponse(format!("リクエストの構築に失敗: {e}")))?;

    let exchange = async move {
        let response = sender.send_request(request).await.map_err(unreachable_error)?;
        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(unreachable_error)?;
        Ok::<_, TeeError>((status, body.to_vec()))
    };

    tokio::select! {
        result = exchange => result,
        Err(e) = connection => Err(unreachable_error(e)),
    }
}

#[cfg(not(unix))]
async fn unix_request(
    socket: &Path,
    _path: &str,
    _body: Vec<u8>,
) -> Result<(u16, Vec<u8>), TeeError> {
    Err(TeeError::Unreachable(format!(
        "{}: unixソケットはこのプラットフォームで利用できません",
        socket.display()
    )))
}
