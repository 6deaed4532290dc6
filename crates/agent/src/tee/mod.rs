//! # TEEインターフェース抽象化
//!
//! ローカルTEEインターフェース（dstackゲストエージェント）の操作を抽象化するトレイト。
//!
//! 現在の実装:
//! - `dstack`: unixソケットまたはシミュレータHTTPエンドポイント経由
//! - `mock`: テスト用（決定論的な鍵素材と固定quote）
//!
//! TEEの有無は呼び出し側が指定するものではなく、[`detect`] による
//! 疎通確認の結果で決まる。確認に失敗した場合は「TEE外で動作」として扱う。

pub mod dstack;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use shade_types::REPORT_DATA_LEN;

/// TEE検出のタイムアウト。
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// TEEインターフェースのエラー型。
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    /// ソケット・エンドポイントに接続できない
    #[error("TEEインターフェースに接続できません: {0}")]
    Unreachable(String),
    /// 非2xxレスポンス
    #[error("TEEインターフェースがHTTP {status}を返しました")]
    Status {
        /// HTTPステータスコード
        status: u16,
    },
    /// レスポンスのパースに失敗
    #[error("TEEインターフェースのレスポンスが不正です: {0}")]
    InvalidResponse(String),
    /// 応答が時間内に返らなかった
    #[error("TEEインターフェースが{0:?}以内に応答しませんでした")]
    Timeout(Duration),
}

/// `/Info` の結果。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TeeInfo {
    /// アプリケーションID
    pub app_id: String,
    /// インスタンスID
    pub instance_id: String,
    /// アプリケーション名
    pub app_name: String,
    /// TCB情報（JSON文字列）
    pub tcb_info: String,
}

/// `/GetQuote` の結果。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuoteResponse {
    /// quote（hex）
    pub quote: String,
    /// イベントログ（JSON文字列）
    pub event_log: String,
}

/// TEEインターフェースのトレイト。
#[async_trait::async_trait]
pub trait TeeClient: Send + Sync {
    /// マシン情報とTCB情報を取得する。
    async fn info(&self) -> Result<TeeInfo, TeeError>;

    /// report_dataを埋め込んだquoteを取得する。
    async fn get_quote(&self, report_data: &[u8; REPORT_DATA_LEN])
        -> Result<QuoteResponse, TeeError>;

    /// `path` に紐づくTEE封印の鍵素材を取得する。
    ///
    /// 同じアプリケーション・同じパスに対しては同じ鍵素材が返る。
    async fn get_key(&self, path: &str) -> Result<Vec<u8>, TeeError>;
}

/// TEEインターフェースに到達できるかを確認する。
///
/// `info()` が [`DETECT_TIMEOUT`] 以内に成功した場合のみ `Some` を返す。
pub async fn detect(client: Arc<dyn TeeClient>) -> Option<Arc<dyn TeeClient>> {
    match tokio::time::timeout(DETECT_TIMEOUT, client.info()).await {
        Ok(Ok(info)) => {
            tracing::info!(
                app_id = %info.app_id,
                instance_id = %info.instance_id,
                "TEE環境を検出しました"
            );
            Some(client)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "TEEインターフェースに到達できません。TEE外として動作します");
            None
        }
        Err(_) => {
            tracing::warn!("TEEインターフェースの確認がタイムアウトしました。TEE外として動作します");
            None
        }
    }
}
