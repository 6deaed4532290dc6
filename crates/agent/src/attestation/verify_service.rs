//! # Verification Serviceクライアント
//!
//! quoteをPOSTし、quote検証用のコラテラルを取得する。
//!
//! リクエスト: `{"hex": "<quote hex>"}`
//! レスポンス: `{"quote_collateral": {...}, "checksum": "..."}`
//!
//! タイムアウト時は進行中のリクエストFutureをdropして中断する。

use std::time::Duration;

use shade_types::VerificationResponse;

use super::AttestationError;

/// コラテラルを取得する。
///
/// 非2xx・不正なJSON・タイムアウトはいずれもエラー。再試行しない。
pub async fn request_collateral(
    http: &reqwest::Client,
    url: &str,
    quote_hex: &str,
    timeout: Duration,
) -> Result<VerificationResponse, AttestationError> {
    let request = async {
        let resp = http
            .post(url)
            .json(&serde_json::json!({ "hex": quote_hex }))
            .send()
            .await
            .map_err(|e| AttestationError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AttestationError::Status {
                status: status.as_u16(),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| AttestationError::Network(e.to_string()))?;
        serde_json::from_slice::<VerificationResponse>(&body)
            .map_err(|e| AttestationError::MalformedResponse(e.to_string()))
    };

    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(url, timeout_ms = timeout.as_millis() as u64, "コラテラル取得がタイムアウトしました");
            Err(AttestationError::Timeout(timeout))
        }
    }
}
