//! # テスト用共通ヘルパー
//!
//! attestation, agent, ledgerのテストで共有するモックサーバー群。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};

/// ルーターを127.0.0.1のランダムポートで起動する。
pub async fn start_mock_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// モックVerification Serviceのレスポンス。
pub fn mock_collateral_response() -> serde_json::Value {
    serde_json::json!({
        "quote_collateral": {
            "pck_crl_issuer_chain": "-----BEGIN CERTIFICATE-----\nMIIC",
            "root_ca_crl": "0x308201",
            "pck_crl": "308202",
            "tcb_info_issuer_chain": "-----BEGIN CERTIFICATE-----\nMIID",
            "tcb_info": "{\"id\":\"TDX\",\"version\":3}",
            "tcb_info_signature": "aa".repeat(64),
            "qe_identity_issuer_chain": "-----BEGIN CERTIFICATE-----\nMIIE",
            "qe_identity": "{\"id\":\"TD_QE\"}",
            "qe_identity_signature": "bb".repeat(64)
        },
        "checksum": "c0ffee"
    })
}

/// モックVerification Serviceを起動する。
///
/// 受け取ったquote（hex）を記録し、呼び出し回数を数える。
pub async fn start_mock_verifier() -> (String, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let quotes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let app = {
        let calls = calls.clone();
        let quotes = quotes.clone();
        Router::new().route(
            "/verify",
            post(move |Json(body): Json<serde_json::Value>| {
                let calls = calls.clone();
                let quotes = quotes.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    quotes
                        .lock()
                        .unwrap()
                        .push(body["hex"].as_str().unwrap_or_default().to_string());
                    Json(mock_collateral_response())
                }
            }),
        )
    };
    let addr = start_mock_server(app).await;
    (format!("http://{addr}/verify"), calls, quotes)
}
