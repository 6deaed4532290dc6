//! # テスト用モックTEE
//!
//! 決定論的な鍵素材と、report_dataをそのまま埋め込んだquoteを返す。
//! 測定レジスタは非ゼロの固定値。

use std::sync::atomic::{AtomicUsize, Ordering};

use shade_types::REPORT_DATA_LEN;

use super::{QuoteResponse, TeeClient, TeeError, TeeInfo};

/// モックquoteのプレフィックス（hex）。
pub const MOCK_QUOTE_PREFIX: &str = "5ade";

/// モックTEE。
pub struct MockTee {
    seed: [u8; 32],
    reachable: bool,
    get_key_calls: AtomicUsize,
}

impl MockTee {
    /// 到達可能なモックTEE。
    pub fn new() -> Self {
        Self::with_seed([0x11; 32])
    }

    /// 鍵素材のシードを指定する（別アプリケーション相当）。
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            seed,
            reachable: true,
            get_key_calls: AtomicUsize::new(0),
        }
    }

    /// 全ての呼び出しが失敗するモックTEE。
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new()
        }
    }

    /// `get_key` が呼ばれた回数。
    pub fn get_key_calls(&self) -> usize {
        self.get_key_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TeeError> {
        if self.reachable {
            Ok(())
        } else {
            Err(TeeError::Unreachable("mock".into()))
        }
    }
}

/// モックが返すTCB情報のJSON文字列。
pub fn mock_tcb_info_json() -> String {
    serde_json::json!({
        "mrtd": "01".repeat(48),
        "rtmr0": "02".repeat(48),
        "rtmr1": "03".repeat(48),
        "rtmr2": "04".repeat(48),
        "rtmr3": "05".repeat(48),
        "os_image_hash": "06".repeat(32),
        "compose_hash": "07".repeat(32),
        "device_id": "08".repeat(32),
        "app_compose": "{\"runner\":\"docker-compose\"}",
        "event_log": [{
            "imr": 3,
            "event_type": 134217729,
            "digest": "09".repeat(48),
            "event": "compose-hash",
            "event_payload": "07".repeat(32)
        }]
    })
    .to_string()
}

#[async_trait::async_trait]
impl TeeClient for MockTee {
    async fn info(&self) -> Result<TeeInfo, TeeError> {
        self.check()?;
        Ok(TeeInfo {
            app_id: "mock-app".into(),
            instance_id: "mock-instance".into(),
            app_name: "shade-agent".into(),
            tcb_info: mock_tcb_info_json(),
        })
    }

    async fn get_quote(
        &self,
        report_data: &[u8; REPORT_DATA_LEN],
    ) -> Result<QuoteResponse, TeeError> {
        self.check()?;
        Ok(QuoteResponse {
            quote: format!("{MOCK_QUOTE_PREFIX}{}", hex::encode(report_data)),
            event_log: "[]".into(),
        })
    }

    async fn get_key(&self, path: &str) -> Result<Vec<u8>, TeeError> {
        self.check()?;
        self.get_key_calls.fetch_add(1, Ordering::SeqCst);
        let mut input = self.seed.to_vec();
        input.extend_from_slice(path.as_bytes());
        Ok(shade_crypto::sha256(&input).to_vec())
    }
}
