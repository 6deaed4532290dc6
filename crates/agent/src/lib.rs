//! # Shade Agent
//!
//! TEE（dstack）上で動作するエージェントのクライアントライブラリ。
//!
//! - TEEから決定的に導出したEd25519鍵によるID（implicit account）
//! - Attestation（TDX quote + コラテラル + TCB情報）の構築
//! - NEARトランザクションの送信と失敗時の再試行
//! - 複数アクセスキーのラウンドロビン署名
//!
//! ## 使用例
//! ```no_run
//! # async fn run() -> Result<(), shade_agent::AgentError> {
//! use shade_agent::{CallOptions, ShadeAgent, ShadeConfig};
//! use shade_types::Network;
//!
//! let config = ShadeConfig::new(Network::Testnet)
//!     .with_registry("registry.testnet")
//!     .with_num_keys(3);
//! let agent = ShadeAgent::create(config).await?;
//! agent.register().await?;
//! agent
//!     .call("request_signature", &serde_json::json!({ "path": "eth" }), CallOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod api;
pub mod attestation;
pub mod config;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod tee;
pub mod transaction;

#[cfg(test)]
mod test_helpers;

pub use agent::{CallOptions, ShadeAgent};
pub use config::{ShadeConfig, SponsorConfig};
pub use error::AgentError;
pub use ledger::{LedgerConnection, TxOutcome, WaitUntil};
pub use tee::TeeClient;
