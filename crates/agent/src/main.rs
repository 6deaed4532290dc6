//! # Shade Agent ランナー
//!
//! 環境変数から設定を読み、エージェントを作成してHTTP APIを公開する。
//!
//! ## 起動シーケンス
//! 1. 設定の読み込みと検証
//! 2. dstack検出とID鍵生成（スポンサー設定時は資金提供）
//! 3. レジストリ設定時は `register_agent` を呼ぶ
//! 4. `LISTEN_ADDR`（デフォルト `0.0.0.0:3140`）でAPIを公開

use std::sync::Arc;

use shade_agent::{api, ShadeAgent, ShadeConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3140";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ShadeConfig::from_env()?;
    let agent = Arc::new(ShadeAgent::create(config).await?);
    tracing::info!(
        account_id = agent.account_id(),
        in_tee = agent.in_tee(),
        "エージェントを起動しました"
    );

    if agent.config().registry_contract_id.is_some() {
        if agent.register().await? {
            tracing::info!("レジストリへの登録が完了しました");
        } else {
            // 許可リスト未登録などで失敗しても、APIから再登録できるよう起動は続ける
            tracing::warn!("レジストリへの登録に失敗しました");
        }
    }

    let app = api::router(agent);

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    tracing::info!("APIサーバーを {} で起動します", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
