use anyhow::{Context, Result};
use roc_automation::utils::logging;
use roc_automation::{App, Config};
use std::sync::Arc;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load().context("加载配置失败")?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化应用
    let app = Arc::new(
        App::initialize(config)
            .await
            .context("初始化应用失败")?,
    );

    // Ctrl-C：停止派发，等待进行中的行动结束
    let stopper = app.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stopper.request_stop(),
            Err(e) => warn!("无法监听 Ctrl-C: {}", e),
        }
    });

    let summary = app.run().await;
    if let Some(cause) = summary.fatal {
        anyhow::bail!("运行终止: {}", cause);
    }

    Ok(())
}
