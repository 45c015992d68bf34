use crate::error::{AppResult, SessionError};
use crate::infrastructure::CookieJar;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// 连接到本地浏览器并获取游戏页面
///
/// 浏览器需要以 `--remote-debugging-port` 启动
pub async fn connect_to_browser_and_page(
    port: u16,
    target_url: &str,
) -> AppResult<(Browser, Page)> {
    let browser_url = format!("http://localhost:{}", port);
    info!("正在连接到浏览器: {}", browser_url);

    let (browser, mut handler) = Browser::connect(&browser_url).await.map_err(|e| {
        error!("连接浏览器失败: {}", e);
        SessionError::BrowserImportFailed {
            port,
            source: Box::new(e),
        }
    })?;
    debug!("浏览器连接成功");

    // 在后台处理浏览器事件
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 添加短暂延迟以等待浏览器状态同步
    sleep(tokio::time::Duration::from_millis(300)).await;

    let pages = browser.pages().await.map_err(|e| SessionError::BrowserImportFailed {
        port,
        source: Box::new(e),
    })?;
    debug!("获取到 {} 个页面", pages.len());

    let host = reqwest::Url::parse(target_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    // 优先复用已经打开的游戏页面
    for p in pages.iter() {
        if let Ok(Some(url)) = p.url().await {
            if !host.is_empty() && url.contains(&host) {
                info!("✓ 找到已打开的游戏页面: {}", url);
                return Ok((browser, p.clone()));
            }
        }
    }

    debug!("未找到游戏页面，创建新页面并导航到: {}", target_url);
    let page = browser
        .new_page(target_url)
        .await
        .map_err(|e| SessionError::BrowserImportFailed {
            port,
            source: Box::new(e),
        })?;

    Ok((browser, page))
}

/// 从浏览器中导入游戏域名下的 Cookie
pub async fn import_browser_cookies(port: u16, base_url: &str) -> AppResult<CookieJar> {
    let (_browser, page) = connect_to_browser_and_page(port, base_url).await?;

    let cookies = page
        .get_cookies()
        .await
        .map_err(|e| SessionError::BrowserImportFailed {
            port,
            source: Box::new(e),
        })?;

    let host = reqwest::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    let mut jar = CookieJar::new();
    for cookie in cookies {
        let domain = cookie.domain.trim_start_matches('.');
        if host.ends_with(domain) {
            jar.insert(cookie.name, cookie.value);
        }
    }

    info!("✓ 从浏览器导入 {} 个 Cookie", jar.len());
    Ok(jar)
}
