/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use crate::config::Config;
use crate::error::{AppError, AppResult};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing
///
/// `RUST_LOG` 优先；否则详细模式为 debug，普通模式为 info
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> AppResult<()> {
    let log_header = format!(
        "{}\n运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header).map_err(|e| AppError::file_write_failed(log_file_path, e))
}

/// 追加内容到日志文件
pub fn append_log_file(log_file_path: &str, content: &str) -> AppResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .map_err(|e| AppError::file_write_failed(log_file_path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| AppError::file_write_failed(log_file_path, e))
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {}", config.base_url);
    info!(
        "📊 会话 {} 个 | 扫描并发 {} | 派发并发 {}",
        config.session_count, config.scan_workers, config.dispatch_workers
    );
    info!(
        "🧩 打码方式: {:?} | 缓存水位: {}",
        config.solver, config.cache_size
    );
    info!("{}", "=".repeat(60));
}

/// 记录阶段开始
///
/// # 参数
/// - `index`: 阶段序号
/// - `total`: 阶段总数
/// - `name`: 阶段名称
pub fn log_phase_start(index: usize, total: usize, name: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📦 阶段 {}/{}: {}", index, total, name);
    info!("{}", "=".repeat(60));
}

/// 记录阶段完成
pub fn log_phase_complete(name: &str, elapsed_secs: f64) {
    info!("{}", "─".repeat(60));
    info!("✓ {} 完成，用时 {:.1} 秒", name, elapsed_secs);
    info!("{}", "─".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("验证码缓存", 3), "验证码...");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    #[test]
    fn test_log_file_header_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");
        let path = path.to_str().unwrap();

        init_log_file(path).unwrap();
        append_log_file(path, "摘要\n").unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with(&"=".repeat(60)));
        assert!(content.ends_with("摘要\n"));
    }
}
