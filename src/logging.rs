use tracing_subscriber::{EnvFilter, fmt};

/// 按 `-d` 次数选择默认诊断级别
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

/// 初始化 tracing 日志系统（输出到 stderr，RUST_LOG 优先）
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    tracing::debug!("日志系统初始化完成");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "debug");
        assert_eq!(default_directive(5), "trace");
    }
}
