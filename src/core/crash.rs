//! 崩溃转储
//!
//! 在 panic 或致命错误时，把原因和调用栈写入 `<dump_dir>/YYYY-MMDD-HHMM.dmp`，
//! 然后再交给默认的 panic 处理。转储不属于正常运行状态，只用于事后诊断。

use std::backtrace::Backtrace;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::error;

/// 转储文件名，精确到分钟
pub fn dump_file_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}.dmp", now.format("%Y-%m%d-%H%M"))
}

/// 写入一份崩溃转储并返回其路径
pub fn write_dump(dump_dir: &Path, reason: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dump_dir)?;

    let now = chrono::Local::now();
    let path = dump_dir.join(dump_file_name(now));

    // 同一分钟内的多次转储追加到同一个文件
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    writeln!(file, "=== kestrel crash dump ===")?;
    writeln!(file, "time: {}", now.to_rfc3339())?;
    writeln!(file, "thread: {}", std::thread::current().name().unwrap_or("<unnamed>"))?;
    writeln!(file, "reason: {reason}")?;
    writeln!(file, "backtrace:\n{}", Backtrace::force_capture())?;
    file.flush()?;

    Ok(path)
}

/// 安装 panic 钩子
///
/// 钩子先写转储、记录日志，再调用之前注册的钩子（默认会打印到 stderr）。
pub fn install_panic_hook(dump_dir: PathBuf) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let reason = info.to_string();
        match write_dump(&dump_dir, &reason) {
            Ok(path) => error!(dump = %path.display(), "Unhandled panic, crash dump written"),
            Err(e) => error!(error = %e, "Unhandled panic, failed to write crash dump"),
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dump_file_name() {
        let now = chrono::Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(dump_file_name(now), "2025-0102-0304.dmp");
    }

    #[test]
    fn test_write_dump_contains_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dump(dir.path(), "device removed").unwrap();

        assert!(path.starts_with(dir.path()));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("reason: device removed"));
        assert!(contents.contains("backtrace:"));
    }
}
