//! Demo / smoke-test binary: opens a file-backed log in a temp directory,
//! registers a handful of entries, appends at a steady rate, flushes, and
//! reports the resulting file size.

use std::time::Duration;

use wpilog_writer::{DataLog, WriterConfig};

fn main() {
    env_logger::init();

    let dir = tempfile::tempdir().expect("create temp dir");
    let dir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .expect("temp dir path is valid UTF-8");

    let config = WriterConfig::default().with_period(Duration::from_millis(50));
    let log = DataLog::open_file(dir.clone(), "", "", config);

    let voltage = log.start("/robot/voltage", "double", "", 0);
    let enabled = log.start("/robot/enabled", "boolean", "", 0);
    let status = log.start("/robot/status", "string", "", 0);

    for i in 0..1000u32 {
        log.append_double(voltage, 12.0 - f64::from(i) * 0.001, 0);
        log.append_boolean(enabled, i % 2 == 0, 0);
        if i % 100 == 0 {
            log.append_string(status, "nominal", 0);
        }
    }

    log.finish(voltage, 0);
    log.finish(enabled, 0);
    log.finish(status, 0);
    log.flush();

    log.close().expect("flusher thread panicked");

    let entries: Vec<_> = std::fs::read_dir(&dir)
        .expect("read temp dir")
        .filter_map(Result::ok)
        .collect();
    for entry in entries {
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        println!("{}: {size} bytes", entry.path().display());
    }
}
