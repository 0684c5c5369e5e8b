use dapmux::Session;
use std::io::Write;
use std::sync::Mutex;

/// Minimal file-backed logger used only when `MIKRO_DAP_LOG` names a path;
/// otherwise logging goes through the teacher's usual `simple_logger`
/// setup straight to stderr.
struct FileLogger {
    file: Mutex<std::fs::File>,
    level: log::LevelFilter,
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{} [{}] {}: {}",
                chrono_like_timestamp(),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Avoids pulling in a timestamp crate just for log lines; seconds since
/// the epoch is good enough for correlating adapter log files.
fn chrono_like_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Same `simple_logger` setup pattern as the teacher's GUI entry point,
/// minus the GUI module overrides (`eframe`, `egui_extras`, `syntect`),
/// plus this crate's own modules. `MIKRO_DAP_LOG`, if set, redirects log
/// output to that file instead of stderr.
fn init_logging() {
    let level = log::LevelFilter::Debug;

    if let Ok(path) = std::env::var("MIKRO_DAP_LOG") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                let logger = FileLogger {
                    file: Mutex::new(file),
                    level,
                };
                if log::set_boxed_logger(Box::new(logger)).is_ok() {
                    log::set_max_level(level);
                    return;
                }
            }
            Err(e) => {
                eprintln!(
                    "mikro-dap-adapter: failed to open log file '{path}': {e}, logging to stderr"
                );
            }
        }
    }

    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("dapmux", level)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    log::info!("mikro-dap-adapter starting");

    let gdb_path = std::env::var("MIKRO_DAP_GDB_PATH").unwrap_or_else(|_| "gdb".to_string());
    let mi_timeout = std::env::var("MIKRO_DAP_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_millis)
        .unwrap_or(std::time::Duration::from_secs(10));

    let session = match Session::with_mi_timeout(&gdb_path, tokio::io::stdout(), mi_timeout).await
    {
        Ok(session) => session,
        Err(e) => {
            log::error!("failed to start gdb ('{gdb_path}'): {e}");
            std::process::exit(1);
        }
    };

    dapmux::lifecycle::spawn_parent_watchdog(|| {
        std::process::exit(0);
    });

    match session.run(tokio::io::stdin()).await {
        Ok(()) => {
            log::info!("mikro-dap-adapter exiting normally");
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("session loop ended with io error: {e}");
            std::process::exit(1);
        }
    }
}
