use std::io;
use std::path::Path;

use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Environment variable naming a file to log to instead of stderr.
pub const LOG_FILE_ENV: &str = "LAMBDA_LIVE_LOG_FILE";

/// Initialize the tracing system. The filter comes from RUST_LOG and
/// defaults to `info`.
pub fn init_tracing() -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = std::env::var_os(LOG_FILE_ENV) {
        let path = Path::new(&path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::other(format!("{LOG_FILE_ENV} must name a file")))?;
        std::fs::create_dir_all(dir)?;

        let file_appender = rolling::never(dir, name);
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;
        tracing::debug!(
            target: "lambda_live_core::utils::tracing",
            path = %path.display(),
            "Tracing initialized with file output"
        );
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(io::stderr)
                    .with_ansi(true)
                    .with_target(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;
        tracing::debug!(
            target: "lambda_live_core::utils::tracing",
            "Tracing initialized with stderr output"
        );
    }

    Ok(())
}
