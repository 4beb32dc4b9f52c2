use std::io::Write;

use chrono::Local;
use log::{LevelFilter, SetLoggerError};

/// Installs an `env_logger` backend that prefixes records with a local RFC 3339
/// timestamp. `RUST_LOG` overrides `level`.
///
/// Returns the error instead of panicking when a logger is already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()?;
    log::info!("Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let _ = init(LevelFilter::Debug);
        assert!(init(LevelFilter::Info).is_err());
    }
}
