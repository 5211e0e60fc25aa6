pub mod server_cli;

use std::path::Path;
use std::sync::Arc;

/// Install the global tracing subscriber: human-readable records on stderr
/// plus JSON-structured records appended to the configured log file.
pub fn init_tracing(log_file: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().json().with_writer(Arc::new(file)))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_creates_the_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("portcullis.json");
        init_tracing(&path).unwrap();
        assert!(path.exists());
        // A second subscriber cannot be installed; the file must still exist.
        assert!(init_tracing(&path).is_err());
    }
}
