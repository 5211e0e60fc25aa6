use std::path::PathBuf;

use clap::Parser;

/// SSH bastion daemon: brokers outbound SSH connections for authenticated
/// users through ephemeral CA-signed certificates.
#[derive(Debug, Parser)]
#[command(name = "portcullis", version, about)]
pub struct ServerArgs {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_config_json() {
        let args = ServerArgs::parse_from(["portcullis"]);
        assert_eq!(args.config, PathBuf::from("config.json"));
    }

    #[test]
    fn config_flag_overrides_default() {
        let args = ServerArgs::parse_from(["portcullis", "--config", "/etc/portcullis.json"]);
        assert_eq!(args.config, PathBuf::from("/etc/portcullis.json"));
    }
}
