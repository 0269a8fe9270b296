//! CLI command implementations

pub mod endpoint;
pub mod inspect;
pub mod send;
pub mod uri;

use std::str::FromStr;

use anyhow::{Context, Result};
use bitcoin::psbt::Psbt;
use payjoin_relay::RelayConfig;
use url::Url;

/// Relays given on the command line, else `PAYJOIN_RELAYS`.
pub fn relay_config(relays: &[Url]) -> RelayConfig {
    if relays.is_empty() {
        RelayConfig::from_env()
    } else {
        RelayConfig::default().with_relays(relays.to_vec())
    }
}

/// Read a base64 PSBT given inline or as `@path`.
pub fn read_psbt(arg: &str) -> Result<Psbt> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PSBT file {}", path))?,
        None => arg.to_string(),
    };
    Psbt::from_str(text.trim()).context("Invalid base64 PSBT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use payjoin_lib::test_utils::fixtures::PayjoinScenario;
    use std::io::Write;

    #[test]
    fn test_read_psbt_inline_and_file() {
        let psbt = PayjoinScenario::new().original_psbt();
        assert_eq!(read_psbt(&psbt.to_string()).unwrap(), psbt);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", psbt).unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(read_psbt(&arg).unwrap(), psbt);

        assert!(read_psbt("not a psbt").is_err());
        assert!(read_psbt("@/nonexistent/psbt").is_err());
    }

    #[test]
    fn test_relay_config_prefers_flags() {
        let relay = Url::parse("wss://relay.example.com").unwrap();
        let config = relay_config(std::slice::from_ref(&relay));
        assert_eq!(config.relays, vec![relay]);
    }
}
