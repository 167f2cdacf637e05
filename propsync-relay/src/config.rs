use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use propsync_net::{DEFAULT_PUBLISH_PORT, DEFAULT_SUBSCRIBE_PORT};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    relay: RelayConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Deserialize, Default)]
struct RelayConfig {
    bind: Option<String>,
    recv_port: Option<u16>,
    send_port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct LoggingConfig {
    verbose: Option<bool>,
}

pub struct Config {
    relay: RelayConfig,
    logging: LoggingConfig,
    /// Problems found while loading, logged once the logger is up.
    warnings: Vec<String>,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(user_config_path().as_deref())
    }

    /// Embedded defaults merged with the user file at `user_path`, if it exists.
    pub fn load_from(user_path: Option<&Path>) -> Self {
        let mut warnings = Vec::new();
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
            warnings.push(format!("embedded config.toml is invalid: {}", e));
            ConfigFile::default()
        });

        if let Some(path) = user_path.filter(|p| p.exists()) {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                    Ok(user) => {
                        merge_relay(&mut base.relay, user.relay);
                        merge_logging(&mut base.logging, user.logging);
                    }
                    Err(e) => {
                        warnings.push(format!("ignoring malformed config {}: {}", path.display(), e))
                    }
                },
                Err(e) => warnings.push(format!("could not read config {}: {}", path.display(), e)),
            }
        }

        Config {
            relay: base.relay,
            logging: base.logging,
            warnings,
        }
    }

    /// Command-line flags take precedence over both config files.
    pub fn apply_args(&mut self, args: &[String]) {
        if let Some(bind) = flag_value(args, "--bind") {
            self.relay.bind = Some(bind.to_string());
        }
        if let Some(port) = self.port_flag(args, "--recv-port") {
            self.relay.recv_port = Some(port);
        }
        if let Some(port) = self.port_flag(args, "--send-port") {
            self.relay.send_port = Some(port);
        }
        if args.iter().any(|a| a == "--verbose" || a == "-v") {
            self.logging.verbose = Some(true);
        }
    }

    fn port_flag(&mut self, args: &[String], flag: &str) -> Option<u16> {
        let raw = flag_value(args, flag)?;
        match raw.parse() {
            Ok(port) => Some(port),
            Err(_) => {
                self.warnings
                    .push(format!("ignoring {} {}: not a port number", flag, raw));
                None
            }
        }
    }

    pub fn bind_ip(&self) -> IpAddr {
        let fallback = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        match self.relay.bind.as_deref() {
            Some(raw) => raw.parse().unwrap_or(fallback),
            None => fallback,
        }
    }

    pub fn recv_port(&self) -> u16 {
        self.relay.recv_port.unwrap_or(DEFAULT_PUBLISH_PORT)
    }

    pub fn send_port(&self) -> u16 {
        self.relay.send_port.unwrap_or(DEFAULT_SUBSCRIBE_PORT)
    }

    pub fn verbose(&self) -> bool {
        self.logging.verbose.unwrap_or(false)
    }

    /// Hand over collected load problems, leaving none behind.
    pub fn take_warnings(&mut self) -> Vec<String> {
        let mut warnings = std::mem::take(&mut self.warnings);
        if let Some(raw) = self.relay.bind.as_deref() {
            if raw.parse::<IpAddr>().is_err() {
                warnings.push(format!("bind address '{}' is not an IP, using 0.0.0.0", raw));
            }
        }
        warnings
    }
}

/// Directory holding the user config and the relay log.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("propsync")
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("propsync").join("config.toml"))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn merge_relay(base: &mut RelayConfig, user: RelayConfig) {
    if user.bind.is_some() {
        base.bind = user.bind;
    }
    if user.recv_port.is_some() {
        base.recv_port = user.recv_port;
    }
    if user.send_port.is_some() {
        base.send_port = user.send_port;
    }
}

fn merge_logging(base: &mut LoggingConfig, user: LoggingConfig) {
    if user.verbose.is_some() {
        base.verbose = user.verbose;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn embedded_defaults() {
        let mut config = Config::load_from(None);
        assert_eq!(config.bind_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.recv_port(), DEFAULT_PUBLISH_PORT);
        assert_eq!(config.send_port(), DEFAULT_SUBSCRIBE_PORT);
        assert!(!config.verbose());
        assert!(config.take_warnings().is_empty());
    }

    #[test]
    fn user_file_overrides_only_what_it_sets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nrecv_port = 9000\n\n[logging]\nverbose = true").unwrap();

        let config = Config::load_from(Some(file.path()));
        assert_eq!(config.recv_port(), 9000);
        assert_eq!(config.send_port(), DEFAULT_SUBSCRIBE_PORT);
        assert!(config.verbose());
    }

    #[test]
    fn malformed_user_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nrecv_port = ").unwrap();

        let mut config = Config::load_from(Some(file.path()));
        assert_eq!(config.recv_port(), DEFAULT_PUBLISH_PORT);
        let warnings = config.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("ignoring malformed config"));
    }

    #[test]
    fn missing_user_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::load_from(Some(path.as_path()));
        assert_eq!(config.send_port(), DEFAULT_SUBSCRIBE_PORT);
        assert!(config.take_warnings().is_empty());
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nbind = \"10.0.0.1\"\nsend_port = 9001").unwrap();

        let mut config = Config::load_from(Some(file.path()));
        config.apply_args(&args(&["propsync-relay", "--bind", "127.0.0.1", "--send-port", "7001", "-v"]));

        assert_eq!(config.bind_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.send_port(), 7001);
        assert!(config.verbose());
    }

    #[test]
    fn bad_flag_values_warn() {
        let mut config = Config::load_from(None);
        config.apply_args(&args(&["propsync-relay", "--recv-port", "lots", "--bind", "nowhere"]));

        assert_eq!(config.recv_port(), DEFAULT_PUBLISH_PORT);
        assert_eq!(config.bind_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.take_warnings().len(), 2);
    }
}
