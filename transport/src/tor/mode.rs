use crate::config::TorConfig;
use crate::tor::control::ControlAuth;
use anyhow::bail;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const HIDDEN_SERVICE_DIR: &str = "hiddenservice";
pub const PRIVATE_KEY_FILE: &str = "private_key";

/// How the node gets hold of a tor instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorMode {
    /// Start a tor process owned by this node
    SpawnNew {
        tor_binary: PathBuf,
        tor_dir: PathBuf,
        torrc_file: Option<PathBuf>,
        torrc_overrides: Vec<(String, String)>,
    },
    /// Use a tor instance that is already running, controlled through its control port
    AttachExisting {
        tor_dir: PathBuf,
        control_port: u16,
        auth: ControlAuth,
    },
}

impl TorMode {
    pub fn from_config(config: &TorConfig) -> TorMode {
        match config.control_port {
            Some(control_port) => {
                let auth = if !config.control_password.is_empty() {
                    ControlAuth::Password(config.control_password.clone())
                }
                else {
                    match &config.cookie_file {
                        Some(cookie_file) if cookie_file.exists() => ControlAuth::CookieFile(cookie_file.clone()),
                        Some(cookie_file) => {
                            error!("cookie file {:?} does not exist - trying to authenticate without credentials", cookie_file);
                            ControlAuth::None
                        }
                        None => ControlAuth::None,
                    }
                };
                info!("using the running tor instance with control port {}", control_port);
                TorMode::AttachExisting {
                    tor_dir: config.tor_dir.clone(),
                    control_port,
                    auth,
                }
            }
            None => {
                let torrc_overrides = match parse_torrc_options(&config.torrc_options) {
                    Ok(overrides) => overrides,
                    Err(e) => {
                        error!("error parsing torrc options, ignoring them: {}", e);
                        Vec::new()
                    }
                };
                TorMode::SpawnNew {
                    tor_binary: config.tor_binary.clone(),
                    tor_dir: config.tor_dir.clone(),
                    torrc_file: config.torrc_file.clone(),
                    torrc_overrides,
                }
            }
        }
    }

    pub fn tor_dir(&self) -> &Path {
        match self {
            TorMode::SpawnNew { tor_dir, .. } => tor_dir,
            TorMode::AttachExisting { tor_dir, .. } => tor_dir,
        }
    }

    /// The directory holding the hidden service's private key and its backups
    pub fn hidden_service_dir(&self) -> PathBuf {
        self.tor_dir().join(HIDDEN_SERVICE_DIR)
    }
}

/// Parses torrc options of the form "key value,key value"
pub fn parse_torrc_options(options: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut result = Vec::new();
    for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        let Some((key, value)) = option.split_once(char::is_whitespace) else {
            bail!("torrc option without value: {:?}", option);
        };
        let value = value.trim();
        if value.is_empty() {
            bail!("torrc option without value: {:?}", option);
        }
        result.push((key.to_string(), value.to_string()));
    }
    Ok(result)
}

pub struct TorrcPaths<'a> {
    pub data_dir: &'a Path,
    pub control_port_file: &'a Path,
    pub cookie_file: &'a Path,
}

/// Assembles the torrc: the base file's options, then the options the node relies on, then
///  bridges and finally the configured overrides. An override replaces all earlier lines with
///  the same key.
pub fn build_torrc(base: Option<&str>, paths: &TorrcPaths, bridges: &[String], overrides: &[(String, String)]) -> String {
    let mut options: Vec<(String, String)> = Vec::new();

    if let Some(base) = base {
        for line in base.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((key, value)) => options.push((key.to_string(), value.trim().to_string())),
                None => options.push((line.to_string(), String::new())),
            }
        }
    }

    let path = |p: &Path| p.display().to_string();
    options.push(("DataDirectory".to_string(), path(paths.data_dir)));
    options.push(("SocksPort".to_string(), "auto".to_string()));
    options.push(("ControlPort".to_string(), "auto".to_string()));
    options.push(("ControlPortWriteToFile".to_string(), path(paths.control_port_file)));
    options.push(("CookieAuthentication".to_string(), "1".to_string()));
    options.push(("CookieAuthFile".to_string(), path(paths.cookie_file)));

    if !bridges.is_empty() {
        options.push(("UseBridges".to_string(), "1".to_string()));
        for bridge in bridges {
            options.push(("Bridge".to_string(), bridge.clone()));
        }
    }

    for (key, value) in overrides {
        options.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        options.push((key.clone(), value.clone()));
    }

    options.iter()
        .map(|(k, v)| if v.is_empty() { format!("{}\n", k) } else { format!("{} {}\n", k, v) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![])]
    #[case::single("ExitNodes {de}", vec![("ExitNodes", "{de}")])]
    #[case::several(" ExitNodes {de} , StrictNodes 1,", vec![("ExitNodes", "{de}"), ("StrictNodes", "1")])]
    fn test_parse_torrc_options(#[case] options: &str, #[case] expected: Vec<(&str, &str)>) {
        let expected = expected.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(parse_torrc_options(options).unwrap(), expected);
    }

    #[rstest]
    #[case::no_value("StrictNodes")]
    #[case::one_without_value("ExitNodes {de},StrictNodes")]
    fn test_parse_torrc_options_invalid(#[case] options: &str) {
        assert!(parse_torrc_options(options).is_err());
    }

    #[test]
    fn test_invalid_options_are_dropped() {
        let mut config = TorConfig::new("/tmp/tor");
        config.torrc_options = "ExitNodes".to_string();
        match TorMode::from_config(&config) {
            TorMode::SpawnNew { torrc_overrides, .. } => assert!(torrc_overrides.is_empty()),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_attach_existing_auth() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookie");

        let mut config = TorConfig::new(dir.path());
        config.control_port = Some(9051);
        config.cookie_file = Some(cookie_file.clone());
        assert_eq!(TorMode::from_config(&config), TorMode::AttachExisting {
            tor_dir: dir.path().to_path_buf(),
            control_port: 9051,
            auth: ControlAuth::None,
        });

        std::fs::write(&cookie_file, [1u8; 32]).unwrap();
        assert!(matches!(TorMode::from_config(&config), TorMode::AttachExisting { auth: ControlAuth::CookieFile(_), .. }));

        config.control_password = "secret".to_string();
        assert!(matches!(TorMode::from_config(&config), TorMode::AttachExisting { auth: ControlAuth::Password(p), .. } if p == "secret"));
    }

    #[test]
    fn test_hidden_service_dir() {
        let mode = TorMode::from_config(&TorConfig::new("/var/tor"));
        assert_eq!(mode.hidden_service_dir(), PathBuf::from("/var/tor/hiddenservice"));
    }

    #[test]
    fn test_build_torrc() {
        let paths = TorrcPaths {
            data_dir: Path::new("/tor/data"),
            control_port_file: Path::new("/tor/control_port"),
            cookie_file: Path::new("/tor/cookie"),
        };
        let base = "# comment\nAvoidDiskWrites 1\nSocksPort 9050\n";
        let torrc = build_torrc(
            Some(base),
            &paths,
            &["1.2.3.4:443 ABCD".to_string()],
            &[("SocksPort".to_string(), "9150".to_string())],
        );

        assert_eq!(torrc, "AvoidDiskWrites 1\n\
            DataDirectory /tor/data\n\
            ControlPort auto\n\
            ControlPortWriteToFile /tor/control_port\n\
            CookieAuthentication 1\n\
            CookieAuthFile /tor/cookie\n\
            UseBridges 1\n\
            Bridge 1.2.3.4:443 ABCD\n\
            SocksPort 9150\n");
    }
}
