use crate::capabilities::Capabilities;
use anyhow::bail;
use std::path::PathBuf;
use std::time::Duration;

pub struct TransportConfig {
    /// The port of the published endpoint. In localhost mode this is the local TCP port, 0
    ///  meaning 'any free port'.
    pub service_port: u16,
    pub network_mode: NetworkMode,

    /// Frames longer than this are rejected, and a connection receiving one is closed
    pub max_frame_size: usize,

    /// Dialing through the anonymity substrate can take tens of seconds, so this should be
    ///  generous
    pub dial_timeout: Duration,

    /// Upper bound for the node's shutdown: connections that do not confirm their close within
    ///  this time are abandoned
    pub shutdown_timeout: Duration,
    /// Upper bound for flushing and closing a single connection's socket
    pub connection_shutdown_timeout: Duration,

    /// The capabilities this node advertises to its peers
    pub capabilities: Capabilities,

    /// SOCKS5 proxy for outbound HTTP traffic, as "ip:port"
    pub socks5_proxy_http_address: Option<String>,
    /// SOCKS5 proxy for traffic to external (non-overlay) peers, as "ip:port". If unset, the
    ///  node's own substrate proxy is used.
    pub socks5_proxy_peer_address: Option<String>,
}

impl TransportConfig {
    pub fn new(service_port: u16, network_mode: NetworkMode) -> TransportConfig {
        TransportConfig {
            service_port,
            network_mode,
            max_frame_size: 16 * 1024 * 1024,
            dial_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(3),
            connection_shutdown_timeout: Duration::from_secs(2),
            capabilities: Capabilities::default_for_peer(),
            socks5_proxy_http_address: None,
            socks5_proxy_peer_address: None,
        }
    }

    pub fn new_localhost(service_port: u16) -> TransportConfig {
        TransportConfig::new(service_port, NetworkMode::Localhost(LocalhostConfig::default()))
    }

    pub fn new_tor(service_port: u16, tor_dir: impl Into<PathBuf>) -> TransportConfig {
        TransportConfig::new(service_port, NetworkMode::Tor(TorConfig::new(tor_dir)))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size < 1024 {
            bail!("maximum frame size is too small: {}", self.max_frame_size);
        }
        if self.max_frame_size > u32::MAX as usize {
            bail!("maximum frame size must fit into the u32 length prefix");
        }
        if self.shutdown_timeout.is_zero() || self.connection_shutdown_timeout.is_zero() {
            bail!("shutdown timeouts must be positive");
        }
        if self.dial_timeout.is_zero() {
            bail!("dial timeout must be positive");
        }
        if let NetworkMode::Tor(tor) = &self.network_mode {
            if self.service_port == 0 {
                bail!("a hidden service requires an explicit service port");
            }
            tor.validate()?;
        }
        Ok(())
    }
}

pub enum NetworkMode {
    /// Plain TCP on localhost with simulated substrate delays, for testing and development
    Localhost(LocalhostConfig),
    Tor(TorConfig),
}

pub struct LocalhostConfig {
    pub simulated_tor_node_ready_delay: Duration,
    pub simulated_hidden_service_ready_delay: Duration,
}

impl Default for LocalhostConfig {
    fn default() -> Self {
        LocalhostConfig {
            simulated_tor_node_ready_delay: Duration::from_millis(500),
            simulated_hidden_service_ready_delay: Duration::from_millis(500),
        }
    }
}

pub struct TorConfig {
    /// Working directory for the tor data directory, torrc and the hidden service key
    pub tor_dir: PathBuf,
    pub tor_binary: PathBuf,
    /// A torrc file whose contents are used as the base of the generated torrc
    pub torrc_file: Option<PathBuf>,
    /// Additional torrc options as "key value,key value", overriding the base file
    pub torrc_options: String,

    /// If set, an already running tor instance is used instead of spawning a new one
    pub control_port: Option<u16>,
    pub control_password: String,
    pub cookie_file: Option<PathBuf>,

    /// Use a separate circuit for every stream by passing random SOCKS credentials
    pub use_stream_isolation: bool,

    /// Number of restarts with different bridges after retryable startup failures
    pub max_restart_attempts: u32,
    pub bootstrap_timeout: Duration,
    pub publish_timeout: Duration,
    /// Number of retained backups of the hidden service's private key
    pub max_key_backups: usize,

    pub bridge_addresses: Vec<String>,
}

impl TorConfig {
    pub fn new(tor_dir: impl Into<PathBuf>) -> TorConfig {
        TorConfig {
            tor_dir: tor_dir.into(),
            tor_binary: PathBuf::from("tor"),
            torrc_file: None,
            torrc_options: String::new(),
            control_port: None,
            control_password: String::new(),
            cookie_file: None,
            use_stream_isolation: true,
            max_restart_attempts: 5,
            bootstrap_timeout: Duration::from_secs(180),
            publish_timeout: Duration::from_secs(120),
            max_key_backups: 20,
            bridge_addresses: Vec::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tor_dir.as_os_str().is_empty() {
            bail!("tor directory must be configured");
        }
        if self.control_port == Some(0) {
            bail!("control port 0 is not a valid port");
        }
        if self.max_key_backups == 0 {
            bail!("at least one key backup must be retained");
        }
        Ok(())
    }
}
