use crate::config::TorConfig;
use crate::error::BootstrapError;
use crate::listener::ListenerRegistry;
use crate::substrate::{Substrate, SubstrateLauncher};
use crate::tor::backup::rolling_backup;
use crate::tor::launcher::{NativeTorLauncher, TorLauncher};
use crate::tor::mode::{TorMode, PRIVATE_KEY_FILE};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Source of bridge addresses, typically updated by the operator in reaction to
///  [`crate::listener::SetupListener::on_request_custom_bridges`]
#[cfg_attr(test, automock)]
pub trait BridgeAddressProvider: Send + Sync + 'static {
    fn bridge_addresses(&self) -> Vec<String>;
}

/// Acquires a tor instance, restarting it with (possibly) different bridges after retryable
///  failures.
pub struct TorBootstrap {
    mode: TorMode,
    launcher: Arc<dyn TorLauncher>,
    bridge_provider: Option<Arc<dyn BridgeAddressProvider>>,
    initial_bridges: Vec<String>,
    max_restart_attempts: u32,
    max_key_backups: usize,
}

impl TorBootstrap {
    pub fn new(config: &TorConfig, launcher: Arc<dyn TorLauncher>) -> TorBootstrap {
        TorBootstrap {
            mode: TorMode::from_config(config),
            launcher,
            bridge_provider: None,
            initial_bridges: config.bridge_addresses.clone(),
            max_restart_attempts: config.max_restart_attempts,
            max_key_backups: config.max_key_backups,
        }
    }

    pub fn native(config: &TorConfig) -> TorBootstrap {
        TorBootstrap::new(config, Arc::new(NativeTorLauncher {
            use_stream_isolation: config.use_stream_isolation,
            bootstrap_timeout: config.bootstrap_timeout,
            publish_timeout: config.publish_timeout,
        }))
    }

    pub fn with_bridge_provider(mut self, bridge_provider: Arc<dyn BridgeAddressProvider>) -> TorBootstrap {
        self.bridge_provider = Some(bridge_provider);
        self
    }

    pub fn mode(&self) -> &TorMode {
        &self.mode
    }

    async fn backup_private_key(&self) {
        if !matches!(self.mode, TorMode::SpawnNew { .. }) {
            return;
        }
        match rolling_backup(&self.mode.hidden_service_dir(), PRIVATE_KEY_FILE, self.max_key_backups).await {
            Ok(Some(backup)) => debug!("backed up hidden service key to {:?}", backup),
            Ok(None) => {}
            Err(e) => warn!("could not back up hidden service key: {}", e),
        }
    }
}

#[async_trait]
impl SubstrateLauncher for TorBootstrap {
    async fn acquire(&self, listeners: &Arc<ListenerRegistry>) -> Result<Arc<dyn Substrate>, BootstrapError> {
        let mut bridges = self.initial_bridges.clone();
        let mut num_failures = 0u32;

        loop {
            self.backup_private_key().await;

            let err = match self.launcher.launch(&self.mode, &bridges).await {
                Ok(substrate) => {
                    info!("tor started after {} failed attempts", num_failures);
                    return Ok(substrate);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                error!("tor could not be started: {}", err);
                return Err(err);
            }

            num_failures += 1;
            if num_failures > self.max_restart_attempts {
                error!("tor failed to start {} times, giving up: {}", num_failures, err);
                return Err(BootstrapError::RestartsExhausted {
                    attempts: num_failures,
                    last: Box::new(err),
                });
            }

            warn!("tor failed to start ({}), requesting custom bridges before restart #{}", err, num_failures);
            listeners.fire_request_custom_bridges();
            // give setup listeners the chance to update the bridges before they are read
            listeners.executor().flush().await;

            if let Some(provider) = &self.bridge_provider {
                let new_bridges = provider.bridge_addresses();
                if new_bridges.is_empty() {
                    debug!("no custom bridges provided, retrying with {:?}", bridges);
                }
                else {
                    bridges = new_bridges;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SerialExecutor;
    use crate::tor::launcher::MockTorLauncher;
    use crate::listener::SetupListener;
    use crate::substrate::localhost::LocalhostSubstrate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct BridgeRequestCounter {
        count: AtomicUsize,
    }
    impl SetupListener for BridgeRequestCounter {
        fn on_request_custom_bridges(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn registry_with_counter() -> (Arc<ListenerRegistry>, Arc<BridgeRequestCounter>) {
        let registry = Arc::new(ListenerRegistry::new(SerialExecutor::start()));
        let counter = Arc::new(BridgeRequestCounter { count: AtomicUsize::new(0) });
        registry.add_setup_listener(counter.clone()).await;
        (registry, counter)
    }

    fn localhost_substrate() -> Arc<dyn Substrate> {
        Arc::new(LocalhostSubstrate::new(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restart_attempts() {
        let mut launcher = MockTorLauncher::new();
        launcher.expect_launch()
            .times(6)
            .returning(|_, _| Err(BootstrapError::BootstrapStalled { progress: 10 }));

        let mut config = TorConfig::new("/tmp/tor-bootstrap-test");
        config.max_restart_attempts = 5;
        let bootstrap = TorBootstrap::new(&config, Arc::new(launcher));
        let (registry, counter) = registry_with_counter().await;

        let result = bootstrap.acquire(&registry).await;
        match result {
            Err(BootstrapError::RestartsExhausted { attempts, last }) => {
                assert_eq!(attempts, 6);
                assert!(matches!(*last, BootstrapError::BootstrapStalled { progress: 10 }));
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bootstrap should fail"),
        }

        registry.executor().flush().await;
        assert_eq!(counter.count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_io_error_is_fatal_immediately() {
        let mut launcher = MockTorLauncher::new();
        launcher.expect_launch()
            .times(1)
            .returning(|_, _| Err(BootstrapError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no tor binary"))));

        let bootstrap = TorBootstrap::new(&TorConfig::new("/tmp/tor-bootstrap-test"), Arc::new(launcher));
        let (registry, counter) = registry_with_counter().await;

        assert!(matches!(bootstrap.acquire(&registry).await, Err(BootstrapError::Io(_))));
        registry.executor().flush().await;
        assert_eq!(counter.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_with_provided_bridges() {
        let mut seq = mockall::Sequence::new();
        let mut launcher = MockTorLauncher::new();
        launcher.expect_launch()
            .withf(|_, bridges| bridges.to_vec() == vec!["initial:443".to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BootstrapError::ProcessExited("exit status: 1".to_string())));
        launcher.expect_launch()
            .withf(|_, bridges| bridges.to_vec() == vec!["custom:443".to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(localhost_substrate()));

        let mut provider = MockBridgeAddressProvider::new();
        provider.expect_bridge_addresses()
            .times(1)
            .returning(|| vec!["custom:443".to_string()]);

        let mut config = TorConfig::new("/tmp/tor-bootstrap-test");
        config.bridge_addresses = vec!["initial:443".to_string()];
        let bootstrap = TorBootstrap::new(&config, Arc::new(launcher))
            .with_bridge_provider(Arc::new(provider));
        let (registry, counter) = registry_with_counter().await;

        assert!(bootstrap.acquire(&registry).await.is_ok());
        assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_private_key_is_backed_up_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let config = TorConfig::new(dir.path());

        let mut launcher = MockTorLauncher::new();
        launcher.expect_launch()
            .times(1)
            .returning(|_, _| Ok(localhost_substrate()));
        let bootstrap = TorBootstrap::new(&config, Arc::new(launcher));

        let hidden_service_dir = bootstrap.mode().hidden_service_dir();
        std::fs::create_dir_all(&hidden_service_dir).unwrap();
        std::fs::write(hidden_service_dir.join(PRIVATE_KEY_FILE), "ED25519-V3:key").unwrap();

        let registry = Arc::new(ListenerRegistry::new(SerialExecutor::start()));
        assert!(bootstrap.acquire(&registry).await.is_ok());

        let backups = std::fs::read_dir(hidden_service_dir.join("backup").join(PRIVATE_KEY_FILE))
            .unwrap()
            .count();
        assert_eq!(backups, 1);
    }
}
