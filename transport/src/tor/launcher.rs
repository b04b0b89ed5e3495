use crate::error::BootstrapError;
use crate::substrate::onion::OnionSubstrate;
use crate::substrate::Substrate;
use crate::tor::control::{ControlAuth, TorControl};
use crate::tor::mode::{build_torrc, TorMode, TorrcPaths};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starts or attaches to a tor instance, once. Retry policy lives in
///  [`crate::tor::bootstrap::TorBootstrap`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TorLauncher: Send + Sync + 'static {
    async fn launch(&self, mode: &TorMode, bridges: &[String]) -> Result<Arc<dyn Substrate>, BootstrapError>;
}

pub struct NativeTorLauncher {
    pub use_stream_isolation: bool,
    pub bootstrap_timeout: Duration,
    pub publish_timeout: Duration,
}

#[async_trait]
impl TorLauncher for NativeTorLauncher {
    async fn launch(&self, mode: &TorMode, bridges: &[String]) -> Result<Arc<dyn Substrate>, BootstrapError> {
        let (mut control, process) = match mode {
            TorMode::SpawnNew { tor_binary, tor_dir, torrc_file, torrc_overrides } => {
                let (control, process) = self.spawn(tor_binary, tor_dir, torrc_file.as_deref(), torrc_overrides, bridges).await?;
                (control, Some(process))
            }
            TorMode::AttachExisting { control_port, auth, .. } => {
                let mut control = TorControl::connect(SocketAddr::from(([127, 0, 0, 1], *control_port))).await?;
                control.authenticate(auth).await?;
                (control, None)
            }
        };

        self.await_bootstrapped(&mut control).await?;
        let socks_addr = control.socks_listener().await
            .map_err(|e| BootstrapError::Control(e.to_string()))?;
        info!("tor is ready, socks proxy on {:?}", socks_addr);

        Ok(Arc::new(OnionSubstrate::new(
            control,
            socks_addr,
            process,
            mode.hidden_service_dir(),
            self.use_stream_isolation,
            self.publish_timeout,
        )))
    }
}

impl NativeTorLauncher {
    async fn spawn(
        &self,
        tor_binary: &Path,
        tor_dir: &Path,
        torrc_file: Option<&Path>,
        torrc_overrides: &[(String, String)],
        bridges: &[String],
    ) -> Result<(TorControl, Child), BootstrapError> {
        let data_dir = tor_dir.join("data");
        let control_port_file = tor_dir.join("control_port");
        let cookie_file = tor_dir.join("control_auth_cookie");
        let torrc_path = tor_dir.join("torrc");

        tokio::fs::create_dir_all(&data_dir).await?;
        if let Err(e) = tokio::fs::remove_file(&control_port_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let base = match torrc_file {
            Some(f) => Some(tokio::fs::read_to_string(f).await
                .map_err(|e| BootstrapError::Config(format!("cannot read torrc file {:?}: {}", f, e)))?),
            None => None,
        };
        let paths = TorrcPaths {
            data_dir: &data_dir,
            control_port_file: &control_port_file,
            cookie_file: &cookie_file,
        };
        tokio::fs::write(&torrc_path, build_torrc(base.as_deref(), &paths, bridges, torrc_overrides)).await?;

        debug!("starting {:?} with {:?}", tor_binary, torrc_path);
        let mut process = Command::new(tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let control_addr = self.await_control_port(&mut process, &control_port_file).await?;
        let mut control = TorControl::connect(control_addr).await
            .map_err(|e| BootstrapError::Control(format!("control port {:?} refused the connection: {}", control_addr, e)))?;
        control.authenticate(&ControlAuth::CookieFile(cookie_file)).await?;
        control.take_ownership().await
            .map_err(|e| BootstrapError::Control(e.to_string()))?;

        Ok((control, process))
    }

    /// Waits for tor to write its control port file, which has the form `PORT=127.0.0.1:9051`
    async fn await_control_port(&self, process: &mut Child, control_port_file: &PathBuf) -> Result<SocketAddr, BootstrapError> {
        let deadline = Instant::now() + self.bootstrap_timeout;
        loop {
            if let Some(status) = process.try_wait()? {
                return Err(BootstrapError::ProcessExited(status.to_string()));
            }

            if let Ok(content) = tokio::fs::read_to_string(control_port_file).await {
                if let Some(addr) = content.lines()
                    .filter_map(|l| l.trim().strip_prefix("PORT="))
                    .find_map(|a| a.parse::<SocketAddr>().ok())
                {
                    return Ok(addr);
                }
            }

            if Instant::now() >= deadline {
                return Err(BootstrapError::BootstrapStalled { progress: 0 });
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn await_bootstrapped(&self, control: &mut TorControl) -> Result<(), BootstrapError> {
        let deadline = Instant::now() + self.bootstrap_timeout;
        let mut last_progress = 0;
        loop {
            let progress = control.bootstrap_progress().await
                .map_err(|e| BootstrapError::Control(e.to_string()))?;
            if progress != last_progress {
                debug!("tor bootstrap progress: {}%", progress);
                last_progress = progress;
            }
            if progress >= 100 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BootstrapError::BootstrapStalled { progress });
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }
}
