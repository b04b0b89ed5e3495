use crate::error::{BootstrapError, DialError};
use crate::node_address::NodeAddress;
use crate::proxy::{SocksCredentials, SocksProxy};
use crate::substrate::{HiddenEndpoint, Substrate};
use crate::tor::control::TorControl;
use crate::tor::mode::PRIVATE_KEY_FILE;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

/// A running tor instance: outbound connections go through its SOCKS port, the hidden endpoint
///  is published through its control port.
pub struct OnionSubstrate {
    control: Arc<Mutex<TorControl>>,
    socks_addr: SocketAddr,
    /// Only present if the tor process was spawned by this node
    process: Mutex<Option<Child>>,
    hidden_service_dir: PathBuf,
    use_stream_isolation: bool,
    publish_timeout: Duration,
}

impl OnionSubstrate {
    pub fn new(
        control: TorControl,
        socks_addr: SocketAddr,
        process: Option<Child>,
        hidden_service_dir: PathBuf,
        use_stream_isolation: bool,
        publish_timeout: Duration,
    ) -> OnionSubstrate {
        OnionSubstrate {
            control: Arc::new(Mutex::new(control)),
            socks_addr,
            process: Mutex::new(process),
            hidden_service_dir,
            use_stream_isolation,
            publish_timeout,
        }
    }

    async fn load_private_key(&self) -> Option<String> {
        let key_file = self.hidden_service_dir.join(PRIVATE_KEY_FILE);
        match tokio::fs::read_to_string(&key_file).await {
            Ok(key) if !key.trim().is_empty() => Some(key.trim().to_string()),
            Ok(_) => {
                warn!("private key file {:?} is empty - creating a new hidden service", key_file);
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("could not read private key file {:?}, creating a new hidden service: {}", key_file, e);
                None
            }
        }
    }

    async fn store_private_key(&self, private_key: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.hidden_service_dir).await?;
        tokio::fs::write(self.hidden_service_dir.join(PRIVATE_KEY_FILE), private_key).await
    }
}

#[async_trait]
impl Substrate for OnionSubstrate {
    async fn connect(&self, peer: &NodeAddress) -> Result<TcpStream, DialError> {
        if !peer.is_onion() {
            return Err(DialError::MalformedAddress(format!("{} is not an onion address", peer)));
        }
        self.socks_proxy()
            .ok_or_else(|| DialError::Proxy("no socks proxy".to_string()))?
            .connect(peer.host_name(), peer.port())
            .await
    }

    async fn listen(&self, service_port: u16) -> Result<HiddenEndpoint, BootstrapError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        let private_key = self.load_private_key().await;
        let reply = {
            let mut control = self.control.lock().await;
            let reply = control.add_onion(private_key.as_deref(), service_port, local_addr).await
                .map_err(|e| BootstrapError::Control(e.to_string()))?;
            control.set_events(&["HS_DESC"]).await
                .map_err(|e| BootstrapError::Control(e.to_string()))?;
            reply
        };
        if let Some(new_key) = &reply.private_key {
            self.store_private_key(new_key).await?;
        }

        let address = NodeAddress::new(format!("{}.onion", reply.service_id), service_port);
        info!("hidden service {} forwards to {:?}, waiting for it to be published", address, local_addr);

        let control = self.control.clone();
        let publish_timeout = self.publish_timeout;
        let service_id = reply.service_id;
        let published_address = address.clone();
        let published = Box::pin(async move {
            let mut control = control.lock().await;
            match time::timeout(publish_timeout, control.wait_for_hs_desc_uploaded(&service_id)).await {
                Ok(Ok(())) => Ok(published_address),
                Ok(Err(e)) => Err(BootstrapError::Control(e.to_string())),
                Err(_) => Err(BootstrapError::PublishTimeout(publish_timeout)),
            }
        });

        Ok(HiddenEndpoint {
            provisional_address: address,
            listener,
            published,
        })
    }

    fn socks_proxy(&self) -> Option<SocksProxy> {
        let proxy = SocksProxy::new(self.socks_addr);
        if self.use_stream_isolation {
            Some(proxy.with_credentials(SocksCredentials::random()))
        }
        else {
            Some(proxy)
        }
    }

    async fn shut_down(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            debug!("tor instance is not owned by this node - leaving it running");
            return;
        };

        match time::timeout(Duration::from_secs(1), self.control.lock()).await {
            Ok(mut control) => {
                if let Err(e) = control.signal_shutdown().await {
                    debug!("could not signal tor to shut down: {}", e);
                }
            }
            Err(_) => debug!("control connection is busy - killing tor"),
        }
        if let Err(e) = process.kill().await {
            debug!("error killing tor process: {}", e);
        }
        info!("tor process shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// A control port that accepts ADD_ONION / SETEVENTS and then reports the upload
    async fn fake_tor(expect_key: Option<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            match expect_key {
                Some(key) => {
                    assert!(line.starts_with(&format!("ADD_ONION {} Port=9999,127.0.0.1:", key)), "{}", line);
                    write_half.write_all(b"250-ServiceID=known\r\n250 OK\r\n").await.unwrap();
                }
                None => {
                    assert!(line.starts_with("ADD_ONION NEW:ED25519-V3 Port=9999,127.0.0.1:"), "{}", line);
                    write_half.write_all(b"250-ServiceID=fresh\r\n250-PrivateKey=ED25519-V3:abc\r\n250 OK\r\n").await.unwrap();
                }
            }

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "SETEVENTS HS_DESC");
            write_half.write_all(b"250 OK\r\n").await.unwrap();

            let service_id = if expect_key.is_some() { "known" } else { "fresh" };
            write_half.write_all(format!("650 HS_DESC UPLOADED {} UNKNOWN dir\r\n", service_id).as_bytes()).await.unwrap();

            let mut rest = String::new();
            let _ = reader.read_line(&mut rest).await;
        });
        addr
    }

    async fn substrate(control_addr: SocketAddr, hidden_service_dir: PathBuf, stream_isolation: bool) -> OnionSubstrate {
        let control = TorControl::connect(control_addr).await.unwrap();
        OnionSubstrate::new(control, "127.0.0.1:9050".parse().unwrap(), None, hidden_service_dir, stream_isolation, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_listen_creates_and_stores_key() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = substrate(fake_tor(None).await, dir.path().to_path_buf(), true).await;

        let endpoint = substrate.listen(9999).await.unwrap();
        assert_eq!(endpoint.provisional_address, NodeAddress::new("fresh.onion", 9999));
        assert_eq!(endpoint.published.await.unwrap(), NodeAddress::new("fresh.onion", 9999));
        assert_eq!(std::fs::read_to_string(dir.path().join(PRIVATE_KEY_FILE)).unwrap(), "ED25519-V3:abc");
    }

    #[tokio::test]
    async fn test_listen_reuses_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "ED25519-V3:stored\n").unwrap();
        let substrate = substrate(fake_tor(Some("ED25519-V3:stored")).await, dir.path().to_path_buf(), true).await;

        let endpoint = substrate.listen(9999).await.unwrap();
        assert_eq!(endpoint.published.await.unwrap(), NodeAddress::new("known.onion", 9999));
    }

    #[tokio::test]
    async fn test_connect_rejects_non_onion_address() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = substrate(fake_tor(None).await, dir.path().to_path_buf(), false).await;

        let result = substrate.connect(&NodeAddress::localhost(1234)).await;
        assert!(matches!(result, Err(DialError::MalformedAddress(_))));
    }

    #[tokio::test]
    async fn test_stream_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let isolated = substrate(fake_tor(None).await, dir.path().to_path_buf(), true).await;
        let a = isolated.socks_proxy().unwrap();
        let b = isolated.socks_proxy().unwrap();
        assert!(a.credentials().is_some());
        assert_ne!(a.credentials(), b.credentials());

        let shared = substrate(fake_tor(None).await, dir.path().to_path_buf(), false).await;
        assert_eq!(shared.socks_proxy(), shared.socks_proxy());
        assert!(shared.socks_proxy().unwrap().credentials().is_none());
    }
}
