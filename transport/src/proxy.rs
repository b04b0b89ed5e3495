use crate::config::TransportConfig;
use crate::error::DialError;
use crate::node_address::NodeAddress;
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, trace};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct SocksCredentials {
    pub username: String,
    pub password: String,
}

impl Debug for SocksCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocksCredentials{{{}:***}}", self.username)
    }
}

impl SocksCredentials {
    /// Random credentials make the substrate use a separate circuit for the stream
    pub fn random() -> SocksCredentials {
        let random_string = || rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect::<String>();

        SocksCredentials {
            username: random_string(),
            password: random_string(),
        }
    }
}

/// A SOCKS5 proxy, optionally with credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksProxy {
    addr: SocketAddr,
    credentials: Option<SocksCredentials>,
}

impl SocksProxy {
    pub fn new(addr: SocketAddr) -> SocksProxy {
        SocksProxy {
            addr,
            credentials: None,
        }
    }

    pub fn with_credentials(self, credentials: SocksCredentials) -> SocksProxy {
        SocksProxy {
            addr: self.addr,
            credentials: Some(credentials),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn credentials(&self) -> Option<&SocksCredentials> {
        self.credentials.as_ref()
    }

    /// Parses an "ip:port" proxy address without resolving names. An invalid address is logged
    ///  and ignored.
    pub fn parse(s: &str) -> Option<SocksProxy> {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Some(SocksProxy::new(addr)),
            Err(e) => {
                error!("incorrect format for socks5 proxy, expected 'ip:port' but got '{}': {}", s, e);
                None
            }
        }
    }

    /// Connects to `host:port` through the proxy, leaving name resolution to the proxy
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let mut stream = TcpStream::connect(self.addr).await
            .map_err(|e| DialError::Proxy(format!("proxy {:?} is unreachable: {}", self.addr, e)))?;
        socks5_handshake(&mut stream, host, port, self.credentials.as_ref()).await?;
        Ok(stream)
    }
}

/// Runs the client side of a SOCKS5 CONNECT handshake on an established stream to the proxy
pub async fn socks5_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&SocksCredentials>,
) -> Result<(), DialError> {
    let io_err = |e: std::io::Error| DialError::Proxy(format!("i/o error during socks5 handshake: {}", e));

    if host.is_empty() || host.len() > u8::MAX as usize {
        return Err(DialError::MalformedAddress(host.to_string()));
    }

    let method = if credentials.is_some() { METHOD_USERNAME_PASSWORD } else { METHOD_NO_AUTH };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await.map_err(io_err)?;

    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.map_err(io_err)?;
    if method_reply[0] != SOCKS_VERSION {
        return Err(DialError::Proxy(format!("unsupported socks version {}", method_reply[0])));
    }
    match (method_reply[1], credentials) {
        (METHOD_NO_AUTH, None) => {}
        (METHOD_USERNAME_PASSWORD, Some(credentials)) => authenticate(stream, credentials).await?,
        (METHOD_NONE_ACCEPTABLE, _) => return Err(DialError::Proxy("proxy accepted none of the offered authentication methods".to_string())),
        (m, _) => return Err(DialError::Proxy(format!("proxy selected unexpected authentication method {}", m))),
    }

    let mut request = BytesMut::new();
    request.put_slice(&[SOCKS_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN]);
    request.put_u8(host.len() as u8);
    request.put_slice(host.as_bytes());
    request.put_u16(port);
    stream.write_all(&request).await.map_err(io_err)?;

    let mut reply_header = [0u8; 4];
    stream.read_exact(&mut reply_header).await.map_err(io_err)?;
    if reply_header[1] != 0 {
        return Err(reply_error(reply_header[1], host, port));
    }

    let bound_addr_len = match reply_header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await.map_err(io_err)? as usize,
        atyp => return Err(DialError::Proxy(format!("invalid address type {} in socks5 reply", atyp))),
    };
    let mut bound_addr = vec![0u8; bound_addr_len + 2];
    stream.read_exact(&mut bound_addr).await.map_err(io_err)?;

    trace!("socks5 connection to {}:{} established", host, port);
    Ok(())
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, credentials: &SocksCredentials) -> Result<(), DialError> {
    let io_err = |e: std::io::Error| DialError::Proxy(format!("i/o error during socks5 authentication: {}", e));

    if credentials.username.len() > u8::MAX as usize || credentials.password.len() > u8::MAX as usize {
        return Err(DialError::Proxy("socks5 credentials are too long".to_string()));
    }

    let mut request = BytesMut::new();
    request.put_u8(1);
    request.put_u8(credentials.username.len() as u8);
    request.put_slice(credentials.username.as_bytes());
    request.put_u8(credentials.password.len() as u8);
    request.put_slice(credentials.password.as_bytes());
    stream.write_all(&request).await.map_err(io_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(io_err)?;
    if reply[1] != 0 {
        return Err(DialError::Proxy(format!("socks5 authentication rejected with status {}", reply[1])));
    }
    Ok(())
}

fn reply_error(code: u8, host: &str, port: u16) -> DialError {
    let reason = match code {
        1 => "general failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown error",
    };

    match code {
        1 | 3 | 4 | 5 | 6 => DialError::Unreachable {
            peer: NodeAddress::new(host, port),
            reason: format!("proxy reported {}", reason),
        },
        _ => DialError::Proxy(format!("proxy reported error {}: {}", code, reason)),
    }
}

/// Something that may provide a SOCKS proxy into the anonymity substrate, typically the
///  transport node once its substrate is running
#[cfg_attr(test, automock)]
pub trait SocksProxySource: Send + Sync + 'static {
    fn socks_proxy(&self) -> Option<SocksProxy>;
}

/// Resolves which proxy outbound traffic should use
pub struct ProxyProvider {
    http_proxy: Option<SocksProxy>,
    peer_proxy: Option<SocksProxy>,
    internal: Option<Arc<dyn SocksProxySource>>,
}

impl ProxyProvider {
    pub fn new(config: &TransportConfig) -> ProxyProvider {
        let parse = |s: &Option<String>| s.as_deref()
            .filter(|s| !s.is_empty())
            .and_then(SocksProxy::parse);

        ProxyProvider {
            http_proxy: parse(&config.socks5_proxy_http_address),
            peer_proxy: parse(&config.socks5_proxy_peer_address),
            internal: None,
        }
    }

    pub fn set_internal_proxy_source(&mut self, source: Arc<dyn SocksProxySource>) {
        self.internal = Some(source);
    }

    pub fn internal_proxy(&self) -> Option<SocksProxy> {
        self.internal.as_ref()
            .and_then(|s| s.socks_proxy())
    }

    pub fn http_proxy(&self) -> Option<SocksProxy> {
        self.http_proxy.clone()
    }

    /// The proxy for traffic to external peers: the configured peer proxy, falling back to the
    ///  configured HTTP proxy and finally to the node's own substrate
    pub fn peer_proxy(&self) -> Option<SocksProxy> {
        self.peer_proxy.clone()
            .or_else(|| self.http_proxy.clone())
            .or_else(|| self.internal_proxy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::DuplexStream;

    #[rstest]
    #[case::ipv4("127.0.0.1:9050", Some("127.0.0.1:9050"))]
    #[case::ipv6("[::1]:9050", Some("[::1]:9050"))]
    #[case::missing_port("127.0.0.1", None)]
    #[case::invalid_port("127.0.0.1:abc", None)]
    #[case::host_name_is_not_resolved("localhost:9050", None)]
    fn test_parse(#[case] s: &str, #[case] expected: Option<&str>) {
        let expected = expected.map(|e| SocksProxy::new(e.parse().unwrap()));
        assert_eq!(SocksProxy::parse(s), expected);
    }

    #[test]
    fn test_random_credentials_differ() {
        let a = SocksCredentials::random();
        let b = SocksCredentials::random();
        assert_eq!(a.username.len(), 16);
        assert_ne!(a, b);
    }

    async fn fake_proxy(mut server: DuplexStream, expect_auth: bool, reply_code: u8) -> (String, u16, Option<(String, String)>) {
        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], 5);

        let mut credentials = None;
        if expect_auth {
            assert_eq!(greeting[2], METHOD_USERNAME_PASSWORD);
            server.write_all(&[5, METHOD_USERNAME_PASSWORD]).await.unwrap();

            assert_eq!(server.read_u8().await.unwrap(), 1);
            let ulen = server.read_u8().await.unwrap() as usize;
            let mut user = vec![0u8; ulen];
            server.read_exact(&mut user).await.unwrap();
            let plen = server.read_u8().await.unwrap() as usize;
            let mut pass = vec![0u8; plen];
            server.read_exact(&mut pass).await.unwrap();
            credentials = Some((String::from_utf8(user).unwrap(), String::from_utf8(pass).unwrap()));
            server.write_all(&[1, 0]).await.unwrap();
        }
        else {
            assert_eq!(greeting[2], METHOD_NO_AUTH);
            server.write_all(&[5, METHOD_NO_AUTH]).await.unwrap();
        }

        let mut header = [0u8; 4];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [5, CMD_CONNECT, 0, ATYP_DOMAIN]);
        let len = server.read_u8().await.unwrap() as usize;
        let mut host = vec![0u8; len];
        server.read_exact(&mut host).await.unwrap();
        let port = server.read_u16().await.unwrap();

        server.write_all(&[5, reply_code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0]).await.unwrap();
        (String::from_utf8(host).unwrap(), port, credentials)
    }

    #[tokio::test]
    async fn test_handshake_without_credentials() {
        let (mut client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(fake_proxy(server, false, 0));

        socks5_handshake(&mut client, "peer.onion", 9999, None).await.unwrap();
        assert_eq!(proxy.await.unwrap(), ("peer.onion".to_string(), 9999, None));
    }

    #[tokio::test]
    async fn test_handshake_with_credentials() {
        let (mut client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(fake_proxy(server, true, 0));

        let credentials = SocksCredentials { username: "u".to_string(), password: "p".to_string() };
        socks5_handshake(&mut client, "peer.onion", 9999, Some(&credentials)).await.unwrap();
        let (_, _, received) = proxy.await.unwrap();
        assert_eq!(received, Some(("u".to_string(), "p".to_string())));
    }

    #[rstest]
    #[case::host_unreachable(4, true)]
    #[case::ttl_expired(6, true)]
    #[case::not_allowed(2, false)]
    #[tokio::test]
    async fn test_handshake_error_reply(#[case] code: u8, #[case] is_unreachable: bool) {
        let (mut client, server) = tokio::io::duplex(1024);
        let _proxy = tokio::spawn(fake_proxy(server, false, code));

        let err = socks5_handshake(&mut client, "peer.onion", 9999, None).await.unwrap_err();
        assert_eq!(matches!(err, DialError::Unreachable { .. }), is_unreachable);
    }

    #[test]
    fn test_peer_proxy_fallbacks() {
        let mut config = TransportConfig::new_localhost(0);
        let mut provider = ProxyProvider::new(&config);
        assert_eq!(provider.peer_proxy(), None);

        let internal = SocksProxy::new("127.0.0.1:9050".parse().unwrap());
        let mut source = MockSocksProxySource::new();
        source.expect_socks_proxy().return_const(Some(internal.clone()));
        provider.set_internal_proxy_source(Arc::new(source));
        assert_eq!(provider.peer_proxy(), Some(internal));

        config.socks5_proxy_http_address = Some("127.0.0.1:8080".to_string());
        let provider = ProxyProvider::new(&config);
        assert_eq!(provider.peer_proxy(), Some(SocksProxy::new("127.0.0.1:8080".parse().unwrap())));

        config.socks5_proxy_peer_address = Some("127.0.0.1:9999".to_string());
        config.socks5_proxy_http_address = Some("not a proxy".to_string());
        let provider = ProxyProvider::new(&config);
        assert_eq!(provider.http_proxy(), None);
        assert_eq!(provider.peer_proxy(), Some(SocksProxy::new("127.0.0.1:9999".parse().unwrap())));
    }
}
