use crate::buf::{put_string, try_get_string};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const ONION_SUFFIX: &str = ".onion";

/// Logical identity of a peer: the host name is either an onion service name or an IP / DNS
///  name (localhost mode), plus the port of the published endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    host_name: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host_name: impl Into<String>, port: u16) -> NodeAddress {
        NodeAddress {
            host_name: host_name.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> NodeAddress {
        NodeAddress::new("localhost", port)
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_onion(&self) -> bool {
        self.host_name.ends_with(ONION_SUFFIX)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.host_name);
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddress> {
        let host_name = try_get_string(buf)?;
        if host_name.is_empty() {
            bail!("empty host name");
        }
        let port = buf.try_get_u16()?;
        Ok(NodeAddress { host_name, port })
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host_name, port) = s.rsplit_once(':')
            .ok_or_else(|| anyhow!("node address must have the form 'host:port': {}", s))?;
        if host_name.is_empty() {
            bail!("node address without host name: {}", s);
        }
        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("invalid port in node address {}: {}", s, e))?;
        Ok(NodeAddress::new(host_name, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::onion("abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx.onion:9999", "abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx.onion", 9999, true)]
    #[case::localhost("localhost:2002", "localhost", 2002, false)]
    #[case::ip("127.0.0.1:1", "127.0.0.1", 1, false)]
    fn test_parse(#[case] s: &str, #[case] host: &str, #[case] port: u16, #[case] is_onion: bool) {
        let addr: NodeAddress = s.parse().unwrap();
        assert_eq!(addr.host_name(), host);
        assert_eq!(addr.port(), port);
        assert_eq!(addr.is_onion(), is_onion);
        assert_eq!(addr.to_string(), s);
    }

    #[rstest]
    #[case::no_port("localhost")]
    #[case::empty_host(":123")]
    #[case::port_overflow("localhost:70000")]
    #[case::port_not_numeric("localhost:abc")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(s.parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_ser_deser() {
        let addr = NodeAddress::new("xyz.onion", 8000);
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(&buf, b"\x09xyz.onion\x1f\x40".as_slice());

        let mut deser_buf = buf.freeze();
        assert_eq!(NodeAddress::try_deser(&mut deser_buf).unwrap(), addr);
        assert!(deser_buf.is_empty());
    }

    #[test]
    fn test_deser_empty_host() {
        let mut buf: &[u8] = b"\x00\x1f\x40";
        assert!(NodeAddress::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_equality_by_value() {
        assert_eq!(NodeAddress::localhost(1), NodeAddress::new("localhost".to_string(), 1));
        assert_ne!(NodeAddress::localhost(1), NodeAddress::localhost(2));
    }
}
