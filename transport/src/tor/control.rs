//! Client for tor's line based control protocol.

use crate::error::BootstrapError;
use anyhow::{anyhow, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

const STATUS_ASYNC_EVENT: u16 = 650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAuth {
    None,
    Password(String),
    CookieFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    /// ' ' for the final line of a reply, '-' for mid lines and '+' for data lines
    pub separator: char,
    pub text: String,
}

pub fn parse_reply_line(line: &str) -> anyhow::Result<ReplyLine> {
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        bail!("malformed control reply line: {:?}", line);
    }
    let status = line[..3].parse::<u16>()
        .map_err(|_| anyhow!("malformed status in control reply line: {:?}", line))?;
    let separator = line[3..4].chars().next()
        .ok_or_else(|| anyhow!("missing separator in control reply line: {:?}", line))?;
    if !matches!(separator, ' ' | '-' | '+') {
        bail!("invalid separator {:?} in control reply line: {:?}", separator, line);
    }
    Ok(ReplyLine {
        status,
        separator,
        text: line[4..].to_string(),
    })
}

/// Extracts `PROGRESS=n` from a `status/bootstrap-phase` value
pub fn parse_bootstrap_progress(phase: &str) -> anyhow::Result<u8> {
    phase.split_whitespace()
        .find_map(|token| token.strip_prefix("PROGRESS="))
        .ok_or_else(|| anyhow!("no progress in bootstrap phase {:?}", phase))?
        .parse::<u8>()
        .map_err(|e| anyhow!("invalid progress in bootstrap phase {:?}: {}", phase, e))
}

/// The first TCP listener in a `net/listeners/socks` value
pub fn parse_socks_listener(listeners: &str) -> anyhow::Result<SocketAddr> {
    listeners.split_whitespace()
        .map(|l| l.trim_matches('"'))
        .find_map(|l| l.parse::<SocketAddr>().ok())
        .ok_or_else(|| anyhow!("no TCP socks listener in {:?}", listeners))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOnionReply {
    pub service_id: String,
    /// Only present if a new key was generated
    pub private_key: Option<String>,
}

pub fn parse_add_onion_reply(lines: &[ReplyLine]) -> anyhow::Result<AddOnionReply> {
    let mut service_id = None;
    let mut private_key = None;
    for line in lines {
        if let Some(id) = line.text.strip_prefix("ServiceID=") {
            service_id = Some(id.to_string());
        }
        else if let Some(key) = line.text.strip_prefix("PrivateKey=") {
            private_key = Some(key.to_string());
        }
    }
    Ok(AddOnionReply {
        service_id: service_id.ok_or_else(|| anyhow!("ADD_ONION reply without service id"))?,
        private_key,
    })
}

fn quote(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            result.push('\\');
        }
        result.push(c);
    }
    result.push('"');
    result
}

pub struct TorControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TorControl {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<TorControl> {
        let stream = TcpStream::connect(addr).await?;
        debug!("connected to tor control port {:?}", addr);
        Ok(TorControl::new(stream))
    }

    pub fn new(stream: TcpStream) -> TorControl {
        let (read_half, write_half) = stream.into_split();
        TorControl {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("control connection closed by tor");
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("control <- {}", line);
        Ok(line)
    }

    async fn read_reply_line(&mut self) -> anyhow::Result<ReplyLine> {
        let mut reply_line = parse_reply_line(&self.read_line().await?)?;
        if reply_line.separator == '+' {
            loop {
                let data_line = self.read_line().await?;
                if data_line == "." {
                    break;
                }
                reply_line.text.push('\n');
                reply_line.text.push_str(data_line.strip_prefix('.').unwrap_or(&data_line));
            }
        }
        Ok(reply_line)
    }

    async fn read_reply(&mut self) -> anyhow::Result<Vec<ReplyLine>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_reply_line().await?;
            if line.status == STATUS_ASYNC_EVENT {
                trace!("ignoring asynchronous event while waiting for a reply: {}", line.text);
                continue;
            }
            let is_final = line.separator == ' ';
            lines.push(line);
            if is_final {
                break;
            }
        }

        match lines.first() {
            Some(first) if (200..300).contains(&first.status) => Ok(lines),
            Some(first) => bail!("tor replied {} {}", first.status, first.text),
            None => bail!("empty reply"),
        }
    }

    pub async fn command(&mut self, command: &str) -> anyhow::Result<Vec<ReplyLine>> {
        if command.starts_with("AUTHENTICATE") {
            trace!("control -> AUTHENTICATE ***");
        }
        else {
            trace!("control -> {}", command);
        }
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.read_reply().await
    }

    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<(), BootstrapError> {
        let command = match auth {
            ControlAuth::None => "AUTHENTICATE".to_string(),
            ControlAuth::Password(password) => format!("AUTHENTICATE {}", quote(password)),
            ControlAuth::CookieFile(path) => {
                let cookie = tokio::fs::read(path).await?;
                format!("AUTHENTICATE {}", hex::encode_upper(&cookie))
            }
        };
        self.command(&command).await
            .map_err(|e| BootstrapError::Authentication(e.to_string()))?;
        Ok(())
    }

    /// Makes tor exit when this control connection is closed
    pub async fn take_ownership(&mut self) -> anyhow::Result<()> {
        self.command("TAKEOWNERSHIP").await?;
        self.command("RESETCONF __OwningControllerProcess").await?;
        Ok(())
    }

    pub async fn get_info(&mut self, key: &str) -> anyhow::Result<String> {
        let lines = self.command(&format!("GETINFO {}", key)).await?;
        let prefix = format!("{}=", key);
        lines.iter()
            .find_map(|l| l.text.strip_prefix(&prefix))
            .map(|v| v.trim_start_matches('\n').to_string())
            .ok_or_else(|| anyhow!("no value for {} in GETINFO reply", key))
    }

    pub async fn bootstrap_progress(&mut self) -> anyhow::Result<u8> {
        parse_bootstrap_progress(&self.get_info("status/bootstrap-phase").await?)
    }

    pub async fn socks_listener(&mut self) -> anyhow::Result<SocketAddr> {
        parse_socks_listener(&self.get_info("net/listeners/socks").await?)
    }

    /// Publishes an onion service forwarding `virtual_port` to `target`. Without a key, a new
    ///  ED25519 key is generated and returned.
    pub async fn add_onion(&mut self, private_key: Option<&str>, virtual_port: u16, target: SocketAddr) -> anyhow::Result<AddOnionReply> {
        let key_spec = private_key.unwrap_or("NEW:ED25519-V3");
        let lines = self.command(&format!("ADD_ONION {} Port={},{}", key_spec, virtual_port, target)).await?;
        parse_add_onion_reply(&lines)
    }

    pub async fn set_events(&mut self, events: &[&str]) -> anyhow::Result<()> {
        self.command(&format!("SETEVENTS {}", events.join(" "))).await?;
        Ok(())
    }

    /// Waits until tor reports that the descriptor of the service was uploaded to at least one
    ///  directory. Requires `SETEVENTS HS_DESC`.
    pub async fn wait_for_hs_desc_uploaded(&mut self, service_id: &str) -> anyhow::Result<()> {
        loop {
            let line = self.read_reply_line().await?;
            if line.status != STATUS_ASYNC_EVENT {
                continue;
            }
            let mut tokens = line.text.split_whitespace();
            if tokens.next() != Some("HS_DESC") {
                continue;
            }
            let action = tokens.next();
            if tokens.next() != Some(service_id) {
                continue;
            }
            match action {
                Some("UPLOADED") => return Ok(()),
                Some("FAILED") => warn!("uploading a descriptor of {} failed: {}", service_id, line.text),
                _ => {}
            }
        }
    }

    pub async fn signal_shutdown(&mut self) -> anyhow::Result<()> {
        self.command("SIGNAL SHUTDOWN").await?;
        Ok(())
    }
}
