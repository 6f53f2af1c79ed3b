//! Opening handshake on a freshly dialed connection.
//!
//! Sequence, from the dialing side:
//!
//! 1. Send our version, receive the peer's version. Peers advertising a
//!    protocol version newer than ours are rejected.
//! 2. If the peer's version is >= 70016, exchange wtxidrelay (BIP 339).
//!    One interleaved sendaddrv2 is tolerated here, since feature
//!    negotiation messages may arrive in either order before verack.
//! 3. Exchange verack.
//!
//! Any wrong command, foreign magic, or elapsed deadline aborts the
//! connection.

use crate::codec::{encode_message, read_message, Message};
use crate::error::{NetworkError, NetworkResult};
use crate::message::{Command, NetworkAddress, Payload, Services, VersionPayload};
use crate::{MAINNET_MAGIC, WTXID_RELAY_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Parameters of the opening exchange.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Protocol version we advertise and accept up to.
    pub protocol_version: i32,
    /// Services we advertise.
    pub local_services: Services,
    /// User agent we advertise.
    pub user_agent: String,
    /// Bound on the dial and on each subsequent handshake read.
    pub dial_timeout: Duration,
}

/// Dial `addr` and drive the opening exchange.
///
/// On success returns the live connection and the peer's version payload.
pub async fn perform_handshake(
    addr: SocketAddr,
    config: &HandshakeConfig,
    remote_services: Services,
) -> NetworkResult<(TcpStream, VersionPayload)> {
    debug!(peer = %addr, "performing handshake");

    let mut stream = timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::HandshakeTimeout("dial"))??;

    let version = exchange_version(&mut stream, config, remote_services).await?;
    if version.version >= WTXID_RELAY_VERSION {
        exchange_wtxidrelay(&mut stream, config).await?;
    }
    exchange_verack(&mut stream, config).await?;

    debug!(peer = %addr, version = version.version, agent = %version.user_agent, "handshake complete");
    Ok((stream, version))
}

async fn exchange_version(
    stream: &mut TcpStream,
    config: &HandshakeConfig,
    remote_services: Services,
) -> NetworkResult<VersionPayload> {
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    let version = VersionPayload {
        version: config.protocol_version,
        services: config.local_services,
        timestamp,
        addr_recv: NetworkAddress::new(remote_services, remote_addr.ip(), remote_addr.port()),
        addr_from: NetworkAddress::new(config.local_services, local_addr.ip(), local_addr.port()),
        nonce: rand::random(),
        user_agent: config.user_agent.clone(),
        start_height: 0,
        relay: false,
    };
    stream
        .write_all(&encode_message(&Payload::Version(version)))
        .await?;

    let message = read_step(stream, config, "version").await?;
    let received = match message.payload {
        Payload::Version(payload) => payload,
        other => {
            return Err(NetworkError::InvalidCommand {
                expected: Command::Version,
                got: other.command(),
            })
        }
    };
    if received.version > config.protocol_version {
        return Err(NetworkError::VersionNotSupported(received.version));
    }

    Ok(received)
}

async fn exchange_wtxidrelay(stream: &mut TcpStream, config: &HandshakeConfig) -> NetworkResult<()> {
    stream
        .write_all(&encode_message(&Payload::WtxidRelay))
        .await?;

    let mut message = read_step(stream, config, "wtxidrelay").await?;
    if message.command() == Command::SendAddrV2 {
        message = read_step(stream, config, "wtxidrelay").await?;
    }
    expect_command(&message, Command::WtxidRelay)
}

async fn exchange_verack(stream: &mut TcpStream, config: &HandshakeConfig) -> NetworkResult<()> {
    stream.write_all(&encode_message(&Payload::Verack)).await?;

    let message = read_step(stream, config, "verack").await?;
    expect_command(&message, Command::Verack)
}

/// Read one message within the configured deadline and require our magic.
async fn read_step(
    stream: &mut TcpStream,
    config: &HandshakeConfig,
    step: &'static str,
) -> NetworkResult<Message> {
    let message = timeout(config.dial_timeout, read_message(stream))
        .await
        .map_err(|_| NetworkError::HandshakeTimeout(step))??;
    if message.magic != MAINNET_MAGIC {
        return Err(NetworkError::InvalidMagic(message.magic));
    }
    Ok(message)
}

fn expect_command(message: &Message, expected: Command) -> NetworkResult<()> {
    if message.command() != expected {
        return Err(NetworkError::InvalidCommand {
            expected,
            got: message.command(),
        });
    }
    Ok(())
}
