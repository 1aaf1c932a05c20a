//! SOCKS5 front-end.
//!
//! Speaks the RFC 1928 subset this system supports: NO-AUTH only,
//! CONNECT only, all three address types. A DOMAINNAME is forwarded to
//! the SSH server byte-for-byte, so name resolution happens on the
//! remote end and never leaks into local DNS.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;

use super::{bind_error, relay, FrontendContext, FrontendHandle, ProxyError};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CONN_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// What the client asked for.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Connect(Endpoint),
    /// Any command other than CONNECT; carries the command byte.
    Unsupported(u8),
}

#[derive(Debug, Error)]
enum HandshakeError {
    /// The method list did not include NO-AUTH; `05 FF` was sent.
    #[error("client offers no acceptable auth method")]
    NoAcceptableMethod,

    /// Anything that breaks the wire grammar. The connection is closed
    /// without a reply.
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Start the SOCKS5 listener on `127.0.0.1:port`.
pub async fn spawn(ctx: FrontendContext, port: u16) -> Result<FrontendHandle, ProxyError> {
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| bind_error(&addr, &e))?;
    let bound_addr = listener.local_addr()?;

    info!("SOCKS5 proxy listening on {}", bound_addr);

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let mut disconnect_rx = ctx.transport.subscribe_disconnect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("SOCKS5 proxy stopped by request");
                    break;
                }
                _ = disconnect_rx.recv() => {
                    info!("SOCKS5 proxy stopped: transport gone");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if ctx.at_capacity() {
                            warn!("relay cap reached, refusing {}", peer_addr);
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("failed to set TCP_NODELAY: {}", e);
                        }
                        let guard = ctx.counters.admit();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            handle_client(ctx, stream, peer_addr.to_string()).await;
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    });

    Ok(FrontendHandle::new(bound_addr, stop_tx))
}

async fn handle_client(ctx: FrontendContext, mut stream: TcpStream, peer: String) {
    match handshake(&mut stream).await {
        Ok(Request::Connect(endpoint)) => {
            debug!("SOCKS5 {} -> {}", peer, endpoint);
            match ctx.transport.open(&endpoint).await {
                Ok(channel) => {
                    if send_reply(&mut stream, REP_SUCCESS).await.is_err() {
                        return;
                    }
                    let (up, down) = relay::run(
                        stream,
                        channel.into_stream(),
                        ctx.idle_timeout,
                        &ctx.counters,
                    )
                    .await;
                    debug!("SOCKS5 {} done: {} up / {} down", endpoint, up, down);
                }
                Err(e) => {
                    info!("upstream open failed for {}: {}", endpoint, e);
                    let _ = send_reply(&mut stream, REP_CONN_REFUSED).await;
                }
            }
        }
        Ok(Request::Unsupported(cmd)) => {
            debug!("SOCKS5 {}: unsupported command {:#04x}", peer, cmd);
            let _ = send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await;
        }
        Err(HandshakeError::NoAcceptableMethod) => {
            debug!("SOCKS5 {}: no acceptable auth method", peer);
        }
        Err(e) => {
            // Protocol garbage from the client; close without a reply.
            debug!("SOCKS5 {}: {}", peer, e);
        }
    }
}

/// Run the greeting and request phases. Generic over the stream so the
/// wire grammar is testable against in-memory pipes.
async fn handshake<S>(stream: &mut S) -> Result<Request, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(HandshakeError::Malformed("bad version in greeting"));
    }
    let nmethods = head[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    if !methods[..nmethods].contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(HandshakeError::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != VERSION {
        return Err(HandshakeError::Malformed("bad version in request"));
    }
    if req[1] != CMD_CONNECT {
        return Ok(Request::Unsupported(req[1]));
    }

    let host = match req[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            if len == 0 {
                return Err(HandshakeError::Malformed("empty domain name"));
            }
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            // Forwarded as-is; never resolved here.
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => return Err(HandshakeError::Malformed("unsupported address type")),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(Request::Connect(Endpoint::new(host, port)))
}

/// VER REP RSV ATYP BND.ADDR BND.PORT with the bound address zeroed.
async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Drive `handshake` with a scripted client side.
    async fn run_handshake(script: &[u8]) -> (Result<Request, HandshakeError>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(script).await.unwrap();
        client.shutdown().await.unwrap();

        let result = handshake(&mut server).await;
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn connect_to_domain() {
        let mut script = vec![0x05, 0x01, 0x00]; // greeting: one method, NO-AUTH
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]); // request
        script.push(7);
        script.extend_from_slice(b"example");
        script.extend_from_slice(&80u16.to_be_bytes());

        let (result, replies) = run_handshake(&script).await;
        assert_eq!(
            result.unwrap(),
            Request::Connect(Endpoint::new("example", 80))
        );
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn connect_to_ipv4_literal() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1]);
        script.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = run_handshake(&script).await;
        assert_eq!(
            result.unwrap(),
            Request::Connect(Endpoint::new("10.0.0.1", 443))
        );
    }

    #[tokio::test]
    async fn connect_to_ipv6_literal() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        script.extend_from_slice(&addr.octets());
        script.extend_from_slice(&8080u16.to_be_bytes());

        let (result, _) = run_handshake(&script).await;
        assert_eq!(
            result.unwrap(),
            Request::Connect(Endpoint::new("2001:db8::1", 8080))
        );
    }

    #[tokio::test]
    async fn wrong_version_writes_nothing() {
        let (result, replies) = run_handshake(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn no_acceptable_method_gets_ff() {
        // Client offers only GSSAPI (0x01).
        let (result, replies) = run_handshake(&[0x05, 0x01, 0x01]).await;
        assert!(matches!(result, Err(HandshakeError::NoAcceptableMethod)));
        assert_eq!(replies, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn bind_command_is_unsupported() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1]);
        script.extend_from_slice(&80u16.to_be_bytes());

        let (result, _) = run_handshake(&script).await;
        assert_eq!(result.unwrap(), Request::Unsupported(0x02));
    }

    #[tokio::test]
    async fn udp_associate_is_unsupported() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1]);
        script.extend_from_slice(&80u16.to_be_bytes());

        let (result, _) = run_handshake(&script).await;
        assert_eq!(result.unwrap(), Request::Unsupported(0x03));
    }

    #[tokio::test]
    async fn invalid_atyp_closes_without_reply() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x05, 1, 2]);

        let (result, replies) = run_handshake(&script).await;
        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
        // Only the method reply went out, nothing after the bad request.
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn empty_domain_is_malformed() {
        let mut script = vec![0x05, 0x01, 0x00];
        script.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x00]);
        script.extend_from_slice(&80u16.to_be_bytes());

        let (result, _) = run_handshake(&script).await;
        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    #[tokio::test]
    async fn truncated_request_is_an_error() {
        let (result, _) = run_handshake(&[0x05, 0x01, 0x00, 0x05, 0x01]).await;
        assert!(matches!(result, Err(HandshakeError::Io(_))));
    }
}
