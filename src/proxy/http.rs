//! HTTP/HTTPS front-end.
//!
//! Browsers that only speak HTTP proxies land here: `CONNECT` requests
//! become opaque tunnels, plaintext requests with an absolute URI (or an
//! origin-form target plus `Host:`) are rewritten to origin form and
//! forwarded. Either way the upstream connection is a `direct-tcpip`
//! channel, so the destination name resolves on the remote end.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;

use super::{bind_error, relay, FrontendContext, FrontendHandle, ProxyError};

/// Upper bound on the request head (request line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

const RESP_OK: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESP_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Start the HTTP proxy listener on `127.0.0.1:port`.
pub async fn spawn(ctx: FrontendContext, port: u16) -> Result<FrontendHandle, ProxyError> {
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| bind_error(&addr, &e))?;
    let bound_addr = listener.local_addr()?;

    info!("HTTP proxy listening on {}", bound_addr);

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let mut disconnect_rx = ctx.transport.subscribe_disconnect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("HTTP proxy stopped by request");
                    break;
                }
                _ = disconnect_rx.recv() => {
                    info!("HTTP proxy stopped: transport gone");
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
                            handle_client(ctx, stream).await;
                        });
                    }
                    Err(e) => {
                        error!("HTTP accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    });

    Ok(FrontendHandle::new(bound_addr, stop_tx))
}

async fn handle_client(ctx: FrontendContext, mut stream: TcpStream) {
    let (buf, head_len) = match read_head(&mut stream).await {
        Ok(Some(head)) => head,
        Ok(None) => {
            // Head exceeded the cap.
            let _ = stream.write_all(RESP_BAD_REQUEST).await;
            return;
        }
        Err(e) => {
            debug!("HTTP client read error: {}", e);
            return;
        }
    };

    // Bytes past the head belong to the request body (or, for CONNECT,
    // to the tunnel) and must reach the upstream first.
    let leftover = buf[head_len..].to_vec();
    let head = match std::str::from_utf8(&buf[..head_len]) {
        Ok(head) => head,
        Err(_) => {
            let _ = stream.write_all(RESP_BAD_REQUEST).await;
            return;
        }
    };

    match parse_head(head) {
        Some(ParsedHead::Connect(endpoint)) => {
            tunnel_connect(ctx, stream, endpoint, leftover).await;
        }
        Some(ParsedHead::Plain { endpoint, rewritten }) => {
            forward_plain(ctx, stream, endpoint, rewritten, leftover).await;
        }
        None => {
            debug!("malformed HTTP proxy request");
            let _ = stream.write_all(RESP_BAD_REQUEST).await;
        }
    }
}

async fn tunnel_connect(
    ctx: FrontendContext,
    mut stream: TcpStream,
    endpoint: Endpoint,
    leftover: Vec<u8>,
) {
    debug!("CONNECT {}", endpoint);
    let channel = match ctx.transport.open(&endpoint).await {
        Ok(channel) => channel,
        Err(e) => {
            info!("upstream open failed for {}: {}", endpoint, e);
            let _ = stream.write_all(RESP_BAD_GATEWAY).await;
            return;
        }
    };

    if stream.write_all(RESP_OK).await.is_err() {
        return;
    }

    let mut upstream = channel.into_stream();
    if !leftover.is_empty() {
        if upstream.write_all(&leftover).await.is_err() {
            return;
        }
        ctx.counters.add_up(leftover.len() as u64);
    }

    let (up, down) = relay::run(stream, upstream, ctx.idle_timeout, &ctx.counters).await;
    debug!("CONNECT {} done: {} up / {} down", endpoint, up, down);
}

async fn forward_plain(
    ctx: FrontendContext,
    mut stream: TcpStream,
    endpoint: Endpoint,
    rewritten: Vec<u8>,
    leftover: Vec<u8>,
) {
    debug!("plain HTTP -> {}", endpoint);
    let channel = match ctx.transport.open(&endpoint).await {
        Ok(channel) => channel,
        Err(e) => {
            info!("upstream open failed for {}: {}", endpoint, e);
            let _ = stream.write_all(RESP_BAD_GATEWAY).await;
            return;
        }
    };

    let mut upstream = channel.into_stream();
    if upstream.write_all(&rewritten).await.is_err() {
        return;
    }
    ctx.counters.add_up(rewritten.len() as u64);
    if !leftover.is_empty() {
        if upstream.write_all(&leftover).await.is_err() {
            return;
        }
        ctx.counters.add_up(leftover.len() as u64);
    }

    let (up, down) = relay::run(stream, upstream, ctx.idle_timeout, &ctx.counters).await;
    debug!("plain HTTP {} done: {} up / {} down", endpoint, up, down);
}

/// Read until the blank line ending the head. Returns the buffer and the
/// index just past `\r\n\r\n`, or `None` when the head exceeds the cap.
async fn read_head<S>(stream: &mut S) -> std::io::Result<Option<(Vec<u8>, usize)>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        // Re-scan a little before the old tail in case the terminator
        // straddles two reads.
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_terminator(&buf[scan_from..]) {
            return Ok(Some((buf, scan_from + pos + 4)));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Ok(None);
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

enum ParsedHead {
    Connect(Endpoint),
    Plain {
        endpoint: Endpoint,
        rewritten: Vec<u8>,
    },
}

fn parse_head(head: &str) -> Option<ParsedHead> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !is_token(method) || !version.starts_with("HTTP/") {
        return None;
    }

    let headers: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();

    if method.eq_ignore_ascii_case("CONNECT") {
        let endpoint = parse_host_port(target, 443)?;
        return Some(ParsedHead::Connect(endpoint));
    }

    let (endpoint, origin_target) = if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        (parse_host_port(authority, 80)?, path.to_string())
    } else if target.starts_with('/') {
        // Origin-form request; the destination comes from Host.
        let host = headers.iter().find_map(|l| header_value(l, "host"))?;
        (parse_host_port(host, 80)?, target.to_string())
    } else {
        return None;
    };

    let rewritten = rewrite_head(method, &origin_target, version, &headers);
    Some(ParsedHead::Plain {
        endpoint,
        rewritten,
    })
}

/// Origin-form request line plus filtered headers. Hop-by-hop proxy
/// headers are dropped and `Connection: close` is forced so the upstream
/// connection's lifetime matches the relay's.
fn rewrite_head(method: &str, target: &str, version: &str, headers: &[&str]) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push_str(method);
    out.push(' ');
    out.push_str(target);
    out.push(' ');
    out.push_str(version);
    out.push_str("\r\n");

    for line in headers {
        let name = line.split(':').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("proxy-authorization")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (n, v) = line.split_once(':')?;
    if n.trim().eq_ignore_ascii_case(name) {
        Some(v.trim())
    } else {
        None
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`.
fn parse_host_port(authority: &str, default_port: u16) -> Option<Endpoint> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        if host.is_empty() {
            return None;
        }
        let port = match &rest[end + 1..] {
            "" => default_port,
            tail => tail.strip_prefix(':')?.parse().ok()?,
        };
        return Some(Endpoint::new(host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Some(Endpoint::new(host, port.parse::<u16>().ok()?))
        }
        Some(_) => None,
        None => Some(Endpoint::new(authority, default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewritten_str(head: &str) -> (Endpoint, String) {
        match parse_head(head) {
            Some(ParsedHead::Plain {
                endpoint,
                rewritten,
            }) => (endpoint, String::from_utf8(rewritten).unwrap()),
            other => panic!("expected plain request, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn host_port_forms() {
        assert_eq!(
            parse_host_port("example.net", 80),
            Some(Endpoint::new("example.net", 80))
        );
        assert_eq!(
            parse_host_port("example.net:8080", 80),
            Some(Endpoint::new("example.net", 8080))
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]", 443),
            Some(Endpoint::new("2001:db8::1", 443))
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]:8443", 443),
            Some(Endpoint::new("2001:db8::1", 8443))
        );
        assert_eq!(parse_host_port("", 80), None);
        assert_eq!(parse_host_port("example.net:x", 80), None);
    }

    #[test]
    fn connect_target_defaults_to_443() {
        match parse_head("CONNECT example.net:443 HTTP/1.1\r\nHost: example.net:443\r\n\r\n") {
            Some(ParsedHead::Connect(ep)) => assert_eq!(ep, Endpoint::new("example.net", 443)),
            _ => panic!("expected CONNECT"),
        }
        match parse_head("CONNECT example.net HTTP/1.1\r\n\r\n") {
            Some(ParsedHead::Connect(ep)) => assert_eq!(ep.port, 443),
            _ => panic!("expected CONNECT"),
        }
    }

    #[test]
    fn absolute_uri_is_rewritten_to_origin_form() {
        let (endpoint, head) = rewritten_str(
            "GET http://example.net/path?q=1 HTTP/1.1\r\n\
             Host: example.net\r\n\
             Proxy-Connection: keep-alive\r\n\
             Accept: */*\r\n\r\n",
        );
        assert_eq!(endpoint, Endpoint::new("example.net", 80));
        assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.net\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn bare_authority_uri_gets_root_path() {
        let (endpoint, head) = rewritten_str(
            "GET http://example.net:8080 HTTP/1.1\r\nHost: example.net:8080\r\n\r\n",
        );
        assert_eq!(endpoint, Endpoint::new("example.net", 8080));
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn proxy_authorization_is_stripped() {
        let (_, head) = rewritten_str(
            "GET http://example.net/ HTTP/1.1\r\n\
             Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\
             Host: example.net\r\n\r\n",
        );
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
    }

    #[test]
    fn connection_header_is_replaced_not_duplicated() {
        let (_, head) = rewritten_str(
            "GET http://example.net/ HTTP/1.1\r\n\
             Connection: keep-alive\r\n\
             Host: example.net\r\n\r\n",
        );
        assert_eq!(head.matches("Connection:").count(), 1);
        assert!(head.contains("Connection: close"));
    }

    #[test]
    fn origin_form_uses_host_header() {
        let (endpoint, head) =
            rewritten_str("POST /submit HTTP/1.1\r\nHost: example.net:8080\r\n\r\n");
        assert_eq!(endpoint, Endpoint::new("example.net", 8080));
        assert!(head.starts_with("POST /submit HTTP/1.1\r\n"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_head("NOT A REQUEST\r\n\r\n").is_none());
        assert!(parse_head("GET\r\n\r\n").is_none());
        assert!(parse_head("GET ftp://example.net/ HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_head("GET /path HTTP/1.1\r\n\r\n").is_none()); // no Host
    }

    #[tokio::test]
    async fn read_head_splits_body_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\nBODY")
            .await
            .unwrap();

        let (buf, head_len) = read_head(&mut server).await.unwrap().unwrap();
        assert_eq!(&buf[head_len..], b"BODY");
        assert!(std::str::from_utf8(&buf[..head_len])
            .unwrap()
            .ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_head_enforces_cap() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            let filler = vec![b'a'; MAX_HEAD_BYTES + 4096];
            let _ = client.write_all(b"GET / HTTP/1.1\r\nX-Fill: ").await;
            let _ = client.write_all(&filler).await;
        });

        assert!(read_head(&mut server).await.unwrap().is_none());
        writer.abort();
    }
}
