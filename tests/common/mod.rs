//! Test utilities shared by the integration tests
//!
//! Raw SOCKS5 client helpers that speak the wire format byte by byte, plus a
//! couple of tiny upstream servers to point the proxy at.

#![allow(dead_code)]

use littlesocks::{AddressSpec, Config, Socks5Server};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How long a test waits for something that should not happen
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Start a proxy with `config` on an ephemeral loopback port
pub async fn spawn_proxy(config: Config) -> SocketAddr {
    let mut server = Socks5Server::new(Config {
        listen_addr: "127.0.0.1:0".to_string(),
        ..config
    });
    let addr = server.bind().await.unwrap();
    tokio::spawn(server.run());
    addr
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Echo server that serves connections until the test ends
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    addr
}

/// Open a connection and complete the no-auth greeting
pub async fn connect_no_auth(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    stream
}

/// Write a request for `command` to `target`
pub async fn send_request(stream: &mut TcpStream, command: u8, target: &AddressSpec) {
    let mut request = vec![0x05, command, 0x00];
    target.encode_into(&mut request);
    stream.write_all(&request).await.unwrap();
}

/// Read one reply, returning its code byte and bound address
pub async fn read_reply(stream: &mut TcpStream) -> (u8, AddressSpec) {
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let bound = AddressSpec::read_from(stream).await.unwrap();
    (head[1], bound)
}

/// Assert the proxy closes the connection without sending anything more
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("proxy did not close the connection");

    // Closing with unread request bytes pending makes the kernel send a reset
    if let Err(e) = read {
        assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
    }
    assert!(rest.is_empty(), "unexpected bytes after close: {rest:?}");
}
