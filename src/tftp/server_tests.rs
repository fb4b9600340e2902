//! End-to-end tests for the TFTP server using a minimal in-test client.

use super::*;
use crate::tftp::protocol::{data_packet, decode_error, error_packet, options_ack_packet};

use std::collections::HashMap;

/// Handler serving fixed byte blobs by name.
struct FixedHandler {
    files: HashMap<String, Vec<u8>>,
}

impl FixedHandler {
    fn new(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, content)| ((*name).to_string(), content.to_vec()))
                .collect(),
        }
    }
}

impl TftpHandler for FixedHandler {
    fn can_handle(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    fn handle(
        &self,
        filename: &str,
        _client_address: SocketAddr,
        _server_address: SocketAddr,
    ) -> Result<TftpContent, HandlerError> {
        self.files
            .get(filename)
            .map(|content| TftpContent::Bytes(content.clone()))
            .ok_or(HandlerError::NotFound)
    }
}

/// Handler that always denies access.
struct DenyingHandler;

impl TftpHandler for DenyingHandler {
    fn can_handle(&self, _filename: &str) -> bool {
        true
    }

    fn handle(
        &self,
        _filename: &str,
        _client_address: SocketAddr,
        _server_address: SocketAddr,
    ) -> Result<TftpContent, HandlerError> {
        Err(HandlerError::AccessDenied)
    }
}

/// Starts a server on an ephemeral port and returns its address plus the
/// shutdown sender.
async fn start_server(
    handlers: Vec<Arc<dyn TftpHandler>>,
) -> (SocketAddr, watch::Sender<bool>) {
    let config = TftpServerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        bind_port: 0,
        default_timeout: 1,
        max_retries: 1,
        ..TftpServerConfig::default()
    };
    let bound = TftpServer::new(handlers, config).bind().await.unwrap();
    let address = bound.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(bound.run(shutdown_rx));
    (address, shutdown_tx)
}

/// Minimal test client for a single read request.
struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
    transfer_peer: Option<SocketAddr>,
}

impl TestClient {
    async fn new(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            transfer_peer: None,
        }
    }

    async fn send_rrq(&self, filename: &str, mode: &str, options: &[(&str, &str)]) {
        let mut packet = vec![0, 1];
        packet.extend_from_slice(filename.as_bytes());
        packet.push(0);
        packet.extend_from_slice(mode.as_bytes());
        packet.push(0);
        for (name, value) in options {
            packet.extend_from_slice(name.as_bytes());
            packet.push(0);
            packet.extend_from_slice(value.as_bytes());
            packet.push(0);
        }
        self.socket.send_to(&packet, self.server).await.unwrap();
    }

    /// Receives one packet from the transfer socket and records its peer.
    async fn receive(&mut self) -> Vec<u8> {
        let mut buffer = vec![0_u8; 65600];
        let (length, from) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for a server packet")
            .unwrap();
        self.transfer_peer = Some(from);
        buffer.truncate(length);
        buffer
    }

    async fn send_ack(&self, block: u16) {
        let peer = self.transfer_peer.expect("no transfer peer yet");
        let mut packet = vec![0, 4];
        packet.extend_from_slice(&block.to_be_bytes());
        self.socket.send_to(&packet, peer).await.unwrap();
    }

    async fn send_error(&self, code: u16, message: &str) {
        let peer = self.transfer_peer.expect("no transfer peer yet");
        let mut packet = vec![0, 5];
        packet.extend_from_slice(&code.to_be_bytes());
        packet.extend_from_slice(message.as_bytes());
        packet.push(0);
        self.socket.send_to(&packet, peer).await.unwrap();
    }

    /// Runs a full download without options, returning the file bytes and
    /// the observed block numbers.
    async fn download(&mut self, filename: &str) -> (Vec<u8>, Vec<u16>) {
        self.send_rrq(filename, "octet", &[]).await;
        let mut content = Vec::new();
        let mut blocks = Vec::new();
        loop {
            let packet = self.receive().await;
            assert_eq!(&packet[..2], &[0, 3], "expected a DATA packet");
            let block = u16::from_be_bytes([packet[2], packet[3]]);
            blocks.push(block);
            content.extend_from_slice(&packet[4..]);
            self.send_ack(block).await;
            if packet.len() - 4 < 512 {
                return (content, blocks);
            }
        }
    }
}

#[tokio::test]
async fn short_file_arrives_in_one_block() {
    let handler = FixedHandler::new(&[("boot.cfg", b"hello netboot")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    let (content, blocks) = client.download("boot.cfg").await;
    assert_eq!(content, b"hello netboot".to_vec());
    assert_eq!(blocks, vec![1]);
}

#[tokio::test]
async fn block_count_matches_the_file_length() {
    // 1200 bytes → blocks of 512, 512, 176.
    let content: Vec<u8> = (0..1200_u32).map(|i| (i % 251) as u8).collect();
    let handler = FixedHandler::new(&[("image", &content)]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    let (received, blocks) = client.download("image").await;
    assert_eq!(received, content);
    assert_eq!(blocks, vec![1, 2, 3]);
}

#[tokio::test]
async fn exact_multiple_of_block_size_ends_with_an_empty_block() {
    let content = vec![7_u8; 1024];
    let handler = FixedHandler::new(&[("image", &content)]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    let (received, blocks) = client.download("image").await;
    assert_eq!(received, content);
    // Two full blocks plus the empty terminator.
    assert_eq!(blocks, vec![1, 2, 3]);
}

#[tokio::test]
async fn blksize_option_is_negotiated() {
    let content = vec![1_u8; 2000];
    let handler = FixedHandler::new(&[("image", &content)]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client
        .send_rrq("image", "octet", &[("blksize", "1024"), ("tsize", "0")])
        .await;

    let oack = client.receive().await;
    assert_eq!(&oack[..2], &[0, 6], "expected an OACK packet");
    let expected = options_ack_packet(&[
        ("blksize".to_string(), "1024".to_string()),
        ("tsize".to_string(), "2000".to_string()),
    ]);
    assert_eq!(oack, expected);
    client.send_ack(0).await;

    let first = client.receive().await;
    assert_eq!(first.len(), 4 + 1024);
    client.send_ack(1).await;
    let second = client.receive().await;
    assert_eq!(second.len(), 4 + (2000 - 1024));
    client.send_ack(2).await;
}

#[tokio::test]
async fn oversized_blksize_is_clamped() {
    let handler = FixedHandler::new(&[("f", b"x")]);
    let config = TftpServerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        bind_port: 0,
        max_block_size: 512,
        ..TftpServerConfig::default()
    };
    let bound = TftpServer::new(vec![Arc::new(handler)], config)
        .bind()
        .await
        .unwrap();
    let address = bound.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(bound.run(shutdown_rx));

    let mut client = TestClient::new(address).await;
    client.send_rrq("f", "octet", &[("blksize", "65464")]).await;
    let oack = client.receive().await;
    assert_eq!(
        oack,
        options_ack_packet(&[("blksize".to_string(), "512".to_string())])
    );
    client.send_ack(0).await;
    let data = client.receive().await;
    assert_eq!(&data[4..], b"x");
    client.send_ack(1).await;
}

#[tokio::test]
async fn write_requests_are_rejected_with_access_violation() {
    let handler = FixedHandler::new(&[]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"\x00\x02file\x00octet\x00", server)
        .await
        .unwrap();
    let mut buffer = vec![0_u8; 1024];
    let (length, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    let (code, _) = decode_error(&buffer[..length]);
    assert_eq!(code, ErrorCode::AccessViolation);
}

#[tokio::test]
async fn unclaimed_files_get_file_not_found() {
    let handler = FixedHandler::new(&[("exists", b"x")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("missing", "octet", &[]).await;
    let packet = client.receive().await;
    let (code, _) = decode_error(&packet);
    assert_eq!(code, ErrorCode::FileNotFound);
}

#[tokio::test]
async fn denied_handlers_get_access_violation() {
    let (server, _shutdown) = start_server(vec![Arc::new(DenyingHandler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("anything", "octet", &[]).await;
    let packet = client.receive().await;
    let (code, _) = decode_error(&packet);
    assert_eq!(code, ErrorCode::AccessViolation);
}

#[tokio::test]
async fn mail_mode_is_rejected() {
    let handler = FixedHandler::new(&[("f", b"x")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("f", "mail", &[]).await;
    let packet = client.receive().await;
    let (code, _) = decode_error(&packet);
    assert_eq!(code, ErrorCode::IllegalOperation);
}

#[tokio::test]
async fn netascii_mode_expands_line_breaks() {
    let handler = FixedHandler::new(&[("text", b"a\nb\r\nc\rd")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("text", "netascii", &[]).await;
    let packet = client.receive().await;
    assert_eq!(&packet[4..], b"a\r\nb\r\nc\r\nd");
    client.send_ack(1).await;
}

#[tokio::test]
async fn client_error_with_unknown_code_aborts_without_crashing_the_server() {
    let handler = FixedHandler::new(&[("big", &[9_u8; 2048]), ("after", b"ok")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    // Abort one transfer mid-flight with an out-of-range error code.
    let mut client = TestClient::new(server).await;
    client.send_rrq("big", "octet", &[]).await;
    let packet = client.receive().await;
    assert_eq!(&packet[..2], &[0, 3]);
    client.send_error(0xffff, "boom").await;

    // The server keeps serving new transfers.
    let mut second = TestClient::new(server).await;
    let (content, _) = second.download("after").await;
    assert_eq!(content, b"ok".to_vec());
}

#[tokio::test]
async fn stray_packets_on_the_transfer_socket_get_error_5() {
    let handler = FixedHandler::new(&[("big", &[1_u8; 4096])]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("big", "octet", &[]).await;
    let first = client.receive().await;
    assert_eq!(&first[..2], &[0, 3]);
    let transfer_peer = client.transfer_peer.unwrap();

    // A different socket barges in on the transfer.
    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger
        .send_to(&data_packet(1, b""), transfer_peer)
        .await
        .unwrap();
    let mut buffer = vec![0_u8; 1024];
    let (length, _) = timeout(Duration::from_secs(5), stranger.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    let (code, _) = decode_error(&buffer[..length]);
    assert_eq!(code, ErrorCode::UnknownTransferId);

    // The real transfer is unaffected.
    client.send_ack(1).await;
    let second = client.receive().await;
    assert_eq!(&second[..2], &[0, 3]);
    assert_eq!(u16::from_be_bytes([second[2], second[3]]), 2);
}

#[tokio::test]
async fn lost_ack_triggers_a_retransmission() {
    let handler = FixedHandler::new(&[("f", b"payload")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("f", "octet", &[]).await;
    let first = client.receive().await;
    // Do not acknowledge; the server must resend the same block.
    let second = client.receive().await;
    assert_eq!(first, second);
    client.send_ack(1).await;
}

#[tokio::test]
async fn benign_abort_during_negotiation() {
    let handler = FixedHandler::new(&[("f", b"x"), ("other", b"y")]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("f", "octet", &[("blksize", "1024")]).await;
    let oack = client.receive().await;
    assert_eq!(&oack[..2], &[0, 6]);
    // Error 8 during negotiation is a clean decline, not a failure.
    client.send_error(8, "options declined").await;

    let mut second = TestClient::new(server).await;
    let (content, _) = second.download("other").await;
    assert_eq!(content, b"y".to_vec());
}

#[tokio::test]
async fn block_numbers_wrap_after_65535() {
    // 8-byte blocks over a payload long enough to pass block 65535.
    let blocks: usize = 65537;
    let content = vec![3_u8; blocks * 8];
    let handler = FixedHandler::new(&[("huge", &content)]);
    let (server, _shutdown) = start_server(vec![Arc::new(handler)]).await;

    let mut client = TestClient::new(server).await;
    client.send_rrq("huge", "octet", &[("blksize", "8")]).await;
    let oack = client.receive().await;
    assert_eq!(&oack[..2], &[0, 6]);
    client.send_ack(0).await;

    let mut expected_block: u16 = 1;
    let mut seen_wrap = false;
    loop {
        let packet = client.receive().await;
        assert_eq!(&packet[..2], &[0, 3]);
        let block = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(block, expected_block);
        client.send_ack(block).await;
        if packet.len() - 4 < 8 {
            break;
        }
        if expected_block == 65535 {
            expected_block = 0;
            seen_wrap = true;
        } else {
            expected_block += 1;
        }
    }
    assert!(seen_wrap, "the transfer never wrapped the block counter");
}

#[tokio::test]
async fn error_packet_helper_matches_protocol_layout() {
    // Guard against the helper and the decoder drifting apart.
    let packet = error_packet(ErrorCode::NotDefined, "x");
    assert_eq!(packet, vec![0, 5, 0, 0, b'x', 0]);
}
