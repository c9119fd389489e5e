// This module contains the server-side transfer session.
//
// A session is created for every valid read request the dispatcher receives. It works in roughly
// the following stages:
//
// 1. Bind a fresh socket for the transfer and connect it to the client, so that only the
//    client's datagrams reach it. The connection carries no handshake; it is purely a filter.
// 2. Alternate between work and wait cycles: send the current data block, then wait a bounded
//    time for the client to answer. What happens after each answer (or lack of one) is decided
//    by the ReadProcessor.
// 3. Stop once the final block is acknowledged, the client sends an error, the retry budget for
//    a block runs out, the socket fails, or the server shuts down. The socket is owned by the
//    session and released on every one of those paths.

use crate::config::TransferSettings;
use crate::processor::{Failure, Outcome, ReadProcessor, ResultAction, SessionEvent};
use crate::shutdown::Shutdown;
use crate::tftp::{self, ErrorCode, ErrorPacket, Reply, SocketError, TftpSocket};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// How many random ports to try from the configured range before giving up.
const BIND_ATTEMPTS: usize = 16;

/// One client's download.
pub struct TransferSession {
    /// Socket connected to the client.
    sock: TftpSocket,

    /// The client's address.
    dst: SocketAddr,

    /// The packet processor.
    processor: ReadProcessor,

    /// How long to wait for each reply.
    timeout: Duration,
}

/// Binds the socket a transfer runs on, on the unspecified address of the client's family.
///
/// Without a port range the OS picks the port. With one, random ports from it are tried until one
/// binds.
fn bind_transfer_socket(
    dst: SocketAddr,
    ports: Option<&RangeInclusive<u16>>,
) -> Result<TftpSocket, SocketError> {
    let ip = match dst.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let Some(ports) = ports else {
        return TftpSocket::bind((ip, 0).into());
    };

    let mut rng = rand::thread_rng();
    let mut attempt = 1;
    loop {
        match TftpSocket::bind((ip, rng.gen_range(ports.clone())).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) if attempt < BIND_ATTEMPTS => {
                log::warn!("Couldn't bind transfer socket: {e}");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl TransferSession {
    pub fn new(
        request: &tftp::ReadRequest,
        dst: SocketAddr,
        settings: &TransferSettings,
    ) -> Result<TransferSession, SocketError> {
        let sock = bind_transfer_socket(dst, settings.transfer_ports.as_ref())?;
        sock.connect(dst)?;

        let session = TransferSession {
            sock,
            dst,
            processor: ReadProcessor::new(settings.payload.clone(), settings.retries),
            timeout: settings.timeout,
        };
        log::debug!(
            "[{dst}] serving '{}' from {}",
            request.filename,
            session.local_addr()?
        );
        Ok(session)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Does the work of sending blocks and receiving replies until the transfer ends.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Outcome {
        let mut buf = [0; tftp::DATAGRAM_SIZE];
        let mut action = self.processor.start();

        loop {
            let data = match action {
                ResultAction::SendPacketAndAwait(data) => data,
                ResultAction::CloseConnection(outcome) => return self.finish(outcome),
            };

            if let Err(e) = self.sock.send(&data.to_bytes()).await {
                return self.finish(Outcome::Failed(Failure::Io(e.to_string())));
            }

            let received = tokio::select! {
                _ = shutdown.recv() => None,
                res = self.sock.recv_with_timeout(&mut buf, self.timeout) => Some(res),
            };

            let event = match received {
                None => {
                    // Sent as a courtesy, we don't care how it goes.
                    let goodbye = ErrorPacket {
                        code: ErrorCode::Unknown,
                        message: "server shutting down".to_string(),
                    };
                    let _ = self.sock.send(&goodbye.to_bytes()).await;
                    return self.finish(Outcome::Failed(Failure::Cancelled));
                }
                Some(Ok(n)) => match Reply::parse(&buf[..n]) {
                    Ok(reply) => SessionEvent::Reply(reply),
                    Err(e) => SessionEvent::Malformed(e),
                },
                Some(Err(SocketError::Timeout(_))) => {
                    log::debug!("[{}] timed out waiting for ack {}", self.dst, data.block());
                    SessionEvent::Timeout
                }
                Some(Err(SocketError::IO(e))) => {
                    return self.finish(Outcome::Failed(Failure::Io(e.to_string())));
                }
            };

            action = self.processor.process(event);
        }
    }

    fn finish(self, outcome: Outcome) -> Outcome {
        match &outcome {
            Outcome::Complete { blocks } => log::info!("[{}] sent {blocks} blocks", self.dst),
            Outcome::Failed(Failure::Cancelled) => log::info!("[{}] {}", self.dst, Failure::Cancelled),
            Outcome::Failed(Failure::Io(e)) => log::error!("[{}] transfer socket: {e}", self.dst),
            Outcome::Failed(failure) => log::warn!("[{}] {failure}", self.dst),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::shutdown;
    use crate::tftp::{Ack, Data, ReadRequest};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn settings(len: usize, retries: u8, wait: Duration) -> TransferSettings {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        ServerConfig { retries: Some(retries), timeout: Some(wait), ..ServerConfig::with_payload(payload) }
            .validate()
            .unwrap()
    }

    fn client() -> TftpSocket {
        TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn spawn_session(
        client: &TftpSocket,
        settings: &TransferSettings,
        shutdown: Shutdown,
    ) -> JoinHandle<Outcome> {
        let session =
            TransferSession::new(&ReadRequest::new("x"), client.local_addr().unwrap(), settings).unwrap();
        tokio::spawn(session.run(shutdown))
    }

    /// Waits for the next datagram, or `None` if nothing shows up within `wait`.
    async fn next_datagram(sock: &TftpSocket, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; tftp::DATAGRAM_SIZE];
        match timeout(wait, sock.recv_from(&mut buf)).await {
            Ok(res) => {
                let (n, src) = res.unwrap();
                Some((buf[..n].to_vec(), src))
            }
            Err(_) => None,
        }
    }

    async fn next_data(sock: &TftpSocket) -> (Data, SocketAddr) {
        let (buf, src) = next_datagram(sock, Duration::from_secs(2)).await.expect("no data packet");
        (Data::parse(&buf).unwrap(), src)
    }

    async fn ack(sock: &TftpSocket, block: u16, dst: SocketAddr) {
        sock.send_to(&Ack { block }.to_bytes(), dst).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_completes() {
        let (_trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(1300, 3, Duration::from_secs(1));
        let session = spawn_session(&client, &settings, shutdown);

        let mut received = vec![];
        loop {
            let (data, src) = next_data(&client).await;
            assert_eq!(data.block() as usize, received.len() / tftp::BLOCK_SIZE + 1);
            received.extend_from_slice(data.payload());
            ack(&client, data.block(), src).await;
            if data.is_final() {
                break;
            }
        }

        assert_eq!(&received[..], &settings.payload[..]);
        assert_eq!(session.await.unwrap(), Outcome::Complete { blocks: 3 });
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (_trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(1000, 3, Duration::from_millis(30));
        let session = spawn_session(&client, &settings, shutdown);

        let mut blocks = vec![];
        while let Some((buf, _)) = next_datagram(&client, Duration::from_millis(300)).await {
            blocks.push(Data::parse(&buf).unwrap().block());
        }

        assert_eq!(blocks, vec![1, 1, 1]);
        assert_eq!(
            session.await.unwrap(),
            Outcome::Failed(Failure::RetriesExhausted { block: 1 })
        );
    }

    #[tokio::test]
    async fn test_stale_ack_and_garbage_trigger_retransmission() {
        let (_trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(600, 5, Duration::from_secs(1));
        let session = spawn_session(&client, &settings, shutdown);

        let (first, src) = next_data(&client).await;
        assert_eq!(first.block(), 1);

        ack(&client, 7, src).await;
        let (again, _) = next_data(&client).await;
        assert_eq!(again, first);

        client.send_to(&[0xFF, 0x00, 0x01], src).await.unwrap();
        let (again, _) = next_data(&client).await;
        assert_eq!(again, first);

        ack(&client, 1, src).await;
        let (second, _) = next_data(&client).await;
        assert_eq!(second.block(), 2);
        assert_eq!(second.payload().len(), 600 - tftp::BLOCK_SIZE);
        ack(&client, 2, src).await;

        assert_eq!(session.await.unwrap(), Outcome::Complete { blocks: 2 });
    }

    #[tokio::test]
    async fn test_client_error_ends_transfer() {
        let (_trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(4096, 10, Duration::from_millis(100));
        let session = spawn_session(&client, &settings, shutdown);

        for block in 1..=3 {
            let (data, src) = next_data(&client).await;
            assert_eq!(data.block(), block);
            if block < 3 {
                ack(&client, block, src).await;
            } else {
                let err = ErrorPacket { code: ErrorCode::DiskFull, message: "full".to_string() };
                client.send_to(&err.to_bytes(), src).await.unwrap();
            }
        }

        assert_eq!(
            session.await.unwrap(),
            Outcome::Failed(Failure::ClientError { code: ErrorCode::DiskFull, message: "full".to_string() })
        );
        assert!(next_datagram(&client, Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_latin1_client_error_ends_transfer() {
        let (_trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(2000, 10, Duration::from_millis(100));
        let session = spawn_session(&client, &settings, shutdown);

        let (data, src) = next_data(&client).await;
        assert_eq!(data.block(), 1);
        // ERROR 1 "caf\xE9"
        client.send_to(&[0x00, 0x05, 0x00, 0x01, 0x63, 0x61, 0x66, 0xE9, 0x00], src).await.unwrap();

        assert_eq!(
            session.await.unwrap(),
            Outcome::Failed(Failure::ClientError {
                code: ErrorCode::NotFound,
                message: "caf\u{FFFD}".to_string()
            })
        );
        assert!(next_datagram(&client, Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_session() {
        let (trigger, shutdown) = shutdown::channel();
        let client = client();
        let settings = settings(1000, 10, Duration::from_secs(5));
        let session = spawn_session(&client, &settings, shutdown);

        let (data, _) = next_data(&client).await;
        assert_eq!(data.block(), 1);

        trigger.shutdown();
        let outcome = timeout(Duration::from_secs(1), session).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Failed(Failure::Cancelled));

        let (buf, _) = next_datagram(&client, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ErrorPacket::parse(&buf).unwrap().code, ErrorCode::Unknown);
    }

    #[tokio::test]
    async fn test_binds_within_port_range() {
        let client = client();
        let mut settings = settings(10, 1, Duration::from_secs(1));
        settings.transfer_ports = Some(45000..=45100);

        let session =
            TransferSession::new(&ReadRequest::new("x"), client.local_addr().unwrap(), &settings).unwrap();
        let port = session.local_addr().unwrap().port();
        assert!((45000..=45100).contains(&port));
    }
}
