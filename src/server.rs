// The dispatcher: reads requests off the listening socket and hands each valid one to its own
// transfer session task. It keeps no per-client state and never waits on a session.

use crate::config::{ConfigError, ServerConfig, TransferSettings};
use crate::shutdown::Shutdown;
use crate::srv_conn::TransferSession;
use crate::tftp::{self, ReadRequest, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::net::SocketAddr;

/// Errors that stop the whole server. Problems with a single request or transfer never do.
#[derive(Debug)]
pub enum ServerError {
    Socket(SocketError),
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "Listening socket failed: {e}"),
        }
    }
}

impl From<SocketError> for ServerError {
    fn from(e: SocketError) -> ServerError {
        ServerError::Socket(e)
    }
}

/// A read-only TFTP server that answers every read request with the same payload.
#[derive(Debug, Clone)]
pub struct Server {
    settings: TransferSettings,
}

impl Server {
    /// Validates the configuration. A server that fails here never serves anything.
    pub fn new(config: ServerConfig) -> Result<Server, ConfigError> {
        Ok(Server { settings: config.validate()? })
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub async fn listen_and_serve(&self, addr: SocketAddr, shutdown: Shutdown) -> Result<(), ServerError> {
        let sock = TftpSocket::bind(addr)?;
        log::info!("Listening on {} ...", sock.local_addr()?);
        self.serve(sock, shutdown).await
    }

    /// Accepts read requests on `sock` until shutdown is signalled or the socket fails.
    ///
    /// Returns `Ok(())` on shutdown and an error only when the listening socket itself breaks.
    pub async fn serve(&self, sock: TftpSocket, mut shutdown: Shutdown) -> Result<(), ServerError> {
        let mut buf = [0; tftp::DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.recv() => None,
                res = sock.recv_from(&mut buf) => Some(res),
            };

            let (n, src) = match received {
                None => {
                    log::info!("Shutting down, no longer accepting requests");
                    return Ok(());
                }
                Some(res) => res?,
            };

            // Both branches can be ready at once; don't start a session that would be cancelled
            // straight away.
            if shutdown.is_shutdown() {
                log::info!("Shutting down, no longer accepting requests");
                return Ok(());
            }

            // The protocol has no way to reject a bad request, so the client just never hears
            // back.
            let request = match ReadRequest::parse(&buf[..n]) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("[{src}] bad request: {e}");
                    continue;
                }
            };

            self.dispatch(request, src, shutdown.clone());
        }
    }

    fn dispatch(&self, request: ReadRequest, src: SocketAddr, shutdown: Shutdown) {
        log::info!("[{src}] requested file: {}", request.filename);
        match TransferSession::new(&request, src, &self.settings) {
            Ok(session) => {
                tokio::spawn(session.run(shutdown));
            }
            Err(e) => log::error!("[{src}] couldn't open transfer socket: {e}"),
        }
    }
}
