//! TCP server answering `getcommits`, and the matching client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::message::{read_message, write_message, Message, SyncRejection};
use super::NetError;
use crate::chain::Chain;
use crate::sync::{self, CommitsResponse, GetCommits};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept connections forever, one task per peer
pub async fn serve(listener: TcpListener, chain: Arc<RwLock<Chain>>) -> Result<(), NetError> {
    info!("Serving commits on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Incoming connection from {}", addr);

        let chain = Arc::clone(&chain);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, chain).await {
                debug!("Connection {} closed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, chain: Arc<RwLock<Chain>>) -> Result<(), NetError> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => {
                warn!("Bad message from {}: {}", addr, e);
                return Err(e);
            }
        };

        let reply = match msg {
            Message::GetCommits(request) => {
                let chain = chain.read().await;
                match sync::get_commits(&*chain, &request) {
                    Ok(response) => Message::Commits(response),
                    Err(e) => {
                        info!("getcommits from {} refused: {}", addr, e);
                        Message::SyncError(SyncRejection {
                            code: e.code(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Message::Ping(nonce) => Message::Pong(nonce),
            other => {
                return Err(NetError::Protocol(format!("unexpected {} from {}", other.command(), addr)));
            }
        };
        write_message(&mut writer, &reply).await?;
    }
}

/// Requesting side of the commits exchange
pub struct SyncClient {
    stream: TcpStream,
    peer: SocketAddr,
}

impl SyncClient {
    pub async fn connect(peer: SocketAddr) -> Result<Self, NetError> {
        let stream = tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| NetError::Timeout)??;
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn round_trip(&mut self, msg: &Message) -> Result<Message, NetError> {
        let stream = &mut self.stream;
        tokio::time::timeout(REQUEST_TIMEOUT, async move {
            write_message(stream, msg).await?;
            read_message(stream).await
        })
        .await
        .map_err(|_| NetError::Timeout)?
    }

    /// Fetch commits after `request.locator` and check they link and prove
    pub async fn get_commits(&mut self, request: GetCommits) -> Result<CommitsResponse, NetError> {
        match self.round_trip(&Message::GetCommits(request.clone())).await? {
            Message::Commits(response) => {
                sync::verify_response(&request.locator, &response)?;
                debug!(
                    "{} commits from {} ({:?})",
                    response.data.len(),
                    self.peer,
                    response.status
                );
                Ok(response)
            }
            Message::SyncError(rejection) => Err(NetError::SyncRejected {
                code: rejection.code,
                reason: rejection.reason,
            }),
            other => Err(NetError::Protocol(format!("unexpected {}", other.command()))),
        }
    }

    pub async fn ping(&mut self, nonce: u64) -> Result<(), NetError> {
        match self.round_trip(&Message::Ping(nonce)).await? {
            Message::Pong(n) if n == nonce => Ok(()),
            other => Err(NetError::Protocol(format!("unexpected {}", other.command()))),
        }
    }
}
