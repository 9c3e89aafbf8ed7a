use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::peer::Bitfield;
use crate::peer::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
use crate::peer::message::{Message, MessageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HandshakeSent,
    HandshakeVerified,
    Idle,
    AwaitingBlocks,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    /// Silence from the peer for this long closes the connection.
    pub idle_timeout: Duration,
    /// Delay before re-sending `Interested` after a choke.
    pub choke_backoff: Duration,
    pub max_interest_retries: u32,
    /// Block requests kept outstanding at once.
    pub pipeline_depth: usize,
    /// Extra attempts at a piece whose hash did not match.
    pub piece_retries: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            choke_backoff: Duration::from_secs(5),
            max_interest_retries: 3,
            pipeline_depth: 5,
            piece_retries: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("framing error: {0}")]
    Message(#[from] MessageError),
    #[error("peer is choking us, request not sent")]
    Choked,
    #[error("peer does not have piece {index}")]
    PeerLacksPiece { index: u32 },
    #[error("peer stayed choking after {0} interest retries")]
    ChokeRetriesExhausted(u32),
    #[error("bitfield of {received} bytes cannot describe {num_pieces} pieces")]
    InvalidBitfield { num_pieces: usize, received: usize },
    #[error("no data from peer for {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection is closed")]
    Closed,
}

impl PeerError {
    /// Refusals that leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::Choked | PeerError::PeerLacksPiece { .. })
    }
}

type Result<T> = std::result::Result<T, PeerError>;

/// One peer-wire session over a byte stream.
#[derive(Debug)]
pub struct PeerConnection<S> {
    stream: S,
    label: String,
    config: PeerConfig,
    state: ConnectionState,

    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    remote_peer_id: Option<[u8; 20]>,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_pieces: Bitfield,
    availability_known: bool,

    read_buf: BytesMut,
    outstanding: usize,
    /// Set by a choke that arrived with requests outstanding; the peer may
    /// have discarded them.
    requests_dropped: bool,
    last_read: Instant,
    last_write: Instant,
    interest_retry_at: Option<Instant>,
    interest_retries: u32,
}

impl PeerConnection<TcpStream> {
    /// Opens a TCP connection and completes the handshake.
    pub async fn connect(
        address: SocketAddr,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        num_pieces: usize,
        config: PeerConfig,
    ) -> Result<Self> {
        debug!(peer = %address, "connecting");
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout(config.connect_timeout))??;
        Self::establish(stream, address.to_string(), info_hash, local_peer_id, num_pieces, config).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PeerConnection<S> {
    pub fn new(
        stream: S,
        label: impl Into<String>,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        num_pieces: usize,
        config: PeerConfig,
    ) -> Self {
        let now = Instant::now();
        PeerConnection {
            stream,
            label: label.into(),
            config,
            state: ConnectionState::Connecting,
            info_hash,
            local_peer_id,
            remote_peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: Bitfield::new(num_pieces, false),
            availability_known: false,
            read_buf: BytesMut::with_capacity(32 * 1024),
            outstanding: 0,
            requests_dropped: false,
            last_read: now,
            last_write: now,
            interest_retry_at: None,
            interest_retries: 0,
        }
    }

    /// Wraps an already connected stream and completes the handshake.
    pub async fn establish(
        stream: S,
        label: impl Into<String>,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        num_pieces: usize,
        config: PeerConfig,
    ) -> Result<Self> {
        let mut conn = Self::new(stream, label, info_hash, local_peer_id, num_pieces, config);
        conn.handshake().await?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn peer_pieces(&self) -> &Bitfield {
        &self.peer_pieces
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.peer_pieces.has_piece(index as usize)
    }

    /// Whether a choke may have discarded requests that are not yet answered.
    /// Cleared by the next unchoke, which forgets those requests.
    pub fn requests_dropped(&self) -> bool {
        self.requests_dropped
    }

    /// Whether a `bitfield` or `have` has told us anything about the peer yet.
    pub fn availability_known(&self) -> bool {
        self.availability_known
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outstanding
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Closes the connection when `result` carries a fatal error.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state != ConnectionState::Closed {
                warn!(peer = %self.label, error = %e, "closing connection");
                self.state = ConnectionState::Closed;
            }
        }
        result
    }

    /// Sends our handshake, checks the reply and declares interest.
    pub async fn handshake(&mut self) -> Result<Handshake> {
        let result = self.handshake_inner().await;
        self.guard(result)
    }

    async fn handshake_inner(&mut self) -> Result<Handshake> {
        if self.state != ConnectionState::Connecting {
            return Err(PeerError::Closed);
        }
        let mine = Handshake::new(self.info_hash, self.local_peer_id);
        let my_bytes = <[u8; HANDSHAKE_LEN]>::from(&mine);
        self.stream.write_all(&my_bytes).await?;
        self.last_write = Instant::now();
        self.state = ConnectionState::HandshakeSent;
        trace!(peer = %self.label, "handshake sent");

        let mut buf = [0u8; HANDSHAKE_LEN];
        let idle_timeout = self.config.idle_timeout;
        time::timeout(idle_timeout, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| PeerError::Timeout(idle_timeout))??;
        self.last_read = Instant::now();

        let theirs = Handshake::try_from(buf.as_slice())?;
        mine.verify_reply(&theirs)?;
        self.remote_peer_id = Some(theirs.peer_id);
        self.state = ConnectionState::HandshakeVerified;
        info!(peer = %self.label, peer_id = %hex::encode(theirs.peer_id), "handshake verified");

        self.send_interested_inner().await?;
        self.state = ConnectionState::Idle;
        Ok(theirs)
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.last_write = Instant::now();
        trace!(peer = %self.label, ?msg, "sent");
        Ok(())
    }

    async fn send_interested_inner(&mut self) -> Result<()> {
        self.send(&Message::Interested).await?;
        self.am_interested = true;
        debug!(peer = %self.label, "interest expressed");
        Ok(())
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        let result = self.send_interested_inner().await;
        self.guard(result)
    }

    pub async fn send_not_interested(&mut self) -> Result<()> {
        let result = self.send(&Message::NotInterested).await;
        if result.is_ok() {
            self.am_interested = false;
            self.interest_retry_at = None;
        }
        self.guard(result)
    }

    pub async fn send_keep_alive(&mut self) -> Result<()> {
        let result = self.send(&Message::KeepAlive).await;
        self.guard(result)
    }

    /// Asks the peer for one block. Refused without touching the socket while
    /// the peer is choking us or does not advertise the piece.
    pub async fn request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if self.peer_choking {
            return Err(PeerError::Choked);
        }
        if !self.has_piece(index) {
            return Err(PeerError::PeerLacksPiece { index });
        }
        let result = self.send(&Message::Request { index, begin, length }).await;
        if result.is_ok() {
            self.outstanding += 1;
            self.state = ConnectionState::AwaitingBlocks;
        }
        self.guard(result)
    }

    pub async fn cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let result = self.send(&Message::Cancel { index, begin, length }).await;
        if result.is_ok() {
            self.block_settled();
        }
        self.guard(result)
    }

    fn block_settled(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 && self.state == ConnectionState::AwaitingBlocks {
            self.state = ConnectionState::Idle;
        }
    }

    /// Waits for the next message and applies it to the session state. While
    /// choked, `Interested` is re-sent after the configured backoff.
    pub async fn next_message(&mut self) -> Result<Message> {
        let result = self.next_message_inner().await;
        self.guard(result)
    }

    async fn next_message_inner(&mut self) -> Result<Message> {
        if self.state == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        loop {
            if let Some(msg) = Message::parse_frame(&mut self.read_buf)? {
                self.apply(&msg)?;
                return Ok(msg);
            }

            let idle_deadline = self.last_read + self.config.idle_timeout;
            let keep_alive_at = self.last_write + self.config.idle_timeout / 2;
            let mut wake = idle_deadline.min(keep_alive_at);
            if let Some(retry_at) = self.interest_retry_at {
                wake = wake.min(retry_at);
            }

            match time::timeout_at(wake, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(Ok(0)) => return Err(PeerError::ConnectionClosed),
                Ok(Ok(_)) => self.last_read = Instant::now(),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let now = Instant::now();
                    if now >= idle_deadline {
                        return Err(PeerError::Timeout(self.config.idle_timeout));
                    }
                    if self.interest_retry_at.is_some_and(|at| now >= at) {
                        self.retry_interest().await?;
                    }
                    if now >= keep_alive_at {
                        self.send(&Message::KeepAlive).await?;
                    }
                },
            }
        }
    }

    async fn retry_interest(&mut self) -> Result<()> {
        if !self.peer_choking {
            self.interest_retry_at = None;
            return Ok(());
        }
        if self.interest_retries >= self.config.max_interest_retries {
            return Err(PeerError::ChokeRetriesExhausted(self.interest_retries));
        }
        self.interest_retries += 1;
        info!(peer = %self.label, attempt = self.interest_retries, "still choked, re-sending interest");
        self.send_interested_inner().await?;
        self.interest_retry_at = Some(Instant::now() + self.config.choke_backoff);
        Ok(())
    }

    fn apply(&mut self, msg: &Message) -> Result<()> {
        debug!(peer = %self.label, msg = ?MessageSummary(msg), "received");
        match msg {
            Message::KeepAlive => (),
            Message::Choke => {
                self.peer_choking = true;
                if self.outstanding > 0 {
                    self.requests_dropped = true;
                }
                if self.am_interested && self.interest_retry_at.is_none() {
                    self.interest_retry_at = Some(Instant::now() + self.config.choke_backoff);
                }
                info!(peer = %self.label, "choked");
            },
            Message::Unchoke => {
                self.peer_choking = false;
                self.interest_retry_at = None;
                self.interest_retries = 0;
                if self.requests_dropped {
                    self.requests_dropped = false;
                    self.outstanding = 0;
                    if self.state == ConnectionState::AwaitingBlocks {
                        self.state = ConnectionState::Idle;
                    }
                }
                info!(peer = %self.label, "unchoked");
            },
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { index } => {
                if self.peer_pieces.mark_piece(*index as usize) {
                    self.availability_known = true;
                } else {
                    warn!(peer = %self.label, index, "have for a piece outside the torrent");
                }
            },
            Message::Bitfield { bitmap } => {
                let num_pieces = self.peer_pieces.len();
                self.peer_pieces = Bitfield::try_from_vec(bitmap.clone(), num_pieces)
                    .map_err(|_| PeerError::InvalidBitfield { num_pieces, received: bitmap.len() })?;
                self.availability_known = true;
            },
            Message::Request { index, begin, .. } => {
                // Uploading is not supported, so we never unchoke the peer.
                debug!(peer = %self.label, index, begin, "ignoring request while choking peer");
            },
            Message::Piece { .. } => self.block_settled(),
            Message::Cancel { .. } => (),
            Message::Unknown { id, length } => {
                debug!(peer = %self.label, id, length, "skipped unknown message");
            },
        }
        Ok(())
    }

    /// Pumps messages until the peer unchokes us.
    pub async fn wait_for_unchoke(&mut self) -> Result<()> {
        while self.peer_choking {
            self.next_message().await?;
        }
        Ok(())
    }

    /// Shuts the stream down. Idempotent.
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            if let Err(e) = self.stream.shutdown().await {
                debug!(peer = %self.label, error = %e, "shutdown failed");
            }
            info!(peer = %self.label, "connection closed");
        }
    }
}

/// Keeps block payloads out of the logs.
struct MessageSummary<'a>(&'a Message);

impl std::fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Message::Piece { index, begin, block } => {
                write!(f, "Piece {{ index: {index}, begin: {begin}, len: {} }}", block.len())
            },
            Message::Bitfield { bitmap } => write!(f, "Bitfield {{ len: {} }}", bitmap.len()),
            other => write!(f, "{other:?}"),
        }
    }
}
