//! One peer connection: queues, reader, writer, lifecycle.
//!
//! A [`LinkBase`] owns the two bounded send queues and the lifecycle flags of
//! one connection; the actual byte stream lives inside the two spawned
//! workers. Senders never block: a full queue drops the frame and counts it,
//! and the [flow-control indicator](LinkBase::flow_control_indicator) tells
//! upstream to back off before that happens.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use filament_config::{address_class, AddressClass};
use filament_crypto::{EncryptionSession, OpenKey, SealKey};
use filament_frame::{Frame, FrameError, FramePool, PooledBuf};
use filament_frame::FlowControlFlag;
use filament_types::{PeeringUrl, PublicKey, SwitchLabel};

use crate::link_frame::{
    LinkFrame, LinkFrameError, LINK_FRAME_OFFSET, LINK_FRAME_OVERHEAD, MAX_LINK_FRAME,
};
use crate::peering::Peering;

/// Capacity of the priority send queue.
pub const SEND_QUEUE_PRIO: usize = 100;

/// Capacity of the regular send queue.
pub const SEND_QUEUE_REGULAR: usize = 1000;

/// Non-fatal reader or writer errors tolerated in a row before the link is
/// closed.
const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Errors on the link's frame path.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Reading from the stream failed; terminal for the link.
    #[error("read i/o error: {0}")]
    NetworkRead(#[source] std::io::Error),

    /// Writing to the stream failed; terminal for the link.
    #[error("write i/o error: {0}")]
    NetworkWrite(#[source] std::io::Error),

    /// A record announced an impossible length.
    #[error("invalid data length of {0}")]
    BadLength(usize),

    /// A record announced more bytes than the link buffer holds. The wire
    /// was drained past the record, so the stream stays aligned.
    #[error("frame of {0} bytes too big for link buffer")]
    FrameTooBig(usize),

    /// Envelope seal or unseal failure.
    #[error(transparent)]
    Envelope(#[from] LinkFrameError),

    /// Frame parse failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl LinkError {
    /// Terminal errors close the link; everything else counts toward the
    /// consecutive-error limit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NetworkRead(_) | Self::NetworkWrite(_))
    }

    fn is_eof(&self) -> bool {
        matches!(self, Self::NetworkRead(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Receiver ends of the send queues, handed to the writer worker.
pub(crate) struct LinkQueues {
    pub(crate) prio_rx: mpsc::Receiver<Frame>,
    pub(crate) regl_rx: mpsc::Receiver<Frame>,
}

/// A network connection to another router.
pub struct LinkBase {
    /// Overlay address of the peer, derived from its verified identity.
    peer: Ipv6Addr,
    /// Verified identity key of the peer.
    peer_key: PublicKey,
    /// Peering URL used to set up the connection.
    peering_url: PeeringUrl,
    /// Whether this router initiated the connection.
    outgoing: bool,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    /// Expected maximum frame size, by remote address class.
    frame_size: usize,

    send_prio: mpsc::Sender<Frame>,
    send_regl: mpsc::Sender<Frame>,

    /// One-way latency estimate in milliseconds.
    latency_ms: AtomicU16,
    /// Switch label; zero until assigned by the registry.
    switch_label: AtomicU16,
    /// Monotonic once set. Guards the log callback and the registry removal.
    closing: AtomicBool,
    /// Frames dropped by the non-blocking send paths.
    dropped_frames: AtomicU64,

    shutdown: broadcast::Sender<()>,
    peering: Weak<Peering>,
}

impl LinkBase {
    pub(crate) fn new(
        peer: Ipv6Addr,
        peer_key: PublicKey,
        peering_url: PeeringUrl,
        outgoing: bool,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        frame_size: usize,
        peering: Weak<Peering>,
    ) -> (Arc<Self>, LinkQueues) {
        let (prio_tx, prio_rx) = mpsc::channel(SEND_QUEUE_PRIO);
        let (regl_tx, regl_rx) = mpsc::channel(SEND_QUEUE_REGULAR);
        let (shutdown, _) = broadcast::channel(1);

        let link = Arc::new(Self {
            peer,
            peer_key,
            peering_url,
            outgoing,
            local_addr,
            remote_addr,
            frame_size,
            send_prio: prio_tx,
            send_regl: regl_tx,
            latency_ms: AtomicU16::new(fallback_latency(&remote_addr)),
            switch_label: AtomicU16::new(0),
            closing: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            shutdown,
            peering,
        });
        (link, LinkQueues { prio_rx, regl_rx })
    }

    /// Overlay address of the connected peer.
    pub fn peer(&self) -> Ipv6Addr {
        self.peer
    }

    /// Verified identity key of the peer.
    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    /// The switch label of the link.
    pub fn switch_label(&self) -> SwitchLabel {
        SwitchLabel::new(self.switch_label.load(Ordering::Acquire))
    }

    pub(crate) fn set_switch_label(&self, label: SwitchLabel) {
        self.switch_label.store(label.raw(), Ordering::Release);
    }

    /// The peering URL this connection was set up with.
    pub fn peering_url(&self) -> &PeeringUrl {
        &self.peering_url
    }

    /// Whether the connection was initiated by this router.
    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    /// Local address of the underlying connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote address of the underlying connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Expected maximum frame size of the link.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// One-way latency of the link in milliseconds.
    pub fn latency(&self) -> u16 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Record an observed one-way latency. Saturates at the u16 range.
    pub fn record_latency(&self, millis: u64) {
        let clamped = millis.min(u16::MAX as u64) as u16;
        self.latency_ms.store(clamped, Ordering::Relaxed);
    }

    /// Frames dropped because a queue was full or the link was closing.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Send a priority frame to the peer. Never blocks; the frame is dropped
    /// if the priority queue is full.
    pub fn send_priority(&self, frame: Frame) {
        if self.closing.load(Ordering::Acquire) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.send_prio.try_send(frame).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Send a frame to the peer. Never blocks; the frame is dropped if the
    /// regular queue is full. Watch [`flow_control_indicator`](Self::flow_control_indicator)
    /// to stay below that point.
    pub fn send(&self, frame: Frame) {
        if self.closing.load(Ordering::Acquire) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.send_regl.try_send(frame).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pressure on the regular send queue. The priority queue is excluded.
    pub fn flow_control_indicator(&self) -> FlowControlFlag {
        let max = self.send_regl.max_capacity();
        let used = max - self.send_regl.capacity();
        let percent = used * 100 / max;
        match percent {
            p if p >= 70 => FlowControlFlag::DecreaseFlow,
            p if p >= 30 => FlowControlFlag::HoldFlow,
            _ => FlowControlFlag::IncreaseFlow,
        }
    }

    /// Whether the link is closing or has closed.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close the link. Idempotent: the first caller runs `log`, removes the
    /// link from the registry and stops both workers; later callers are
    /// no-ops. Safe to call from the reader, the writer, or outside.
    pub fn close(&self, log: impl FnOnce()) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log();
            if let Some(peering) = self.peering.upgrade() {
                peering.remove_link(self);
            }
            let _ = self.shutdown.send(());
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Display for LinkBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.outgoing {
            write!(
                f,
                "link to {} @ {} using {}",
                self.peer, self.remote_addr, self.peering_url
            )
        } else {
            write!(
                f,
                "link from {} @ {} using {}",
                self.peer, self.remote_addr, self.peering_url
            )
        }
    }
}

impl std::fmt::Debug for LinkBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkBase")
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("label", &self.switch_label())
            .field("outgoing", &self.outgoing)
            .field("closing", &self.is_closing())
            .finish()
    }
}

fn fallback_latency(remote: &SocketAddr) -> u16 {
    match address_class(&remote.ip()) {
        AddressClass::Private => 5,
        AddressClass::Loopback => 10,
        AddressClass::Global => 20,
    }
}

/// Spawn the reader and writer workers of an established link.
pub(crate) fn start_workers<S>(
    link: Arc<LinkBase>,
    stream: S,
    session: EncryptionSession,
    pool: Arc<FramePool>,
    upstream: mpsc::Sender<Frame>,
    queues: LinkQueues,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let (seal, open) = session.split();

    let reader_link = link.clone();
    let reader_shutdown = link.subscribe_shutdown();
    tokio::spawn(async move {
        reader(reader_link, rd, open, pool, upstream, reader_shutdown).await;
    });

    let writer_shutdown = link.subscribe_shutdown();
    tokio::spawn(async move {
        writer(link, wr, seal, queues, writer_shutdown).await;
    });
}

/// The link reader: one sealed record per iteration, delivered upstream.
pub(crate) async fn reader<R>(
    link: Arc<LinkBase>,
    mut rd: R,
    mut open: OpenKey,
    pool: Arc<FramePool>,
    upstream: mpsc::Sender<Frame>,
    mut shutdown: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut consecutive_errors = 0u32;
    loop {
        let mut buf = pool.get(link.frame_size());
        let read = tokio::select! {
            res = read_length_and_data(&mut rd, &mut buf) => res,
            _ = shutdown.recv() => return,
        };

        match read.and_then(|n| decode_record(buf, n, &mut open)) {
            Ok(mut frame) => {
                consecutive_errors = 0;
                frame.set_recv_label(link.switch_label());
                tokio::select! {
                    res = upstream.send(frame) => {
                        if res.is_err() {
                            // Upstream is gone, the router is shutting down.
                            return;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
            Err(err) if err.is_fatal() => {
                if err.is_eof() {
                    link.close(|| {
                        info!(
                            peer = %link.peer(),
                            addr = %link.remote_addr(),
                            "closing link (by remote)"
                        );
                    });
                } else {
                    link.close(|| {
                        warn!(
                            peer = %link.peer(),
                            addr = %link.remote_addr(),
                            err = %err,
                            "read i/o error, closing link"
                        );
                    });
                }
                return;
            }
            Err(err) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    link.close(|| {
                        warn!(
                            peer = %link.peer(),
                            addr = %link.remote_addr(),
                            err = %err,
                            "closing link after {MAX_CONSECUTIVE_ERRORS} consecutive read errors"
                        );
                    });
                    return;
                }
                debug!(
                    peer = %link.peer(),
                    addr = %link.remote_addr(),
                    err = %err,
                    "failed to read frame (non-fatal)"
                );
            }
        }
    }
}

/// The link writer: strict priority between the two queues.
pub(crate) async fn writer<W>(
    link: Arc<LinkBase>,
    mut wr: W,
    mut seal: SealKey,
    mut queues: LinkQueues,
    mut shutdown: broadcast::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut consecutive_errors = 0u32;
    loop {
        // Biased select re-checks the priority queue on every wake-up, so a
        // queued priority frame always goes out before regular traffic.
        let mut frame = tokio::select! {
            biased;
            Some(f) = queues.prio_rx.recv() => f,
            Some(f) = queues.regl_rx.recv() => f,
            _ = shutdown.recv() => return,
        };

        frame.set_flow_flag(link.flow_control_indicator());
        match write_sealed_frame(&mut wr, frame, &mut seal).await {
            Ok(()) => consecutive_errors = 0,
            Err(err) if err.is_fatal() => {
                link.close(|| {
                    warn!(
                        peer = %link.peer(),
                        addr = %link.remote_addr(),
                        err = %err,
                        "write i/o error, closing link"
                    );
                });
                return;
            }
            Err(err) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    link.close(|| {
                        warn!(
                            peer = %link.peer(),
                            addr = %link.remote_addr(),
                            err = %err,
                            "closing link after {MAX_CONSECUTIVE_ERRORS} consecutive write errors"
                        );
                    });
                    return;
                }
                debug!(
                    peer = %link.peer(),
                    addr = %link.remote_addr(),
                    err = %err,
                    "failed to write frame (non-fatal)"
                );
            }
        }
    }
}

/// Read one length-prefixed record into `buf`, returning the record length.
///
/// A record longer than the buffer is drained from the wire and reported as
/// [`LinkError::FrameTooBig`] so the stream stays aligned for the next
/// record.
pub(crate) async fn read_length_and_data<R>(rd: &mut R, buf: &mut [u8]) -> Result<usize, LinkError>
where
    R: AsyncRead + Unpin,
{
    rd.read_exact(&mut buf[..2])
        .await
        .map_err(LinkError::NetworkRead)?;
    let data_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if data_len <= 3 {
        return Err(LinkError::BadLength(data_len));
    }

    if data_len > buf.len() {
        // Read and discard the rest of the record so we can continue with
        // the next one.
        let mut remaining = data_len - 2;
        while remaining > 0 {
            let take = remaining.min(buf.len());
            rd.read_exact(&mut buf[..take])
                .await
                .map_err(LinkError::NetworkRead)?;
            remaining -= take;
        }
        return Err(LinkError::FrameTooBig(data_len));
    }

    rd.read_exact(&mut buf[2..data_len])
        .await
        .map_err(LinkError::NetworkRead)?;
    Ok(data_len)
}

/// Unseal one received record in place and parse the contained frame. The
/// frame keeps the pooled buffer, so nothing is copied.
fn decode_record(mut buf: PooledBuf, len: usize, open: &mut OpenKey) -> Result<Frame, LinkError> {
    let plain_len = {
        let mut lf = LinkFrame::new(&mut buf[..len]);
        lf.unseal(open)?;
        lf.link_data().len()
    };
    Ok(Frame::parse(buf, LINK_FRAME_OFFSET, plain_len)?)
}

/// Seal and write one frame. The frame's buffer returns to the pool when
/// this function finishes, on success and on error alike.
async fn write_sealed_frame<W>(wr: &mut W, mut frame: Frame, seal: &mut SealKey) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let data = frame.data_with_margins(LINK_FRAME_OFFSET, LINK_FRAME_OVERHEAD)?;
    LinkFrame::new(data).seal(seal)?;
    wr.write_all(data).await.map_err(LinkError::NetworkWrite)?;
    Ok(())
}

/// Write one frame without a session, used by the handshake before the
/// session exists.
pub(crate) async fn write_plain_frame<W>(wr: &mut W, mut frame: Frame) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let data = frame.data_with_margins(LINK_FRAME_OFFSET, 0)?;
    if data.len() > MAX_LINK_FRAME {
        return Err(LinkFrameError::TooBig(data.len()).into());
    }
    let len = (data.len() as u16).to_be_bytes();
    data[..2].copy_from_slice(&len);
    wr.write_all(data).await.map_err(LinkError::NetworkWrite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use filament_frame::{FrameBuilder, FrameType};

    fn test_sessions() -> (EncryptionSession, EncryptionSession) {
        let secret = [5u8; 32];
        (
            EncryptionSession::derive(&secret, b"link test", true).unwrap(),
            EncryptionSession::derive(&secret, b"link test", false).unwrap(),
        )
    }

    fn test_link(remote: &str) -> (Arc<LinkBase>, LinkQueues) {
        let url: PeeringUrl = format!("tcp://{remote}").parse().unwrap();
        LinkBase::new(
            "fd00::1234".parse().unwrap(),
            filament_types::keys::PrivateKey::generate().public_key(),
            url.clone(),
            true,
            "127.0.0.1:0".parse().unwrap(),
            url.addr(),
            u16::MAX as usize,
            Weak::new(),
        )
    }

    fn ping_frame(builder: &FrameBuilder, marker: u8) -> Frame {
        builder
            .build(
                Ipv6Addr::UNSPECIFIED,
                Ipv6Addr::UNSPECIFIED,
                FrameType::Ping,
                &[marker; 4],
                LINK_FRAME_OFFSET,
                LINK_FRAME_OVERHEAD,
            )
            .unwrap()
    }

    #[test]
    fn fallback_latency_by_address_class() {
        assert_eq!(fallback_latency(&"10.0.0.1:1".parse().unwrap()), 5);
        assert_eq!(fallback_latency(&"127.0.0.1:1".parse().unwrap()), 10);
        assert_eq!(fallback_latency(&"192.0.2.1:1".parse().unwrap()), 20);
    }

    #[test]
    fn latency_updates_saturate() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        assert_eq!(link.latency(), 10);
        link.record_latency(12);
        assert_eq!(link.latency(), 12);
        link.record_latency(1 << 40);
        assert_eq!(link.latency(), u16::MAX);
    }

    #[test]
    fn flow_control_thresholds() {
        let (link, mut queues) = test_link("127.0.0.1:4242");
        let builder = FrameBuilder::new(FramePool::new());

        for _ in 0..700 {
            link.send(ping_frame(&builder, 0));
        }
        assert_eq!(link.flow_control_indicator(), FlowControlFlag::DecreaseFlow);

        while link.send_regl.max_capacity() - link.send_regl.capacity() > 400 {
            queues.regl_rx.try_recv().unwrap();
        }
        assert_eq!(link.flow_control_indicator(), FlowControlFlag::HoldFlow);

        while link.send_regl.max_capacity() - link.send_regl.capacity() > 10 {
            queues.regl_rx.try_recv().unwrap();
        }
        assert_eq!(link.flow_control_indicator(), FlowControlFlag::IncreaseFlow);
    }

    #[test]
    fn full_queue_drops_silently() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let builder = FrameBuilder::new(FramePool::new());

        for _ in 0..SEND_QUEUE_REGULAR {
            link.send(ping_frame(&builder, 1));
        }
        assert_eq!(link.dropped_frames(), 0);

        link.send(ping_frame(&builder, 2));
        link.send(ping_frame(&builder, 3));
        assert_eq!(link.dropped_frames(), 2);
    }

    #[test]
    fn closing_link_accepts_no_frames() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let builder = FrameBuilder::new(FramePool::new());

        link.close(|| {});
        link.send(ping_frame(&builder, 1));
        link.send_priority(ping_frame(&builder, 2));
        assert_eq!(link.dropped_frames(), 2);
    }

    #[test]
    fn close_runs_log_exactly_once() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let calls = AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    link.close(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    });
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(link.is_closing());
    }

    #[tokio::test]
    async fn writer_prefers_priority_queue() {
        let (link, queues) = test_link("127.0.0.1:4242");
        let (a, b) = test_sessions();
        let (seal, _) = a.split();
        let (_, mut open) = b.split();
        let builder = FrameBuilder::new(FramePool::new());

        // Queue regular traffic first, then one priority frame, then start
        // the writer: the priority frame must hit the wire first.
        for _ in 0..SEND_QUEUE_REGULAR {
            link.send(ping_frame(&builder, 0x11));
        }
        link.send_priority(ping_frame(&builder, 0x77));

        let (local, mut remote) = tokio::io::duplex(4 * 1024 * 1024);
        let shutdown = link.subscribe_shutdown();
        let writer_link = link.clone();
        tokio::spawn(async move {
            writer(writer_link, local, seal, queues, shutdown).await;
        });

        let mut buf = vec![0u8; u16::MAX as usize];
        let n = read_length_and_data(&mut remote, &mut buf).await.unwrap();
        let mut lf = LinkFrame::new(&mut buf[..n]);
        lf.unseal(&mut open).unwrap();
        let body_marker = lf.link_data()[filament_frame::FRAME_HEADER_LEN];
        assert_eq!(body_marker, 0x77);
    }

    #[tokio::test]
    async fn reader_delivers_sealed_frames_upstream() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let (a, b) = test_sessions();
        let (mut seal, _) = a.split();
        let (_, open) = b.split();
        let pool = FramePool::new();
        let builder = FrameBuilder::new(pool.clone());

        let (upstream_tx, mut upstream_rx) = mpsc::channel(16);
        let (mut local, remote) = tokio::io::duplex(1 << 20);
        let shutdown = link.subscribe_shutdown();
        let reader_link = link.clone();
        let reader_pool = pool.clone();
        tokio::spawn(async move {
            reader(reader_link, remote, open, reader_pool, upstream_tx, shutdown).await;
        });

        let mut frame = ping_frame(&builder, 0x42);
        let data = frame
            .data_with_margins(LINK_FRAME_OFFSET, LINK_FRAME_OVERHEAD)
            .unwrap();
        LinkFrame::new(data).seal(&mut seal).unwrap();
        local.write_all(data).await.unwrap();

        let received = upstream_rx.recv().await.unwrap();
        assert_eq!(received.frame_type(), FrameType::Ping);
        assert_eq!(received.body(), &[0x42; 4]);
        assert_eq!(received.recv_label(), Some(link.switch_label()));
    }

    #[tokio::test]
    async fn reader_tolerates_forged_records_then_closes() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let (_, b) = test_sessions();
        let (_, open) = b.split();
        let pool = FramePool::new();

        let (upstream_tx, _upstream_rx) = mpsc::channel(16);
        let (mut local, remote) = tokio::io::duplex(1 << 22);
        let shutdown = link.subscribe_shutdown();
        let reader_link = link.clone();
        tokio::spawn(async move {
            reader(reader_link, remote, open, pool, upstream_tx, shutdown).await;
        });

        // A record with a valid length prefix but garbage ciphertext is a
        // non-fatal auth error.
        let mut record = vec![0u8; 64];
        record[..2].copy_from_slice(&(64u16).to_be_bytes());
        record[2..].fill(0xEE);

        local.write_all(&record).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!link.is_closing());

        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            local.write_all(&record).await.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !link.is_closing() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("link should close after repeated auth failures");
    }

    #[tokio::test]
    async fn reader_closes_on_eof() {
        let (link, _queues) = test_link("127.0.0.1:4242");
        let (_, b) = test_sessions();
        let (_, open) = b.split();
        let pool = FramePool::new();

        let (upstream_tx, _upstream_rx) = mpsc::channel(16);
        let (local, remote) = tokio::io::duplex(1024);
        let shutdown = link.subscribe_shutdown();
        let reader_link = link.clone();
        let handle = tokio::spawn(async move {
            reader(reader_link, remote, open, pool, upstream_tx, shutdown).await;
        });

        drop(local);
        handle.await.unwrap();
        assert!(link.is_closing());
    }

    #[tokio::test]
    async fn short_length_is_rejected() {
        let (mut local, mut remote) = tokio::io::duplex(1024);
        local.write_all(&3u16.to_be_bytes()).await.unwrap();

        let mut buf = vec![0u8; 128];
        let err = read_length_and_data(&mut remote, &mut buf).await.unwrap_err();
        assert!(matches!(err, LinkError::BadLength(3)));
    }

    #[tokio::test]
    async fn oversized_record_is_drained_exactly() {
        let (mut local, mut remote) = tokio::io::duplex(1 << 16);

        // A 300-byte record against a 128-byte buffer, followed by a second,
        // well-sized record. The reader must discard the first and stay
        // aligned for the second.
        let mut big = vec![0u8; 300];
        big[..2].copy_from_slice(&300u16.to_be_bytes());
        local.write_all(&big).await.unwrap();

        let mut small = vec![0xabu8; 100];
        small[..2].copy_from_slice(&100u16.to_be_bytes());
        local.write_all(&small).await.unwrap();

        let mut buf = vec![0u8; 128];
        let err = read_length_and_data(&mut remote, &mut buf).await.unwrap_err();
        assert!(matches!(err, LinkError::FrameTooBig(300)));

        let n = read_length_and_data(&mut remote, &mut buf).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf[2..100], [0xab; 98]);
    }

    #[tokio::test]
    async fn max_size_record_is_accepted() {
        let (mut local, mut remote) = tokio::io::duplex(1 << 20);

        let mut record = vec![0x55u8; u16::MAX as usize];
        record[..2].copy_from_slice(&u16::MAX.to_be_bytes());
        tokio::spawn(async move {
            let _ = local.write_all(&record).await;
        });

        let mut buf = vec![0u8; u16::MAX as usize];
        let n = read_length_and_data(&mut remote, &mut buf).await.unwrap();
        assert_eq!(n, u16::MAX as usize);
    }
}
