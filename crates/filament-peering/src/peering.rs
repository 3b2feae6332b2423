//! The peering manager: live links, lookups, listeners and dialers.
//!
//! The registry keeps two consistent maps, peer address to link and switch
//! label to link. Label reservation happens under the same lock as the
//! insertion, so two concurrent setups can never claim the same label.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use filament_config::expected_frame_size;
use filament_frame::{Frame, FrameBuilder};
use filament_types::keys::PrivateKey;
use filament_types::{addr_for_key, is_routable_addr, PeeringUrl, SwitchLabel};

use crate::link::{
    read_length_and_data, start_workers, write_plain_frame, LinkBase, LinkError,
};
use crate::link_frame::LINK_FRAME_OFFSET;
use crate::setup::{PeeringSetup, SetupError, SetupErrorKind, SetupResult};

/// Wall-clock ceiling for a whole handshake.
const SETUP_DEADLINE: Duration = Duration::from_secs(30);

/// Dial timeout for outbound connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Random short labels tried for routable peers before falling back.
const SHORT_LABEL_ATTEMPTS: usize = 100;

/// Random long labels tried before giving up.
const LONG_LABEL_ATTEMPTS: usize = 1000;

/// Errors from link setup and registry operations.
#[derive(Debug, Error)]
pub enum PeeringError {
    /// A live link to this peer already exists.
    #[error("already peered with {0}")]
    DuplicatePeer(Ipv6Addr),

    /// No free switch label could be found.
    #[error("no suitable switch label found")]
    LabelExhausted,

    /// The handshake failed.
    #[error("setup: {0}")]
    Setup(#[from] SetupError),

    /// The framed transport failed during setup.
    #[error("link: {0}")]
    Link(#[from] LinkError),

    /// The handshake exceeded its wall-clock deadline.
    #[error("setup deadline exceeded")]
    Timeout,

    /// Only `tcp` peering URLs are supported.
    #[error("unsupported peering scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Registry {
    by_peer: HashMap<Ipv6Addr, Arc<LinkBase>>,
    by_label: HashMap<SwitchLabel, Arc<LinkBase>>,
    label_rng: StdRng,
}

/// The set of active links of this router.
pub struct Peering {
    identity: PrivateKey,
    address: Ipv6Addr,
    builder: FrameBuilder,
    /// Every frame a link reader accepts is handed to this channel.
    upstream: mpsc::Sender<Frame>,
    registry: Mutex<Registry>,
    shutdown: broadcast::Sender<()>,
}

impl Peering {
    /// Create a peering manager. Frames received on any link are delivered
    /// to `upstream` in per-link arrival order.
    pub fn new(
        identity: PrivateKey,
        builder: FrameBuilder,
        upstream: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        Self::with_rng(identity, builder, upstream, StdRng::from_entropy())
    }

    /// Like [`new`](Self::new) with a seeded label RNG, for deterministic
    /// tests.
    pub fn new_seeded(
        identity: PrivateKey,
        builder: FrameBuilder,
        upstream: mpsc::Sender<Frame>,
        seed: u64,
    ) -> Arc<Self> {
        Self::with_rng(identity, builder, upstream, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        identity: PrivateKey,
        builder: FrameBuilder,
        upstream: mpsc::Sender<Frame>,
        label_rng: StdRng,
    ) -> Arc<Self> {
        let address = addr_for_key(&identity.public_key());
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            identity,
            address,
            builder,
            upstream,
            registry: Mutex::new(Registry {
                by_peer: HashMap::new(),
                by_label: HashMap::new(),
                label_rng,
            }),
            shutdown,
        })
    }

    /// This router's own overlay address.
    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// The frame builder shared with the links.
    pub fn builder(&self) -> &FrameBuilder {
        &self.builder
    }

    /// Register a link: reserve a switch label and insert it into both maps.
    /// Fails if the peer is already linked or no label is free; reservation
    /// and insertion are atomic with respect to concurrent setups.
    pub fn add_link(&self, link: &Arc<LinkBase>) -> Result<(), PeeringError> {
        let mut reg = self.registry.lock();
        if reg.by_peer.contains_key(&link.peer()) {
            return Err(PeeringError::DuplicatePeer(link.peer()));
        }

        let label = assign_label(&mut reg, &link.peer()).ok_or(PeeringError::LabelExhausted)?;
        link.set_switch_label(label);
        reg.by_peer.insert(link.peer(), link.clone());
        reg.by_label.insert(label, link.clone());
        Ok(())
    }

    /// Remove a link from both maps. Idempotent; a registered replacement
    /// for the same peer is left untouched.
    pub fn remove_link(&self, link: &LinkBase) {
        let mut reg = self.registry.lock();
        if reg
            .by_peer
            .get(&link.peer())
            .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), link))
        {
            reg.by_peer.remove(&link.peer());
        }
        if reg
            .by_label
            .get(&link.switch_label())
            .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), link))
        {
            reg.by_label.remove(&link.switch_label());
        }
    }

    /// Look up the link to a peer. Closing links read as absent.
    pub fn link_by_peer(&self, peer: &Ipv6Addr) -> Option<Arc<LinkBase>> {
        self.registry
            .lock()
            .by_peer
            .get(peer)
            .filter(|l| !l.is_closing())
            .cloned()
    }

    /// Look up a link by switch label. Closing links read as absent.
    pub fn link_by_label(&self, label: SwitchLabel) -> Option<Arc<LinkBase>> {
        self.registry
            .lock()
            .by_label
            .get(&label)
            .filter(|l| !l.is_closing())
            .cloned()
    }

    /// Snapshot of all live links.
    pub fn links(&self) -> Vec<Arc<LinkBase>> {
        self.registry
            .lock()
            .by_peer
            .values()
            .filter(|l| !l.is_closing())
            .cloned()
            .collect()
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.links().len()
    }

    /// Run the setup on a fresh byte stream and, on success, start the link
    /// workers and register the link.
    pub async fn establish<S>(
        self: &Arc<Self>,
        mut stream: S,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        peering_url: PeeringUrl,
        outgoing: bool,
    ) -> Result<Arc<LinkBase>, PeeringError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let frame_size = expected_frame_size(&remote_addr);

        let result = match tokio::time::timeout(
            SETUP_DEADLINE,
            self.run_setup(&mut stream, frame_size, outgoing),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(
                    addr = %remote_addr,
                    url = %peering_url,
                    err = %err,
                    "link setup failed"
                );
                return Err(err);
            }
            Err(_) => {
                warn!(addr = %remote_addr, url = %peering_url, "link setup timed out");
                return Err(PeeringError::Timeout);
            }
        };

        let SetupResult {
            session,
            peer_key,
            peer_ip,
        } = result;

        let (link, queues) = LinkBase::new(
            peer_ip,
            peer_key,
            peering_url,
            outgoing,
            local_addr,
            remote_addr,
            frame_size,
            Arc::downgrade(self),
        );
        self.add_link(&link)?;

        info!(
            peer = %link.peer(),
            addr = %remote_addr,
            label = %link.switch_label(),
            url = %link.peering_url(),
            outgoing,
            "new link"
        );
        start_workers(
            link.clone(),
            stream,
            session,
            self.builder.pool().clone(),
            self.upstream.clone(),
            queues,
        );
        Ok(link)
    }

    /// Drive the three-message exchange over the still-unencrypted stream.
    async fn run_setup<S>(
        self: &Arc<Self>,
        stream: &mut S,
        frame_size: usize,
        outgoing: bool,
    ) -> Result<SetupResult, PeeringError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut setup = if outgoing {
            let (setup, hello) =
                PeeringSetup::initiate(self.identity.clone(), self.builder.clone())?;
            write_plain_frame(stream, hello).await?;
            setup
        } else {
            PeeringSetup::respond(self.identity.clone(), self.builder.clone())
        };

        for _ in 0..3 {
            let mut buf = self.builder.get_pooled(frame_size);
            let n = read_length_and_data(stream, &mut buf).await?;
            let frame = Frame::parse(buf, LINK_FRAME_OFFSET, n - LINK_FRAME_OFFSET)
                .map_err(LinkError::Frame)?;

            match setup.handle(frame) {
                Ok(step) => {
                    if let Some(response) = step.response {
                        write_plain_frame(stream, response).await?;
                    }
                    if step.done {
                        return Ok(setup.finalize()?);
                    }
                }
                Err(mut err) => {
                    // A rejected setup may still owe the peer an answer.
                    if let Some(response) = err.response.take() {
                        let _ = write_plain_frame(stream, response).await;
                    }
                    return Err(err.into());
                }
            }
        }
        Err(SetupError::from(SetupErrorKind::TooMuchSetup).into())
    }

    /// Accept peerings on a URL. Returns the bound address; port 0 in the
    /// URL picks a free port.
    pub async fn listen(self: &Arc<Self>, url: &PeeringUrl) -> Result<SocketAddr, PeeringError> {
        if url.scheme() != "tcp" {
            return Err(PeeringError::UnsupportedScheme(url.scheme().to_string()));
        }

        let listener = TcpListener::bind(url.addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "peering listener started");

        let peering = self.clone();
        let scheme = url.scheme().to_string();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote_addr)) => {
                            peering.spawn_inbound(stream, remote_addr, &scheme);
                        }
                        Err(err) => {
                            warn!(err = %err, "accept error, stopping listener");
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(local_addr)
    }

    fn spawn_inbound(self: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr, scheme: &str) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                debug!(addr = %remote_addr, err = %err, "dropping inbound connection");
                return;
            }
        };
        let url = PeeringUrl::new(scheme, remote_addr);
        let peering = self.clone();
        tokio::spawn(async move {
            // Setup failures are already logged by establish.
            let _ = peering
                .establish(stream, local_addr, remote_addr, url, false)
                .await;
        });
    }

    /// Dial a peering URL and set up an outbound link.
    pub async fn connect(self: &Arc<Self>, url: &PeeringUrl) -> Result<Arc<LinkBase>, PeeringError> {
        if url.scheme() != "tcp" {
            return Err(PeeringError::UnsupportedScheme(url.scheme().to_string()));
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(url.addr()))
            .await
            .map_err(|_| PeeringError::Timeout)??;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        self.establish(stream, local_addr, remote_addr, url.clone(), true)
            .await
    }

    /// Close every link and stop all listeners.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        for link in self.links() {
            link.close(|| {
                info!(peer = %link.peer(), addr = %link.remote_addr(), "closing link (shutdown)");
            });
        }
    }
}

fn assign_label(reg: &mut Registry, peer: &Ipv6Addr) -> Option<SwitchLabel> {
    // Deterministic label first: cheap and stable across reconnects.
    if let Some(label) = SwitchLabel::derive_from_ip(peer) {
        if !reg.by_label.contains_key(&label) {
            return Some(label);
        }
    }

    if is_routable_addr(peer) {
        for _ in 0..SHORT_LABEL_ATTEMPTS {
            let label = SwitchLabel::random_short(&mut reg.label_rng);
            if !reg.by_label.contains_key(&label) {
                return Some(label);
            }
        }
    }

    for _ in 0..LONG_LABEL_ATTEMPTS {
        let label = SwitchLabel::random_long(&mut reg.label_rng);
        if !reg.by_label.contains_key(&label) {
            return Some(label);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use filament_frame::{FramePool, FrameType};
    use filament_types::PublicKey;

    use crate::link::{LinkQueues, SEND_QUEUE_REGULAR};
    use crate::link_frame::LINK_FRAME_OVERHEAD;

    fn new_peering(seed: u64) -> (Arc<Peering>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let builder = FrameBuilder::new(FramePool::new());
        let peering = Peering::new_seeded(PrivateKey::generate(), builder, tx, seed);
        (peering, rx)
    }

    fn test_key() -> PublicKey {
        PrivateKey::generate().public_key()
    }

    fn make_link(peering: &Arc<Peering>, peer: Ipv6Addr) -> (Arc<LinkBase>, LinkQueues) {
        let url: PeeringUrl = "tcp://127.0.0.1:4242".parse().unwrap();
        LinkBase::new(
            peer,
            test_key(),
            url.clone(),
            false,
            "127.0.0.1:0".parse().unwrap(),
            url.addr(),
            1504,
            Arc::downgrade(peering),
        )
    }

    #[test]
    fn add_lookup_remove() {
        let (peering, _rx) = new_peering(1);
        let peer: Ipv6Addr = "fd00::1:2345".parse().unwrap();
        let (link, _queues) = make_link(&peering, peer);

        peering.add_link(&link).unwrap();
        assert_eq!(link.switch_label(), SwitchLabel::new(0x2345));
        assert!(peering.link_by_peer(&peer).is_some());
        assert!(peering.link_by_label(link.switch_label()).is_some());
        assert_eq!(peering.link_count(), 1);

        peering.remove_link(&link);
        assert!(peering.link_by_peer(&peer).is_none());
        assert!(peering.link_by_label(link.switch_label()).is_none());
        assert_eq!(peering.link_count(), 0);

        // Idempotent.
        peering.remove_link(&link);
        assert_eq!(peering.link_count(), 0);
    }

    #[test]
    fn duplicate_peer_is_rejected() {
        let (peering, _rx) = new_peering(2);
        let peer: Ipv6Addr = "fd00::77".parse().unwrap();
        let (first, _q1) = make_link(&peering, peer);
        let (second, _q2) = make_link(&peering, peer);

        peering.add_link(&first).unwrap();
        assert!(matches!(
            peering.add_link(&second),
            Err(PeeringError::DuplicatePeer(p)) if p == peer
        ));
    }

    #[test]
    fn label_collision_falls_back_to_random() {
        let (peering, _rx) = new_peering(3);
        // Same trailing bytes, so the same derived label.
        let (first, _q1) = make_link(&peering, "fd00::aa:abcd".parse().unwrap());
        let (second, _q2) = make_link(&peering, "fd00::bb:abcd".parse().unwrap());

        peering.add_link(&first).unwrap();
        peering.add_link(&second).unwrap();

        assert_eq!(first.switch_label(), SwitchLabel::new(0xabcd));
        assert_ne!(second.switch_label(), first.switch_label());
        assert!(second.switch_label().is_set());
        // Routable peer, so the fallback label comes from the short range.
        assert!(second.switch_label().raw() <= 0xff);
    }

    #[test]
    fn zero_derived_label_uses_random_path() {
        let (peering, _rx) = new_peering(4);
        let (link, _queues) = make_link(&peering, "fd00::aa:0".parse().unwrap());
        peering.add_link(&link).unwrap();
        assert!(link.switch_label().is_set());
    }

    #[test]
    fn closing_links_are_invisible_to_lookups() {
        let (peering, _rx) = new_peering(5);
        let peer: Ipv6Addr = "fd00::1:2".parse().unwrap();
        let (link, _queues) = make_link(&peering, peer);
        peering.add_link(&link).unwrap();

        // close() removes the link from the registry through the
        // back-reference; lookups must not see it either way.
        link.close(|| {});
        assert!(peering.link_by_peer(&peer).is_none());
        assert!(peering.link_by_label(link.switch_label()).is_none());
    }

    async fn establish_pair() -> (
        (Arc<Peering>, mpsc::Receiver<Frame>, Arc<LinkBase>),
        (Arc<Peering>, mpsc::Receiver<Frame>, Arc<LinkBase>),
    ) {
        let (peering_a, rx_a) = new_peering(10);
        let (peering_b, rx_b) = new_peering(11);

        let (stream_a, stream_b) = tokio::io::duplex(1 << 20);
        let url: PeeringUrl = "tcp://127.0.0.1:4242".parse().unwrap();

        let a = peering_a.clone();
        let url_a = url.clone();
        let task_a = tokio::spawn(async move {
            a.establish(
                stream_a,
                "127.0.0.1:1111".parse().unwrap(),
                "127.0.0.1:2222".parse().unwrap(),
                url_a,
                true,
            )
            .await
        });
        let b = peering_b.clone();
        let task_b = tokio::spawn(async move {
            b.establish(
                stream_b,
                "127.0.0.1:2222".parse().unwrap(),
                "127.0.0.1:1111".parse().unwrap(),
                url,
                false,
            )
            .await
        });

        let link_a = task_a.await.unwrap().unwrap();
        let link_b = task_b.await.unwrap().unwrap();
        ((peering_a, rx_a, link_a), (peering_b, rx_b, link_b))
    }

    #[tokio::test]
    async fn establish_links_both_sides() {
        let ((peering_a, _rx_a, link_a), (peering_b, mut rx_b, link_b)) = establish_pair().await;

        assert_eq!(link_a.peer(), peering_b.address());
        assert_eq!(link_b.peer(), peering_a.address());
        assert!(link_a.outgoing());
        assert!(!link_b.outgoing());
        assert!(link_a.switch_label().is_set());
        assert!(link_b.switch_label().is_set());

        // Frames sent from A arrive sealed, unseal on B and surface
        // upstream with the receiving link recorded.
        let frame = peering_a
            .builder()
            .build(
                peering_a.address(),
                link_a.peer(),
                FrameType::Data,
                b"across the link",
                LINK_FRAME_OFFSET,
                LINK_FRAME_OVERHEAD,
            )
            .unwrap();
        link_a.send(frame);

        let received = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body(), b"across the link");
        assert_eq!(received.src_ip(), peering_a.address());
        assert_eq!(received.recv_label(), Some(link_b.switch_label()));
    }

    #[tokio::test]
    async fn priority_frame_overtakes_full_regular_queue() {
        let ((peering_a, _rx_a, link_a), (_peering_b, mut rx_b, _link_b)) =
            establish_pair().await;

        let build = |marker: &[u8]| {
            peering_a
                .builder()
                .build(
                    peering_a.address(),
                    link_a.peer(),
                    FrameType::Data,
                    marker,
                    LINK_FRAME_OFFSET,
                    LINK_FRAME_OVERHEAD,
                )
                .unwrap()
        };

        // The writer is live and draining, so ordering between the first few
        // regular frames and the priority frame is not deterministic; but
        // the priority frame must overtake the bulk of a full queue.
        for _ in 0..SEND_QUEUE_REGULAR {
            link_a.send(build(b"regular"));
        }
        link_a.send_priority(build(b"priority"));

        let mut seen_before_priority = 0usize;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
                .await
                .unwrap()
                .unwrap();
            if frame.body() == b"priority" {
                break;
            }
            seen_before_priority += 1;
            assert!(
                seen_before_priority < SEND_QUEUE_REGULAR / 2,
                "priority frame did not preempt the regular queue"
            );
        }
    }

    #[tokio::test]
    async fn close_retracts_link_from_registry() {
        let ((peering_a, _rx_a, link_a), _b) = establish_pair().await;

        assert_eq!(peering_a.link_count(), 1);
        link_a.close(|| {});
        assert_eq!(peering_a.link_count(), 0);
        assert!(peering_a.link_by_peer(&link_a.peer()).is_none());
    }

    #[tokio::test]
    async fn remote_close_is_observed() {
        let ((_peering_a, _rx_a, link_a), (peering_b, _rx_b, link_b)) = establish_pair().await;

        link_a.close(|| {});
        tokio::time::timeout(Duration::from_secs(2), async {
            while !link_b.is_closing() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer should notice the closed stream");
        assert_eq!(peering_b.link_count(), 0);
    }

    #[tokio::test]
    async fn four_setup_messages_abort_the_handshake() {
        let (peering, _rx) = new_peering(20);
        let (stream, mut attacker) = tokio::io::duplex(1 << 16);
        let url: PeeringUrl = "tcp://127.0.0.1:4242".parse().unwrap();

        // A peer that keeps sending hellos instead of finishing the
        // exchange.
        let builder = FrameBuilder::new(FramePool::new());
        let identity = PrivateKey::generate();
        tokio::spawn(async move {
            for _ in 0..4 {
                let (_setup, hello) =
                    PeeringSetup::initiate(identity.clone(), builder.clone()).unwrap();
                if write_plain_frame(&mut attacker, hello).await.is_err() {
                    return;
                }
            }
        });

        let err = peering
            .establish(
                stream,
                "127.0.0.1:1111".parse().unwrap(),
                "127.0.0.1:2222".parse().unwrap(),
                url,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PeeringError::Setup(SetupError {
                kind: SetupErrorKind::UnexpectedMessage(_),
                ..
            })
        ));
        assert_eq!(peering.link_count(), 0);
    }

    #[tokio::test]
    async fn listen_and_connect_over_tcp() {
        let (peering_a, _rx_a) = new_peering(30);
        let (peering_b, _rx_b) = new_peering(31);

        let listen_url: PeeringUrl = "tcp://127.0.0.1:0".parse().unwrap();
        let bound = peering_a.listen(&listen_url).await.unwrap();

        let dial_url = PeeringUrl::new("tcp", bound);
        let link = peering_b.connect(&dial_url).await.unwrap();
        assert_eq!(link.peer(), peering_a.address());

        // The accepting side registers asynchronously.
        tokio::time::timeout(Duration::from_secs(2), async {
            while peering_a.link_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener should register the inbound link");

        peering_a.shutdown();
        peering_b.shutdown();
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let (peering, _rx) = new_peering(40);
        let url = PeeringUrl::new("quic", "127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            peering.connect(&url).await,
            Err(PeeringError::UnsupportedScheme(_))
        ));
    }
}
