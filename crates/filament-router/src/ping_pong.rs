//! The ping/pong liveness probe.
//!
//! The simplest concrete [`PingHandler`]: send `{"msg":"ping"}`, get
//! `{"msg":"pong"}` back under the same ping ID, and fire a one-shot
//! completion signal. Outstanding requests expire after 30 seconds; callers
//! waiting on the signal must apply their own timeout and treat a dead
//! signal as "peer unreachable".

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use filament_frame::Frame;

use crate::router::{new_ping_id, PingError, PingHandler, PingHeader, Router};

/// Type string of the ping/pong probe.
pub const PING_PONG_TYPE: &str = "pong";

/// How long an outstanding request is kept before `clean` evicts it.
const PING_EXPIRY: Duration = Duration::from_secs(30);

/// Payload of both the request and the response.
#[derive(Debug, Serialize, Deserialize)]
struct PingPongMsg {
    #[serde(default)]
    msg: String,
}

/// State of one outstanding ping request.
struct PingPongState {
    started: Instant,
    notify: oneshot::Sender<()>,
    expires: Instant,
}

/// Liveness and RTT probe over the ping frame family.
pub struct PingPongHandler {
    router: Weak<Router>,
    active: Mutex<HashMap<u64, PingPongState>>,
}

impl PingPongHandler {
    pub fn new(router: &Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::downgrade(router),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Send a ping to a directly linked peer. The returned signal fires once
    /// when the matching pong arrives; it errors out if the request expires
    /// first.
    pub fn send(&self, dst: Ipv6Addr) -> Result<oneshot::Receiver<()>, PingError> {
        let router = self.router.upgrade().ok_or(PingError::RouterStopped)?;

        let data = serde_json::to_vec(&PingPongMsg {
            msg: "ping".to_string(),
        })?;
        let (notify, signal) = oneshot::channel();
        let ping_id = new_ping_id();
        router.send_ping_msg(dst, ping_id, PING_PONG_TYPE, &data, false, false)?;

        // The ping is on its way, remember it.
        self.set_active(
            ping_id,
            PingPongState {
                started: Instant::now(),
                notify,
                expires: Instant::now() + PING_EXPIRY,
            },
        );
        Ok(signal)
    }

    /// Number of outstanding requests, for observability.
    pub fn active_requests(&self) -> usize {
        self.active.lock().len()
    }

    fn set_active(&self, ping_id: u64, state: PingPongState) {
        self.active.lock().insert(ping_id, state);
    }

    fn pluck_active(&self, ping_id: u64) -> Option<PingPongState> {
        self.active.lock().remove(&ping_id)
    }

    fn handle_request(&self, frame: Frame, header: &PingHeader, data: &[u8]) -> Result<(), PingError> {
        let request: PingPongMsg = serde_json::from_slice(data)?;
        if request.msg != "ping" {
            return Err(PingError::InvalidRequest);
        }

        let router = self.router.upgrade().ok_or(PingError::RouterStopped)?;
        let data = serde_json::to_vec(&PingPongMsg {
            msg: "pong".to_string(),
        })?;
        router.send_ping_msg(
            frame.src_ip(),
            header.ping_id,
            PING_PONG_TYPE,
            &data,
            true,
            false,
        )
    }

    fn handle_response(&self, frame: Frame, header: &PingHeader, data: &[u8]) -> Result<(), PingError> {
        let state = self.pluck_active(header.ping_id).ok_or(PingError::NoState)?;

        let response: PingPongMsg = serde_json::from_slice(data)?;
        if response.msg != "pong" {
            return Err(PingError::InvalidResponse);
        }

        // Half the round trip approximates the one-way latency of the
        // receiving link.
        if let Some(router) = self.router.upgrade() {
            if let Some(label) = frame.recv_label() {
                if let Some(link) = router.peering().link_by_label(label) {
                    link.record_latency((state.started.elapsed() / 2).as_millis() as u64);
                }
            }
        }

        // The receiver may have given up already; that is fine.
        let _ = state.notify.send(());
        Ok(())
    }
}

#[async_trait]
impl PingHandler for PingPongHandler {
    fn ping_type(&self) -> &'static str {
        PING_PONG_TYPE
    }

    async fn handle(
        &self,
        frame: Frame,
        header: &PingHeader,
        data: &[u8],
    ) -> Result<(), PingError> {
        if header.follow_up {
            self.handle_response(frame, header, data)
        } else {
            self.handle_request(frame, header, data)
        }
    }

    fn clean(&self) {
        let now = Instant::now();
        // Dropping an evicted state drops its sender, which wakes the
        // waiting caller with an error.
        self.active.lock().retain(|_, state| state.expires > now);
    }
}
