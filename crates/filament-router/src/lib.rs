//! The router: consumes frames from the peering layer and dispatches them.
//!
//! The only protocol family implemented here is the in-router ping: short
//! request/response exchanges correlated by a 64-bit ping ID, multiplexed to
//! pluggable [`PingHandler`]s by a type string. The [`PingPongHandler`] is
//! the liveness probe built on top of it.

pub mod ping_pong;
pub mod router;

pub use ping_pong::{PingPongHandler, PING_PONG_TYPE};
pub use router::{new_ping_id, PingError, PingHandler, PingHeader, Router};
