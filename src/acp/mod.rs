//! Agent Client Protocol (ACP) stream handling.
//!
//! Bidirectional JSON-RPC over newline-delimited JSON with one agent
//! process:
//! - `message`: wire envelope and message classification.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing.
//! - `transport`: request/response correlation, inbound dispatch and the
//!   process-error side channel.
//! - `spawner`: process spawning with environment isolation and stdio capture.

pub mod codec;
pub mod message;
pub mod spawner;
pub mod transport;
