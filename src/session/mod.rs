//! Per-connection push transport state

mod backoff;
pub mod protocol;
mod registry;
mod session;

pub use backoff::ViolationBackoff;
pub use protocol::{FrameError, InboundFrame, OutboundFrame, parse_inbound};
pub use registry::{SessionCommand, SessionRegistry, SessionSender, spawn_push_relay};
pub use session::{
    AgentSession, AllowAllAuth, AuthValidator, ChannelPeer, ChannelTransport, FrameTransport,
    LogMetricsSink, MetricsSink, SessionContext, TransportError, channel_transport,
};
