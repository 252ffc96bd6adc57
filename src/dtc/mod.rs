//! DTC-style wire protocol: framing, message set, normalization, and the
//! connection lifecycle (logon, heartbeats, silence detection)

pub mod connection;
pub mod framing;
pub mod messages;
pub mod normalizer;

pub use connection::{connect, ConnectionEvent, Session};
pub use framing::{FrameCodec, WireEncoding};
pub use messages::{
    AccountBalanceUpdate, LogonStatus, NormalizedMessage, OrderUpdate, PositionUpdate, Request,
    TradeAccountResponse,
};
pub use normalizer::normalize;
