//! Socket Bridge: the host-side muxer that carries SSH/GPG agent traffic
//! into an agent container over `docker exec` stdio.

mod manager;
mod protocol;
mod session;

pub use manager::BridgeManager;
pub use protocol::{Frame, FrameType, PROTOCOL_VERSION, SOCKET_TYPE_GPG, SOCKET_TYPE_SSH};
pub use session::{SocketBridge, HELPER_COMMAND};
