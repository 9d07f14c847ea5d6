//! CMMS Core - multiplexed duplex RPC transport with server push.
//!
//! A single ordered byte stream carries many concurrent request/response
//! calls plus unsolicited server pushes. Calls are matched to replies by
//! sequence number; sequence zero is reserved for push.
//!
//! # Example
//!
//! ```rust,ignore
//! use cmms_core::{LogoutHooks, RpcClient};
//!
//! #[tokio::main]
//! async fn main() -> cmms_core::Result<()> {
//!     let client = RpcClient::builder()
//!         .on_push("Notice", |_method: &str, payload: &str| println!("notice: {}", payload))
//!         .logout_hooks(LogoutHooks::new(|| println!("session ended")))
//!         .connect("127.0.0.1:8080")
//!         .await?;
//!
//!     let users: serde_json::Value = client
//!         .call_on_channel("User.List", serde_json::Value::Null)
//!         .await?;
//!     println!("{}", users);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod demux;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::{ClientBuilder, RpcClient};
pub use codec::{CodecReader, CodecWriter, ResponseBody};
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use demux::{PendingCalls, Routed, SequenceAllocator};
pub use dispatch::{Delivery, PushHandler, PushRegistry};
pub use error::{Result, TransportError};
pub use lifecycle::{ConnectionState, CountdownHandle, LogoutCountdown, LogoutHooks};
pub use protocol::{ChannelId, Inbound, RequestHeader, ResponseFrame, ResponseHeader, PUSH_SEQ};
pub use server::{CallContext, RpcDispatch, RpcServer, RpcServerHandle};
pub use session::{ChannelRegistry, SessionState};
