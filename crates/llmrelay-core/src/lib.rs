//! The Dispatcher and everything it needs: request buffering,
//! header forwarding, the pooled upstream client, streaming relay, the
//! cross-dialect bridge, and unified gateway mode.

pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod request;
pub mod stream;
pub mod upstream;

pub use dispatcher::{Dispatcher, RelayedResponse};
pub use error::{AttemptOutcome, DispatchError, ErrorKind};
pub use gateway::GatewayConfig;
pub use request::{ClientMeta, Endpoint, InboundRequest};
pub use upstream::{UpstreamClient, UpstreamResponse, WreqUpstreamClient};
