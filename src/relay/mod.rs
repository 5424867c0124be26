//! Chat relay: HTTP surface, provider fallback and stream normalization.
//!
//! Every valid chat request gets a `text/event-stream` answer that ends with
//! `data: [DONE]`, whichever provider (if any) produced it.

pub mod degraded;
pub mod fallback;
mod handlers;
mod server;
pub mod stream;
pub mod types;

pub use fallback::{FallbackRelay, RelayOutcome, RelaySettings};
pub use handlers::{
    parse_chat_request, GENIA_FALLBACK_HEADER, GENIA_PROVIDER_HEADER, GENIA_REQUEST_ID_HEADER,
};
pub use server::{build_http_client, create_router, run_server, AppState, RequestId};
pub use types::{ChatRequest, Message, Role, StreamEvent};
