#![forbid(unsafe_code)]
#![doc = r#"
Buddyrelay

Serve the OpenAI Chat Completions API on top of a streaming-only chat backend,
spreading requests across a pool of bearer-token credentials.

Crate highlights
- Credential pool: one JSON file per credential, round-robin rotation with a
  per-credential quota, manual pinning and expiry-aware skipping.
- Translation: client messages are normalized into the backend dialect
  (tool-block repair, role remapping, minimum message count, phrase rewrites).
- Streaming: backend SSE is either forwarded as-is or folded into one
  `chat.completion` object, including fragmented tool-call arguments.

Modules
- `models`: Chat Completions request models.
- `credentials`: credential records and the directory-backed store.
- `rotation`: credential selection policy.
- `usage`: per-model and per-credential counters.
- `conversion`: message translation into the backend dialect.
- `stream`: SSE line handling, pass-through and fold.
- `orchestrator`: per-request flow and the backend transport seam.
- `server`: actix-web routes.
- `util`: tracing, HTTP client, shared state.
"#]

pub mod auth;
pub mod config;
pub mod conversion;
pub mod credentials;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod rotation;
pub mod server;
pub mod stream;
pub mod usage;
pub mod util;

pub use crate::config::Settings;
pub use crate::conversion::{MessageTranslator, RewriteRule};
pub use crate::credentials::{Credential, CredentialRecord, CredentialStore, StoreError};
pub use crate::error::ProxyError;
pub use crate::orchestrator::{
    Completion, ConversationHints, HttpUpstream, OutboundRequest, RequestOrchestrator, Upstream,
};
pub use crate::rotation::{CredentialRotator, RotationError, RotationMode, RotationStatus};
pub use crate::stream::{fold_stream, passthrough, AggregateError, FoldAggregator};
pub use crate::usage::{UsageRecorder, UsageSnapshot};

// Re-export the chat model namespace (`use buddyrelay::chat`).
pub use crate::models::chat;
