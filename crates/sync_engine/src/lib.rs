//! Live thread synchronization for the staff consoles: one engine per staff
//! identity keeps hydrated history, pushed events and local sends in a single
//! deduplicated store.

pub mod api;
pub mod attachment;
pub mod config;
pub mod connection;
pub mod console;
pub mod engine;
pub mod error;
pub mod join;
pub mod ledger;
pub mod normalizer;
pub mod retry;
pub mod send;
pub mod store;
pub mod types;

pub use api::{PortalApi, RestClient, UserDirectory};
pub use config::{load_config, EngineConfig};
pub use connection::{ConnectionManager, PushTransport, WebSocketTransport};
pub use console::{Capabilities, ConsoleAction, ConsoleAdapter};
pub use engine::{EngineHandle, EngineSeams, Identity};
pub use error::{ConfigError, ConnectionError, EngineClosed, NormalizeError, SendError};
pub use send::ComposeDraft;
pub use store::{HydrateReport, MergeOutcome, StoreSnapshot};
pub use types::{Attachment, AttachmentUpload, CounterpartMeta, EngineNotice, Message, Thread};
