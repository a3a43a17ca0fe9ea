//! SQLite-backed persistence for keel.
//!
//! Two stores live here:
//!
//! 1. **Session journal** ([`EventStore`]): an append-only mirror of every
//!    conversation turn, keyed by session. It is an audit trail: the agent
//!    never reads it back while running, and a journal write failure never
//!    stops a conversation.
//!
//! 2. **Knowledge store** ([`KnowledgeStore`]): text chunks grouped under
//!    knowledge labels, consumed by the keyword retriever.
//!
//! # Example
//!
//! ```no_run
//! use storage::{Event, EventKind, EventStore, Role, SessionId};
//!
//! let store = EventStore::open("events.db")?;
//!
//! let session_id = SessionId::new();
//! store.append(&Event::new(session_id, EventKind::SessionStart))?;
//! store.append(&Event::message(session_id, Role::User, "Hello"))?;
//!
//! for event in store.load_session(session_id)? {
//!     println!("{}: {:?}", event.timestamp, event.kind);
//! }
//!
//! for summary in store.list_sessions()? {
//!     println!("{}: {} messages", summary.id, summary.message_count);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod knowledge;
mod store;

pub use error::{Error, Result};
pub use event::{Event, EventKind, Role, SessionId};
pub use knowledge::{Chunk, KnowledgeStore};
pub use store::{EventStore, SessionSummary};
