//! Model backends.
//!
//! Each backend implements [`Model`](crate::Model) for one family of
//! completion APIs.

mod openai;

pub use openai::{OpenAiBackend, OpenAiBackendBuilder};
