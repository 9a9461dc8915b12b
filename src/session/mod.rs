//! Persisted multi-turn session.
//!
//! The session holds the ordered message history sent to the provider for
//! the active model/provider pair. It survives server restarts through a
//! single JSON file in the project's tool-state directory.
//!
//! # Example
//!
//! ```rust
//! use overlay_agent::llm::Message;
//! use overlay_agent::session::SessionStore;
//!
//! # tokio_test_block(async {
//! let store = SessionStore::in_memory();
//! let outbound = store.begin_turn("Add a dark mode toggle").await;
//! assert_eq!(outbound.len(), 1);
//! store.append(vec![Message::assistant("Done.")]).await;
//! assert_eq!(store.messages().await.len(), 2);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
//! # }
//! ```

mod store;

pub use store::{SESSION_FILE_NAME, SessionState, SessionStore};
