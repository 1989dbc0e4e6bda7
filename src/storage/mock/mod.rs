//! In-memory storage backend
//!
//! Stores and indexes live in process memory and persist through framed
//! files (see [`crate::storage::codec`]). Used as the default backend and
//! by every test.

pub mod backend;
pub mod index;
pub mod store;

pub use backend::MockBackend;
pub use index::{MockReadonlyIndex, MockWritableIndex};
pub use store::{MockReadonlyStore, MockWritableStore};
