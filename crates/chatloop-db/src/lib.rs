pub mod guard;
pub mod session_store;
pub mod store;

pub use guard::{MessagePersistenceGuard, PersistenceKey};
pub use session_store::{SessionStore, StoredMessage};
pub use store::{MessageStore, NewMessage, PersistedMessage, SqliteMessageStore};
