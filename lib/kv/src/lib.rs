pub mod error;
pub mod memory;
pub mod traits;
pub mod valkey;

pub use error::KvError;
pub use memory::MemoryStore;
pub use traits::{KeyValueStore, PubSubMessage, StreamEntry};
pub use valkey::ValkeyStore;
