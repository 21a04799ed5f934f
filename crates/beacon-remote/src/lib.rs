pub mod error;
pub mod memory;
pub mod path;
pub mod store;
pub mod wire;

pub use error::{DecodeError, RemoteError};
pub use memory::MemoryRemote;
pub use path::RemotePath;
pub use store::{RemoteEvent, RemoteStore, Subscription};
pub use wire::{WireConversation, WireMessage, WireStatus};
