pub mod key;
pub mod store;

pub use key::StorageKey;
pub use store::{ContentStore, FsContentStore};
