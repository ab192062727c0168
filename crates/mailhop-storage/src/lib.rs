mod error;
mod kv;
mod storage;

pub use error::StorageError;
pub use kv::KvStore;
pub use storage::Storage;
