mod lock;
mod state;

pub use lock::{LockError, StateLock};
pub use state::{load_or_empty, JsonStateStore, PersistError, RelayState, StateStore};
