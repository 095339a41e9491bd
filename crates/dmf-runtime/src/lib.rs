pub mod channel;
pub mod env;
pub mod handle;
pub mod tag;
pub mod task_manager;

pub use channel::Channel;
pub use env::{DeletionPolicy, Environment};
pub use handle::{HandleKey, HandleTable, RemoteVar};
pub use tag::{Tag, TagAllocator};
pub use task_manager::{Rank, TaskInfo, TaskManager};
