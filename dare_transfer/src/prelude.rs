pub use crate::context::TransferContext;
pub use crate::error::TransferError;
pub use crate::heap::{Chunk, Heap};
pub use crate::pool::{Pool, PoolCreateInfo};
pub use crate::scheduler::{SchedulerCreateInfo, TransferScheduler};
pub use crate::signal::{CompletionSignal, ResourceKeeper};
