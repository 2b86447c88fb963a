//! GPU buffer memory pools and the transfer scheduler that feeds them.
//!
//! A [`Pool`] hands out [`Chunk`]s of large device buffers ([`Heap`]s). Writes go to a host
//! mirror of each heap and are moved to the device in one batched pass per frame with
//! [`Pool::upload`]. The [`TransferScheduler`] gives every thread its own command buffers to
//! record transfers into and submits all of them at once.
pub mod context;
pub mod error;
pub mod heap;
pub mod pool;
pub mod prelude;
pub mod scheduler;
pub mod signal;
mod util;

pub use context::TransferContext;
pub use error::TransferError;
pub use heap::{AllocatedRange, Chunk, Heap, InFlightUpload, SlotMask, UploadRange};
pub use pool::{HeapStats, Pool, PoolCreateInfo};
pub use scheduler::{SchedulerCreateInfo, TransferScheduler};
pub use signal::{CompletionSignal, ResourceKeeper};
