mod cursors;
mod error;
mod rules;
mod storage;
mod summaries;
mod tags;

pub use error::StorageError;
pub use storage::{MessageRemap, Storage, ThreadAdoption};
pub use summaries::{ThreadAggregate, ThreadMember, ThreadPage, ThreadSummarySource};
pub use tags::StorageTagService;
