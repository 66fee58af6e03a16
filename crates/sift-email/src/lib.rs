mod backend;
mod body;
mod error;
mod flags;
mod normalize;
mod reconcile;
mod session;
mod summary;
mod sync;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod threading;

pub use backend::{
    expand_uid_set, parse_copyuid, CopyUid, FetchParts, FolderStatus, ImapClient, ImapSettings,
    MailboxClient, PartStructure, RawFetch, RemoteFolder,
};
pub use body::BodyLoader;
pub use error::EmailError;
pub use flags::{plan_flags, FlagPlan, FlagSyncReport, FlagSynchronizer};
pub use normalize::{extract_body_text, synthetic_message_id, NormalizedEnvelope, Normalizer};
pub use reconcile::{remap_from_copyuid, MoveReconciler, SweepReport};
pub use session::MailboxSession;
pub use summary::{select_root, ThreadSummaryEngine};
pub use sync::{FolderSync, FolderSyncReport};
pub use threading::{ThreadCalculator, ThreadedBatch, MAX_THREAD_DEPTH};
