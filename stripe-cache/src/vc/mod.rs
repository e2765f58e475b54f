//! Cache "virtual connection" operations (`SPEC_FULL.md` §4.5, §5, §6):
//! the public, per-operation entry points layered on top of [`crate::stripe::Stripe`].
//!
//! Each function here is the async task a caller drives; suspension points
//! (stripe mutex contention, I/O, open-directory waits) are ordinary
//! `.await`s rather than hand-rolled continuations. [`OpenWriteGuard`]
//! carries the cancel-on-`Drop` contract of §5: dropping it before `commit`
//! unregisters the writer and leaves no partial object visible.

pub mod link_deref;
pub mod open_read;
pub mod open_write;
pub mod remove;
pub mod scan;

pub use link_deref::{deref, link};
pub use open_read::{open_io_pread, open_read};
pub use open_write::{open_write, OpenWriteGuard, WriteOptions};
pub use remove::remove;
pub use scan::{scan, ScanAction};
