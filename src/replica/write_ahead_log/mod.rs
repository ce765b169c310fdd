//! This module is a raft-specific commit log that wraps the generic commit log: typed entries,
//! commit tracking, configuration history, and compaction behind a snapshot.

mod log;
mod log_entry;

pub(crate) use log::CommittedEntry;
pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::decode_applied_invocations;
pub(crate) use log_entry::decode_configuration;
pub(crate) use log_entry::encode_applied_invocations;
pub(crate) use log_entry::encode_configuration;
pub(crate) use log_entry::EntryPayload;
pub use log_entry::WriteAheadLogEntry;
