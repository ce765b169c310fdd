//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod event_bus;
mod logging;
mod options;
mod replicated_log;
mod state_machine;
mod types;
mod wiring;

pub use client::RaftClient;
pub use client::RaftClientError;
pub use client::RaftStatus;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use options::RaftOptions;
pub use replicated_log::ReadError;
pub use replicated_log::ReconfigurationError;
pub use replicated_log::ReplicatedLog;
pub use replicated_log::TransferLeadershipError;
pub use replicated_log::WriteError;
pub use replicated_log::WriteInput;
pub use replicated_log::WriteOutput;
pub use state_machine::AppliedEntry;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use state_machine::StateMachineOutput;
pub use types::RaftEntryId;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftMemberInfoBlob;
pub use types::RaftMemberRole;
pub use wiring::try_create_raft_client;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
pub use wiring::RaftTransportConfig;
