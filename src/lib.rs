mod actor;
mod api;
mod commitlog;
mod replica;
mod server;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::create_root_logger_for_file;
pub use api::create_root_logger_for_stdout;
pub use api::try_create_raft_client;
pub use api::AppliedEntry;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftClientError;
pub use api::RaftElectionState;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftMemberInfoBlob;
pub use api::RaftMemberRole;
pub use api::RaftOptions;
pub use api::RaftStatus;
pub use api::RaftTransportConfig;
pub use api::ReadError;
pub use api::ReconfigurationError;
pub use api::ReplicatedLog;
pub use api::StateMachine;
pub use api::StateMachineError;
pub use api::StateMachineOutput;
pub use api::TransferLeadershipError;
pub use api::WriteError;
pub use api::WriteInput;
pub use api::WriteOutput;
pub use commitlog::Entry;
pub use commitlog::InMemoryLog;
pub use commitlog::Index;
pub use commitlog::Log;
pub use replica::WriteAheadLogEntry;
pub use transport::LocalNetwork;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
