mod configuration_manager;
mod raft_configuration;

pub(crate) use configuration_manager::ConfigurationManager;
pub(crate) use raft_configuration::PeerConfiguration;
pub(crate) use raft_configuration::RaftConfiguration;
