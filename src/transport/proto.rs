//! Conversions between the replica's RPC types and their protobuf form. Shared by the gRPC client
//! (`GrpcTransport`) and the gRPC server.
use crate::commitlog::Index;
use crate::grpc::{
    proto_append_entries_result, proto_append_entries_success, proto_install_snapshot_result,
    proto_install_snapshot_success, proto_read_index_result, proto_request_vote_result,
    proto_start_leader_election_result, ProtoAlreadyInstalled, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoAppendEntriesSuccess, ProtoAppended, ProtoChunkAccepted, ProtoInconsistency, ProtoInstallSnapshotReq,
    ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess, ProtoNotLeader, ProtoReadIndexReq, ProtoReadIndexResult,
    ProtoReadIndexSuccess, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoSnapshotInstalled, ProtoSnapshotRejected, ProtoStartLeaderElectionReq, ProtoStartLeaderElectionResult,
    ProtoStartLeaderElectionSuccess, ProtoTermIndex,
};
use crate::replica::{
    decode_applied_invocations, decode_configuration, encode_applied_invocations, encode_configuration,
    AppendEntriesOutcome, AppendEntriesReply, AppendEntriesRequest,
    InstallSnapshotOutcome, InstallSnapshotReply, InstallSnapshotRequest, ReadIndexReply, ReadIndexRequest,
    ReplicaId, RequestVoteReply, RequestVoteRequest, RpcHandlerError, StartLeaderElectionReply,
    StartLeaderElectionRequest, Term, TermIndex, WriteAheadLogEntry,
};
use crate::transport::TransportError;
use bytes::{Bytes, BytesMut};
use std::convert::TryFrom;

/// An inbound request that doesn't make sense. The server answers it with `InvalidArgument`.
#[derive(Debug, thiserror::Error)]
#[error("Malformed request: {0}")]
pub(crate) struct ProtoConversionError(String);

fn term_index_from_proto(term_index: Option<ProtoTermIndex>) -> Result<Option<TermIndex>, String> {
    match term_index {
        None => Ok(None),
        Some(ProtoTermIndex { term, index }) => TermIndex::from_u64s(term, index).map_err(String::from),
    }
}

fn term_index_to_proto(term_index: Option<TermIndex>) -> Option<ProtoTermIndex> {
    let (term, index) = TermIndex::to_u64s(term_index);
    Some(ProtoTermIndex { term, index })
}

fn server_fault(error: RpcHandlerError) -> ProtoServerFault {
    ProtoServerFault {
        message: error.to_string(),
    }
}

// ------- RequestVote -------

impl From<RequestVoteRequest> for ProtoRequestVoteReq {
    fn from(request: RequestVoteRequest) -> Self {
        ProtoRequestVoteReq {
            client_node_id: request.candidate_id.into_inner(),
            term: request.candidate_term.as_u64(),
            last_log_entry: term_index_to_proto(request.candidate_last_entry),
            pre_vote: request.pre_vote,
        }
    }
}

impl TryFrom<ProtoRequestVoteReq> for RequestVoteRequest {
    type Error = ProtoConversionError;

    fn try_from(request: ProtoRequestVoteReq) -> Result<Self, Self::Error> {
        Ok(RequestVoteRequest {
            candidate_id: ReplicaId::new(request.client_node_id),
            candidate_term: Term::new(request.term),
            candidate_last_entry: term_index_from_proto(request.last_log_entry).map_err(ProtoConversionError)?,
            pre_vote: request.pre_vote,
        })
    }
}

impl From<Result<RequestVoteReply, RpcHandlerError>> for ProtoRequestVoteResult {
    fn from(result: Result<RequestVoteReply, RpcHandlerError>) -> Self {
        let result = match result {
            Ok(reply) => proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                term: reply.term.as_u64(),
                vote_granted: reply.vote_granted,
                should_shutdown: reply.should_shutdown,
                last_log_entry: term_index_to_proto(reply.last_entry),
            }),
            Err(e) => proto_request_vote_result::Result::Err(server_fault(e)),
        };

        ProtoRequestVoteResult { result: Some(result) }
    }
}

impl TryFrom<ProtoRequestVoteResult> for RequestVoteReply {
    type Error = TransportError;

    fn try_from(result: ProtoRequestVoteResult) -> Result<Self, Self::Error> {
        match result.result {
            Some(proto_request_vote_result::Result::Ok(ok)) => Ok(RequestVoteReply {
                term: Term::new(ok.term),
                vote_granted: ok.vote_granted,
                should_shutdown: ok.should_shutdown,
                last_entry: term_index_from_proto(ok.last_log_entry).map_err(TransportError::Malformed)?,
            }),
            Some(proto_request_vote_result::Result::Err(fault)) => Err(TransportError::ServerFault(fault.message)),
            None => Err(TransportError::Malformed("RequestVote result missing".into())),
        }
    }
}

// ------- AppendEntries -------

impl From<AppendEntriesRequest> for ProtoAppendEntriesReq {
    fn from(request: AppendEntriesRequest) -> Self {
        ProtoAppendEntriesReq {
            client_node_id: request.leader_id.into_inner(),
            term: request.leader_term.as_u64(),
            previous_log_entry: term_index_to_proto(request.previous_log_entry),
            commit_index: request.leader_commit_index.map(|i| i.as_u64()).unwrap_or(0),
            new_entries: request.entries.iter().map(|e| e.encode().to_vec()).collect(),
            call_id: request.call_id,
            is_heartbeat: request.is_heartbeat,
        }
    }
}

impl TryFrom<ProtoAppendEntriesReq> for AppendEntriesRequest {
    type Error = ProtoConversionError;

    fn try_from(request: ProtoAppendEntriesReq) -> Result<Self, Self::Error> {
        let mut entries = Vec::with_capacity(request.new_entries.len());
        for bytes in request.new_entries {
            let entry = WriteAheadLogEntry::decode(Bytes::from(bytes))
                .map_err(|e| ProtoConversionError(format!("Bad log entry: {}", e)))?;
            entries.push(entry);
        }

        Ok(AppendEntriesRequest {
            leader_id: ReplicaId::new(request.client_node_id),
            leader_term: Term::new(request.term),
            previous_log_entry: term_index_from_proto(request.previous_log_entry).map_err(ProtoConversionError)?,
            leader_commit_index: Index::from_u64_or_none(request.commit_index),
            entries,
            call_id: request.call_id,
            is_heartbeat: request.is_heartbeat,
        })
    }
}

impl From<Result<AppendEntriesReply, RpcHandlerError>> for ProtoAppendEntriesResult {
    fn from(result: Result<AppendEntriesReply, RpcHandlerError>) -> Self {
        let result = match result {
            Ok(reply) => {
                let outcome = match reply.outcome {
                    AppendEntriesOutcome::Success => proto_append_entries_success::Outcome::Appended(ProtoAppended {}),
                    AppendEntriesOutcome::NotLeader => {
                        proto_append_entries_success::Outcome::NotLeader(ProtoNotLeader {})
                    }
                    AppendEntriesOutcome::Inconsistency => {
                        proto_append_entries_success::Outcome::Inconsistency(ProtoInconsistency {})
                    }
                };
                proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                    term: reply.term.as_u64(),
                    next_index: reply.next_index.as_u64(),
                    match_index: reply.match_index.map(|i| i.as_u64()).unwrap_or(0),
                    follower_commit: reply.follower_commit.map(|i| i.as_u64()).unwrap_or(0),
                    call_id: reply.call_id,
                    is_heartbeat: reply.is_heartbeat,
                    outcome: Some(outcome),
                })
            }
            Err(e) => proto_append_entries_result::Result::Err(server_fault(e)),
        };

        ProtoAppendEntriesResult { result: Some(result) }
    }
}

impl TryFrom<ProtoAppendEntriesResult> for AppendEntriesReply {
    type Error = TransportError;

    fn try_from(result: ProtoAppendEntriesResult) -> Result<Self, Self::Error> {
        let ok = match result.result {
            Some(proto_append_entries_result::Result::Ok(ok)) => ok,
            Some(proto_append_entries_result::Result::Err(fault)) => {
                return Err(TransportError::ServerFault(fault.message))
            }
            None => return Err(TransportError::Malformed("AppendEntries result missing".into())),
        };

        let outcome = match ok.outcome {
            Some(proto_append_entries_success::Outcome::Appended(_)) => AppendEntriesOutcome::Success,
            Some(proto_append_entries_success::Outcome::NotLeader(_)) => AppendEntriesOutcome::NotLeader,
            Some(proto_append_entries_success::Outcome::Inconsistency(_)) => AppendEntriesOutcome::Inconsistency,
            None => return Err(TransportError::Malformed("AppendEntries outcome missing".into())),
        };
        let next_index = Index::from_u64_or_none(ok.next_index)
            .ok_or_else(|| TransportError::Malformed("AppendEntries next index is 0".into()))?;

        Ok(AppendEntriesReply {
            term: Term::new(ok.term),
            next_index,
            match_index: Index::from_u64_or_none(ok.match_index),
            follower_commit: Index::from_u64_or_none(ok.follower_commit),
            call_id: ok.call_id,
            is_heartbeat: ok.is_heartbeat,
            outcome,
        })
    }
}

// ------- InstallSnapshot -------

impl From<InstallSnapshotRequest> for ProtoInstallSnapshotReq {
    fn from(request: InstallSnapshotRequest) -> Self {
        let mut configuration = BytesMut::new();
        encode_configuration(&request.configuration, &mut configuration);
        let mut applied_invocations = BytesMut::new();
        encode_applied_invocations(&request.applied_invocations, &mut applied_invocations);

        ProtoInstallSnapshotReq {
            client_node_id: request.leader_id.into_inner(),
            term: request.leader_term.as_u64(),
            last_included: term_index_to_proto(Some(request.last_included)),
            configuration: configuration.to_vec(),
            request_index: request.request_index,
            data: request.data.to_vec(),
            done: request.done,
            applied_invocations: applied_invocations.to_vec(),
        }
    }
}

impl TryFrom<ProtoInstallSnapshotReq> for InstallSnapshotRequest {
    type Error = ProtoConversionError;

    fn try_from(request: ProtoInstallSnapshotReq) -> Result<Self, Self::Error> {
        let last_included = term_index_from_proto(request.last_included)
            .map_err(ProtoConversionError)?
            .ok_or_else(|| ProtoConversionError("Snapshot must include at least one entry".into()))?;
        let configuration = decode_configuration(&mut Bytes::from(request.configuration))
            .map_err(|e| ProtoConversionError(format!("Bad configuration: {}", e)))?;
        let applied_invocations = decode_applied_invocations(&mut Bytes::from(request.applied_invocations))
            .map_err(|e| ProtoConversionError(format!("Bad applied invocations: {}", e)))?;

        Ok(InstallSnapshotRequest {
            leader_id: ReplicaId::new(request.client_node_id),
            leader_term: Term::new(request.term),
            last_included,
            configuration,
            applied_invocations,
            request_index: request.request_index,
            data: Bytes::from(request.data),
            done: request.done,
        })
    }
}

impl From<Result<InstallSnapshotReply, RpcHandlerError>> for ProtoInstallSnapshotResult {
    fn from(result: Result<InstallSnapshotReply, RpcHandlerError>) -> Self {
        use proto_install_snapshot_success::Outcome;

        let result = match result {
            Ok(reply) => {
                let outcome = match reply.outcome {
                    InstallSnapshotOutcome::ChunkAccepted => Outcome::ChunkAccepted(ProtoChunkAccepted {}),
                    InstallSnapshotOutcome::SnapshotInstalled => Outcome::SnapshotInstalled(ProtoSnapshotInstalled {}),
                    InstallSnapshotOutcome::AlreadyInstalled => Outcome::AlreadyInstalled(ProtoAlreadyInstalled {}),
                    InstallSnapshotOutcome::NotLeader => Outcome::NotLeader(ProtoNotLeader {}),
                    InstallSnapshotOutcome::Rejected(message) => Outcome::Rejected(ProtoSnapshotRejected { message }),
                };
                proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                    term: reply.term.as_u64(),
                    request_index: reply.request_index,
                    snapshot_index: reply.snapshot_index.map(|i| i.as_u64()).unwrap_or(0),
                    outcome: Some(outcome),
                })
            }
            Err(e) => proto_install_snapshot_result::Result::Err(server_fault(e)),
        };

        ProtoInstallSnapshotResult { result: Some(result) }
    }
}

impl TryFrom<ProtoInstallSnapshotResult> for InstallSnapshotReply {
    type Error = TransportError;

    fn try_from(result: ProtoInstallSnapshotResult) -> Result<Self, Self::Error> {
        use proto_install_snapshot_success::Outcome;

        let ok = match result.result {
            Some(proto_install_snapshot_result::Result::Ok(ok)) => ok,
            Some(proto_install_snapshot_result::Result::Err(fault)) => {
                return Err(TransportError::ServerFault(fault.message))
            }
            None => return Err(TransportError::Malformed("InstallSnapshot result missing".into())),
        };

        let outcome = match ok.outcome {
            Some(Outcome::ChunkAccepted(_)) => InstallSnapshotOutcome::ChunkAccepted,
            Some(Outcome::SnapshotInstalled(_)) => InstallSnapshotOutcome::SnapshotInstalled,
            Some(Outcome::AlreadyInstalled(_)) => InstallSnapshotOutcome::AlreadyInstalled,
            Some(Outcome::NotLeader(_)) => InstallSnapshotOutcome::NotLeader,
            Some(Outcome::Rejected(rejected)) => InstallSnapshotOutcome::Rejected(rejected.message),
            None => return Err(TransportError::Malformed("InstallSnapshot outcome missing".into())),
        };

        Ok(InstallSnapshotReply {
            term: Term::new(ok.term),
            request_index: ok.request_index,
            snapshot_index: Index::from_u64_or_none(ok.snapshot_index),
            outcome,
        })
    }
}

// ------- StartLeaderElection -------

impl From<StartLeaderElectionRequest> for ProtoStartLeaderElectionReq {
    fn from(request: StartLeaderElectionRequest) -> Self {
        ProtoStartLeaderElectionReq {
            client_node_id: request.leader_id.into_inner(),
            leader_last_entry: term_index_to_proto(request.leader_last_entry),
        }
    }
}

impl TryFrom<ProtoStartLeaderElectionReq> for StartLeaderElectionRequest {
    type Error = ProtoConversionError;

    fn try_from(request: ProtoStartLeaderElectionReq) -> Result<Self, Self::Error> {
        Ok(StartLeaderElectionRequest {
            leader_id: ReplicaId::new(request.client_node_id),
            leader_last_entry: term_index_from_proto(request.leader_last_entry).map_err(ProtoConversionError)?,
        })
    }
}

impl From<Result<StartLeaderElectionReply, RpcHandlerError>> for ProtoStartLeaderElectionResult {
    fn from(result: Result<StartLeaderElectionReply, RpcHandlerError>) -> Self {
        let result = match result {
            Ok(reply) => proto_start_leader_election_result::Result::Ok(ProtoStartLeaderElectionSuccess {
                accepted: reply.accepted,
            }),
            Err(e) => proto_start_leader_election_result::Result::Err(server_fault(e)),
        };

        ProtoStartLeaderElectionResult { result: Some(result) }
    }
}

impl TryFrom<ProtoStartLeaderElectionResult> for StartLeaderElectionReply {
    type Error = TransportError;

    fn try_from(result: ProtoStartLeaderElectionResult) -> Result<Self, Self::Error> {
        match result.result {
            Some(proto_start_leader_election_result::Result::Ok(ok)) => Ok(StartLeaderElectionReply {
                accepted: ok.accepted,
            }),
            Some(proto_start_leader_election_result::Result::Err(fault)) => {
                Err(TransportError::ServerFault(fault.message))
            }
            None => Err(TransportError::Malformed("StartLeaderElection result missing".into())),
        }
    }
}

// ------- ReadIndex -------

impl From<ReadIndexRequest> for ProtoReadIndexReq {
    fn from(request: ReadIndexRequest) -> Self {
        ProtoReadIndexReq {
            client_node_id: request.requestor_id.into_inner(),
        }
    }
}

impl From<ProtoReadIndexReq> for ReadIndexRequest {
    fn from(request: ProtoReadIndexReq) -> Self {
        ReadIndexRequest {
            requestor_id: ReplicaId::new(request.client_node_id),
        }
    }
}

impl From<ReadIndexReply> for ProtoReadIndexResult {
    fn from(reply: ReadIndexReply) -> Self {
        ProtoReadIndexResult {
            result: Some(proto_read_index_result::Result::Ok(ProtoReadIndexSuccess {
                success: reply.success,
                read_index: reply.read_index.map(|i| i.as_u64()).unwrap_or(0),
            })),
        }
    }
}

impl TryFrom<ProtoReadIndexResult> for ReadIndexReply {
    type Error = TransportError;

    fn try_from(result: ProtoReadIndexResult) -> Result<Self, Self::Error> {
        match result.result {
            Some(proto_read_index_result::Result::Ok(ok)) => Ok(ReadIndexReply {
                success: ok.success,
                read_index: Index::from_u64_or_none(ok.read_index),
            }),
            Some(proto_read_index_result::Result::Err(fault)) => Err(TransportError::ServerFault(fault.message)),
            None => Err(TransportError::Malformed("ReadIndex result missing".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StateMachineOutput;
    use crate::replica::{AppliedInvocations, ClientInvocationId, ClientWriteOutput};
    use crate::replica::{EntryPayload, RaftConfiguration, ReplicaMetadata};
    use crate::replica::{PeerConfiguration, PeerRole, ReplicaInfoBlob};
    use std::iter::FromIterator;
    use std::net::Ipv4Addr;

    #[test]
    fn append_entries_request_through_proto() {
        let request = AppendEntriesRequest {
            leader_id: ReplicaId::new("leader"),
            leader_term: Term::new(3),
            previous_log_entry: Some(TermIndex::new(Term::new(2), Index::new(9))),
            leader_commit_index: None,
            entries: vec![WriteAheadLogEntry {
                term: Term::new(3),
                payload: EntryPayload::NoOp,
            }],
            call_id: 17,
            is_heartbeat: false,
        };

        let proto = ProtoAppendEntriesReq::from(request);
        assert_eq!(proto.commit_index, 0);
        let back = AppendEntriesRequest::try_from(proto).unwrap();
        assert_eq!(back.previous_log_entry, Some(TermIndex::new(Term::new(2), Index::new(9))));
        assert_eq!(back.leader_commit_index, None);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.call_id, 17);
    }

    #[test]
    fn rejects_half_empty_term_index() {
        let proto = ProtoRequestVoteReq {
            client_node_id: "c".into(),
            term: 1,
            last_log_entry: Some(ProtoTermIndex { term: 0, index: 4 }),
            pre_vote: false,
        };
        assert!(RequestVoteRequest::try_from(proto).is_err());
    }

    #[test]
    fn server_fault_surfaces_as_transport_error() {
        let proto = ProtoAppendEntriesResult::from(Err(RpcHandlerError::Shutdown));
        assert!(matches!(
            AppendEntriesReply::try_from(proto),
            Err(TransportError::ServerFault(_))
        ));

        let missing_outcome = ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                term: 1,
                next_index: 1,
                outcome: None,
                ..Default::default()
            })),
        };
        assert!(matches!(
            AppendEntriesReply::try_from(missing_outcome),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn snapshot_chunk_carries_configuration_and_applied_invocations() {
        let peer = ReplicaMetadata::new(
            ReplicaId::new("a"),
            Ipv4Addr::LOCALHOST,
            1,
            ReplicaInfoBlob::new(0),
            3,
            PeerRole::Voter,
        );
        let configuration = RaftConfiguration::new_stable(Some(Index::new(2)), PeerConfiguration::new(vec![peer]));
        let applied_invocations = AppliedInvocations::from_iter(vec![(
            ClientInvocationId::new("client".to_string(), 3),
            ClientWriteOutput {
                entry: TermIndex::new(Term::new(4), Index::new(38)),
                output: StateMachineOutput::Data(Bytes::from_static(b"ok")),
            },
        )]);
        let request = InstallSnapshotRequest {
            leader_id: ReplicaId::new("leader"),
            leader_term: Term::new(5),
            last_included: TermIndex::new(Term::new(4), Index::new(40)),
            configuration: configuration.clone(),
            applied_invocations: applied_invocations.clone(),
            request_index: 0,
            data: Bytes::from_static(b"state"),
            done: true,
        };

        let back = InstallSnapshotRequest::try_from(ProtoInstallSnapshotReq::from(request)).unwrap();
        assert_eq!(back.configuration, configuration);
        assert_eq!(back.applied_invocations, applied_invocations);
        assert_eq!(back.last_included, TermIndex::new(Term::new(4), Index::new(40)));
        assert_eq!(back.data.as_ref(), b"state");
    }
}
