use crate::api::StateMachineOutput;
use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::applied_invocations::AppliedInvocations;
use crate::replica::configuration::{PeerConfiguration, RaftConfiguration};
use crate::replica::peers::{PeerRole, ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
use crate::replica::retry_cache::ClientInvocationId;
use crate::replica::{ClientWriteOutput, Term, TermIndex};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::io;
use std::net::Ipv4Addr;

/// WriteAheadLogEntry is one entry of a division's log. Log storage only sees its byte form.
///
/// Byte representation:
///
/// ```text
/// |                                         1                               |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | ...                 |
/// +---+---+---+---+---+---+---+---+---+---+---------------------------...---+
/// |Vrs|       Term (8 bytes)          |Knd|   Payload (variable size)   ... |
/// +---+-------------------------------+---+---------------------------...---+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created
/// * `Knd` - payload kind: 0 no-op, 1 application, 2 configuration
/// * `Payload`
///   * no-op: empty
///   * application: client id (u32 length prefixed), call id (u64), then app data until the end
///   * configuration: see `encode_configuration()`
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of app data is not needed; the underlying commitlog will give us the correctly
///   allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    /// Appended by a new leader so that entries from earlier terms can commit.
    NoOp,
    Application {
        invocation: ClientInvocationId,
        data: Bytes,
    },
    Configuration(RaftConfiguration),
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 1;

const KIND_NO_OP: u8 = 0;
const KIND_APPLICATION: u8 = 1;
const KIND_CONFIGURATION: u8 = 2;

impl WriteAheadLogEntry {
    pub(crate) fn configuration(&self) -> Option<&RaftConfiguration> {
        match &self.payload {
            EntryPayload::Configuration(configuration) => Some(configuration),
            _ => None,
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 1 + self.payload_size_hint());
        buf.put_u8(RAFT_LOG_ENTRY_FORMAT_VERSION);
        buf.put_u64(self.term.as_u64());

        match &self.payload {
            EntryPayload::NoOp => buf.put_u8(KIND_NO_OP),
            EntryPayload::Application { invocation, data } => {
                buf.put_u8(KIND_APPLICATION);
                put_string(&mut buf, &invocation.client_id);
                buf.put_u64(invocation.call_id);
                buf.put_slice(data);
            }
            EntryPayload::Configuration(configuration) => {
                buf.put_u8(KIND_CONFIGURATION);
                encode_configuration(configuration, &mut buf);
            }
        }

        buf.freeze()
    }

    pub(crate) fn decode(mut bytes: Bytes) -> io::Result<Self> {
        ensure_remaining(&bytes, 1 + 8 + 1)?;

        let version = bytes.get_u8();
        if version != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(invalid_data(format!("Unknown log entry version {}", version)));
        }
        let term = Term::new(bytes.get_u64());

        let payload = match bytes.get_u8() {
            KIND_NO_OP => EntryPayload::NoOp,
            KIND_APPLICATION => {
                let client_id = get_string(&mut bytes)?;
                ensure_remaining(&bytes, 8)?;
                let call_id = bytes.get_u64();
                EntryPayload::Application {
                    invocation: ClientInvocationId::new(client_id, call_id),
                    data: bytes,
                }
            }
            KIND_CONFIGURATION => EntryPayload::Configuration(decode_configuration(&mut bytes)?),
            kind => return Err(invalid_data(format!("Unknown log entry kind {}", kind))),
        };

        Ok(WriteAheadLogEntry { term, payload })
    }

    fn payload_size_hint(&self) -> usize {
        match &self.payload {
            EntryPayload::NoOp => 0,
            EntryPayload::Application { invocation, data } => 4 + invocation.client_id.len() + 8 + data.len(),
            EntryPayload::Configuration(_) => 128,
        }
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        entry.encode().to_vec()
    }
}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        WriteAheadLogEntry::decode(Bytes::from(bytes))
    }
}

/// Configuration representation:
///
/// ```text
/// | LogIndex (8 bytes, 0 = none) | Current peer list | HasOld (1 byte) | Old peer list? |
/// ```
///
/// A peer list is a u32 count, then per peer: id (u32 length prefixed), ipv4 (4 bytes),
/// port (2 bytes), blob (16 bytes), priority (4 bytes), role (1 byte, 0 voter, 1 listener).
pub(crate) fn encode_configuration(configuration: &RaftConfiguration, buf: &mut BytesMut) {
    buf.put_u64(configuration.log_index().map(|i| i.as_u64()).unwrap_or(0));
    encode_peers(configuration.current(), buf);
    match configuration.old() {
        None => buf.put_u8(0),
        Some(old) => {
            buf.put_u8(1);
            encode_peers(old, buf);
        }
    }
}

pub(crate) fn decode_configuration(buf: &mut impl Buf) -> io::Result<RaftConfiguration> {
    ensure_remaining(&*buf, 8)?;
    let log_index = Index::from_u64_or_none(buf.get_u64());
    let current = decode_peers(buf)?;
    ensure_remaining(&*buf, 1)?;
    let old = match buf.get_u8() {
        0 => None,
        1 => Some(decode_peers(buf)?),
        other => return Err(invalid_data(format!("Bad joint configuration marker {}", other))),
    };

    Ok(RaftConfiguration::new(log_index, current, old))
}

/// Applied invocations representation: a u32 count, then per invocation: client id (u32 length
/// prefixed), call id (u64), applied term (u64), applied index (u64), output marker (1 byte,
/// 0 no data, 1 data) and, for data, the output bytes (u32 length prefixed).
pub(crate) fn encode_applied_invocations(applied: &AppliedInvocations, buf: &mut BytesMut) {
    buf.put_u32(applied.len() as u32);
    for (invocation, outcome) in applied.iter() {
        put_string(buf, &invocation.client_id);
        buf.put_u64(invocation.call_id);
        buf.put_u64(outcome.entry.term.as_u64());
        buf.put_u64(outcome.entry.index.as_u64());
        match &outcome.output {
            StateMachineOutput::NoData => buf.put_u8(0),
            StateMachineOutput::Data(data) => {
                buf.put_u8(1);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

pub(crate) fn decode_applied_invocations(buf: &mut impl Buf) -> io::Result<AppliedInvocations> {
    ensure_remaining(&*buf, 4)?;
    let count = buf.get_u32() as usize;

    let mut applied = Vec::with_capacity(count);
    for _ in 0..count {
        let client_id = get_string(buf)?;
        ensure_remaining(&*buf, 8 + 8 + 8 + 1)?;
        let call_id = buf.get_u64();
        let term = Term::new(buf.get_u64());
        let index = Index::from_u64_or_none(buf.get_u64())
            .ok_or_else(|| invalid_data("Applied invocation at index 0".to_string()))?;
        let output = match buf.get_u8() {
            0 => StateMachineOutput::NoData,
            1 => {
                ensure_remaining(&*buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure_remaining(&*buf, len)?;
                StateMachineOutput::Data(buf.copy_to_bytes(len))
            }
            other => return Err(invalid_data(format!("Unknown output marker {}", other))),
        };

        applied.push((
            ClientInvocationId::new(client_id, call_id),
            ClientWriteOutput {
                entry: TermIndex::new(term, index),
                output,
            },
        ));
    }

    Ok(applied.into_iter().collect())
}

fn encode_peers(peers: &PeerConfiguration, buf: &mut BytesMut) {
    let peers: Vec<_> = peers.peers().collect();
    buf.put_u32(peers.len() as u32);
    for peer in peers {
        put_string(buf, peer.replica_id().as_str());
        buf.put_slice(&peer.ip_addr().octets());
        buf.put_u16(peer.port());
        buf.put_u128(peer.info_blob().into_inner());
        buf.put_u32(peer.priority());
        buf.put_u8(match peer.role() {
            PeerRole::Voter => 0,
            PeerRole::Listener => 1,
        });
    }
}

fn decode_peers(buf: &mut impl Buf) -> io::Result<PeerConfiguration> {
    ensure_remaining(&*buf, 4)?;
    let count = buf.get_u32() as usize;

    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        let replica_id = get_string(buf)?;
        ensure_remaining(&*buf, 4 + 2 + 16 + 4 + 1)?;
        let ip_addr = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        let blob = buf.get_u128();
        let priority = buf.get_u32();
        let role = match buf.get_u8() {
            0 => PeerRole::Voter,
            1 => PeerRole::Listener,
            other => return Err(invalid_data(format!("Unknown peer role {}", other))),
        };

        peers.push(ReplicaMetadata::new(
            ReplicaId::new(replica_id),
            ip_addr,
            port,
            ReplicaInfoBlob::new(blob),
            priority,
            role,
        ));
    }

    Ok(PeerConfiguration::new(peers))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> io::Result<String> {
    ensure_remaining(&*buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(&*buf, len)?;
    let bytes = buf.copy_to_bytes(len);

    String::from_utf8(bytes.to_vec()).map_err(|_| invalid_data("String is not utf-8".to_string()))
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> io::Result<()> {
    if buf.remaining() < needed {
        Err(invalid_data(format!(
            "Truncated log entry: needed {} more bytes, have {}",
            needed,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, role: PeerRole, priority: u32) -> ReplicaMetadata {
        ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::new(10, 0, 0, 7),
            4242,
            ReplicaInfoBlob::new(u128::MAX - 3),
            priority,
            role,
        )
    }

    fn round_trip(entry: WriteAheadLogEntry) {
        let bytes: Vec<u8> = entry.clone().into();
        let decoded = WriteAheadLogEntry::try_from(bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn codec_round_trips_each_kind() {
        round_trip(WriteAheadLogEntry {
            term: Term::new(3),
            payload: EntryPayload::NoOp,
        });

        round_trip(WriteAheadLogEntry {
            term: Term::new(u64::MAX),
            payload: EntryPayload::Application {
                invocation: ClientInvocationId::new("client-1".to_string(), 77),
                data: Bytes::from_static(b"hello"),
            },
        });

        round_trip(WriteAheadLogEntry {
            term: Term::new(5),
            payload: EntryPayload::Configuration(RaftConfiguration::new(
                Some(Index::new(12)),
                PeerConfiguration::new(vec![peer("a", PeerRole::Voter, 2), peer("l", PeerRole::Listener, 0)]),
                Some(PeerConfiguration::new(vec![peer("a", PeerRole::Voter, 2)])),
            )),
        });
    }

    #[test]
    fn decode_rejects_garbage() {
        // Too short
        assert!(WriteAheadLogEntry::try_from(vec![1, 0, 0]).is_err());

        // Wrong version
        let mut bytes: Vec<u8> = WriteAheadLogEntry {
            term: Term::new(1),
            payload: EntryPayload::NoOp,
        }
        .into();
        bytes[0] = 99;
        assert!(WriteAheadLogEntry::try_from(bytes).is_err());

        // Truncated application header
        let mut bytes: Vec<u8> = WriteAheadLogEntry {
            term: Term::new(1),
            payload: EntryPayload::Application {
                invocation: ClientInvocationId::new("abc".to_string(), 1),
                data: Bytes::new(),
            },
        }
        .into();
        bytes.truncate(14);
        assert!(WriteAheadLogEntry::try_from(bytes).is_err());
    }

    #[test]
    fn applied_invocations_codec() {
        let applied: AppliedInvocations = vec![
            (
                ClientInvocationId::new("b".to_string(), 2),
                ClientWriteOutput {
                    entry: TermIndex::new(Term::new(2), Index::new(9)),
                    output: StateMachineOutput::NoData,
                },
            ),
            (
                ClientInvocationId::new("a".to_string(), 7),
                ClientWriteOutput {
                    entry: TermIndex::new(Term::new(1), Index::new(4)),
                    output: StateMachineOutput::Data(Bytes::from_static(b"out")),
                },
            ),
        ]
        .into_iter()
        .collect();

        let mut buf = BytesMut::new();
        encode_applied_invocations(&applied, &mut buf);
        let mut bytes = buf.freeze();
        let truncated = bytes.slice(..bytes.len() - 1);

        assert_eq!(decode_applied_invocations(&mut bytes).unwrap(), applied);
        assert!(decode_applied_invocations(&mut truncated.clone()).is_err());
    }
}
