use crate::replica::{ClientInvocationId, ClientWriteOutput};
use std::collections::BTreeMap;
use std::iter::FromIterator;

/// AppliedInvocations records every client invocation the state machine has applied, along with
/// where it was applied and what it returned.
///
/// It only changes as entries are applied, so two replicas that applied the same log prefix hold
/// the same table no matter how fast they applied it. Snapshots carry it, and nothing expires out
/// of it.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct AppliedInvocations {
    applied: BTreeMap<ClientInvocationId, ClientWriteOutput>,
}

impl AppliedInvocations {
    pub(crate) fn get(&self, invocation: &ClientInvocationId) -> Option<&ClientWriteOutput> {
        self.applied.get(invocation)
    }

    /// Keeps the first application's outcome if `invocation` was already recorded.
    pub(crate) fn record(&mut self, invocation: ClientInvocationId, outcome: ClientWriteOutput) {
        self.applied.entry(invocation).or_insert(outcome);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ClientInvocationId, &ClientWriteOutput)> {
        self.applied.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.applied.len()
    }
}

impl FromIterator<(ClientInvocationId, ClientWriteOutput)> for AppliedInvocations {
    fn from_iter<I: IntoIterator<Item = (ClientInvocationId, ClientWriteOutput)>>(iter: I) -> Self {
        let mut applied = AppliedInvocations::default();
        for (invocation, outcome) in iter {
            applied.record(invocation, outcome);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StateMachineOutput;
    use crate::commitlog::Index;
    use crate::replica::{Term, TermIndex};
    use bytes::Bytes;

    fn outcome(index: u64) -> ClientWriteOutput {
        ClientWriteOutput {
            entry: TermIndex::new(Term::new(1), Index::new(index)),
            output: StateMachineOutput::Data(Bytes::from(index.to_string())),
        }
    }

    #[test]
    fn first_application_wins() {
        let mut applied = AppliedInvocations::default();
        let id = ClientInvocationId::new("c".into(), 1);

        assert!(applied.get(&id).is_none());
        applied.record(id.clone(), outcome(3));
        applied.record(id.clone(), outcome(9));

        assert_eq!(applied.get(&id), Some(&outcome(3)));
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn same_call_id_from_other_client_is_separate() {
        let applied: AppliedInvocations = vec![
            (ClientInvocationId::new("a".into(), 1), outcome(1)),
            (ClientInvocationId::new("b".into(), 1), outcome(2)),
        ]
        .into_iter()
        .collect();

        assert_eq!(applied.len(), 2);
        assert_eq!(
            applied.get(&ClientInvocationId::new("b".into(), 1)).map(|o| o.entry.index),
            Some(Index::new(2))
        );
    }
}
