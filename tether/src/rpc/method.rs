//! Method correlation.
//!
//! Client side, [`MethodCorrelator`] remembers which client issued each
//! outstanding request so the response reaches it and nobody else. Server
//! side, [`RequestGate`] admits one request per method at a time and
//! remembers where to send the eventual response.
//!
//! Both are plain single-threaded state machines; the proxy and server drive
//! them from their loop thread.

use std::collections::{BTreeMap, HashMap};

use crate::types::{Address, ClientId, SeqId};

/// Outstanding requests per method, keyed by sequence id.
#[derive(Debug, Default)]
pub struct MethodCorrelator {
    last_seq: SeqId,
    pending: HashMap<String, BTreeMap<SeqId, ClientId>>,
}

impl MethodCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next sequence id for a request of `method`.
    ///
    /// Only methods with a response are recorded. The flag is `true` when
    /// this is the first outstanding request of `method`, which is when the
    /// caller subscribes to its responses.
    pub fn begin(&mut self, method: &str, has_response: bool, client: ClientId) -> (SeqId, bool) {
        self.last_seq = self.last_seq.next();
        let seq = self.last_seq;
        if !has_response {
            return (seq, false);
        }
        let outstanding = self.pending.entry(method.to_owned()).or_default();
        let first = outstanding.is_empty();
        outstanding.insert(seq, client);
        (seq, first)
    }

    /// Removes and returns the record for `seq`.
    ///
    /// The flag is `true` when no request of `method` remains outstanding,
    /// which is when the caller unsubscribes from its responses.
    pub fn resolve(&mut self, method: &str, seq: SeqId) -> Option<(ClientId, bool)> {
        let outstanding = self.pending.get_mut(method)?;
        let client = outstanding.remove(&seq)?;
        let last = outstanding.is_empty();
        if last {
            self.pending.remove(method);
        }
        Some((client, last))
    }

    #[must_use]
    pub fn outstanding(&self, method: &str) -> usize {
        self.pending.get(method).map_or(0, BTreeMap::len)
    }

    /// Drops every record. Returns the methods that had outstanding requests.
    pub fn reset(&mut self) -> Vec<String> {
        self.pending.drain().map(|(method, _)| method).collect()
    }

    /// Drops `client`'s records. Returns the methods left with none.
    pub fn forget_client(&mut self, client: ClientId) -> Vec<String> {
        let mut emptied = Vec::new();
        self.pending.retain(|method, outstanding| {
            let before = outstanding.len();
            outstanding.retain(|_, c| *c != client);
            if outstanding.is_empty() && before > 0 {
                emptied.push(method.clone());
                return false;
            }
            true
        });
        emptied
    }
}

/// Where a response goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub client_seq: SeqId,
    pub client: Address,
}

/// Outcome of [`RequestGate::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(SeqId),
    /// A request of this method is still being served.
    Busy,
}

#[derive(Debug, Default)]
struct Gate {
    busy: bool,
    processing: Option<SeqId>,
    prepared: Option<SeqId>,
    pending: BTreeMap<SeqId, PendingRequest>,
}

/// Server-side busy/ready gate per method.
#[derive(Debug, Default)]
pub struct RequestGate {
    last_seq: SeqId,
    gates: HashMap<String, Gate>,
}

impl RequestGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the request unless `method` is busy.
    pub fn admit(&mut self, method: &str, client_seq: SeqId, client: Address) -> Admission {
        let gate = self.gates.entry(method.to_owned()).or_default();
        if gate.busy {
            return Admission::Busy;
        }
        self.last_seq = self.last_seq.next();
        let seq = self.last_seq;
        gate.busy = true;
        gate.processing = Some(seq);
        gate.pending.insert(seq, PendingRequest { client_seq, client });
        Admission::Accepted(seq)
    }

    /// Reopens the gate without answering. The record is kept so the request
    /// can still be answered later through [`RequestGate::prepare`].
    pub fn unblock(&mut self, method: &str) -> Option<SeqId> {
        let gate = self.gates.get_mut(method)?;
        if !gate.busy {
            return None;
        }
        gate.busy = false;
        gate.processing
    }

    /// Selects which pending request the next [`RequestGate::complete`]
    /// answers. Returns `false` if `seq` is not pending.
    pub fn prepare(&mut self, method: &str, seq: SeqId) -> bool {
        let Some(gate) = self.gates.get_mut(method) else {
            return false;
        };
        if !gate.pending.contains_key(&seq) {
            return false;
        }
        gate.prepared = Some(seq);
        true
    }

    /// Takes the record to answer (the prepared one, else the one being
    /// processed) and reopens the gate.
    pub fn complete(&mut self, method: &str) -> Option<PendingRequest> {
        let gate = self.gates.get_mut(method)?;
        let seq = gate.prepared.take().or(gate.processing)?;
        let record = gate.pending.remove(&seq)?;
        if gate.processing == Some(seq) {
            gate.processing = None;
        }
        gate.busy = false;
        Some(record)
    }

    /// Server sequence id of the request being processed.
    #[must_use]
    pub fn current(&self, method: &str) -> Option<SeqId> {
        self.gates.get(method).and_then(|g| g.processing)
    }

    #[must_use]
    pub fn is_busy(&self, method: &str) -> bool {
        self.gates.get(method).is_some_and(|g| g.busy)
    }

    #[must_use]
    pub fn pending(&self, method: &str) -> usize {
        self.gates.get(method).map_or(0, |g| g.pending.len())
    }

    /// Drops every record of `client`; a gate held by it reopens.
    pub fn drop_client(&mut self, client: Address) {
        for gate in self.gates.values_mut() {
            gate.pending.retain(|_, r| r.client != client);
            if let Some(seq) = gate.processing {
                if !gate.pending.contains_key(&seq) {
                    gate.processing = None;
                    gate.busy = false;
                }
            }
            if gate.prepared.is_some_and(|seq| !gate.pending.contains_key(&seq)) {
                gate.prepared = None;
            }
        }
    }

    pub fn reset(&mut self) {
        self.gates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Context, ServiceId, ThreadId};

    fn client(n: u32) -> Address {
        Address::new(Context::thread(ThreadId(n)), ServiceId(n))
    }

    #[test]
    fn responses_resolve_to_the_issuing_client() {
        let mut correlator = MethodCorrelator::new();
        let (s1, first) = correlator.begin("seek", true, ClientId(1));
        assert!(first);
        let (s2, first) = correlator.begin("seek", true, ClientId(2));
        assert!(!first);
        assert_ne!(s1, s2);

        assert_eq!(correlator.resolve("seek", s2), Some((ClientId(2), false)));
        assert_eq!(correlator.resolve("seek", s2), None);
        assert_eq!(correlator.resolve("seek", s1), Some((ClientId(1), true)));
        assert_eq!(correlator.outstanding("seek"), 0);
    }

    #[test]
    fn nested_request_after_resolve_is_a_fresh_record() {
        let mut correlator = MethodCorrelator::new();
        let (s1, _) = correlator.begin("seek", true, ClientId(1));
        let (_, last) = correlator.resolve("seek", s1).unwrap();
        assert!(last);
        // Issued from inside the response callback.
        let (s2, first) = correlator.begin("seek", true, ClientId(1));
        assert!(first);
        assert_ne!(s1, s2);
        assert_eq!(correlator.resolve("seek", s2), Some((ClientId(1), true)));
    }

    #[test]
    fn fire_and_forget_is_not_recorded() {
        let mut correlator = MethodCorrelator::new();
        let (seq, first) = correlator.begin("play", false, ClientId(1));
        assert!(!first);
        assert_eq!(correlator.resolve("play", seq), None);
    }

    #[test]
    fn forget_client_reports_emptied_methods() {
        let mut correlator = MethodCorrelator::new();
        correlator.begin("seek", true, ClientId(1));
        correlator.begin("load", true, ClientId(1));
        correlator.begin("load", true, ClientId(2));
        assert_eq!(correlator.forget_client(ClientId(1)), ["seek".to_owned()]);
        assert_eq!(correlator.outstanding("load"), 1);
    }

    #[test]
    fn busy_gate_refuses_second_request() {
        let mut gate = RequestGate::new();
        let Admission::Accepted(seq) = gate.admit("seek", SeqId(10), client(1)) else {
            panic!("first request refused");
        };
        assert_eq!(gate.admit("seek", SeqId(11), client(2)), Admission::Busy);
        assert_eq!(gate.pending("seek"), 1);

        let record = gate.complete("seek").unwrap();
        assert_eq!(record.client_seq, SeqId(10));
        assert_eq!(record.client, client(1));
        assert!(!gate.is_busy("seek"));
        assert_ne!(gate.current("seek"), Some(seq));
        assert!(matches!(gate.admit("seek", SeqId(12), client(2)), Admission::Accepted(_)));
    }

    #[test]
    fn unblock_reopens_and_prepare_answers_later() {
        let mut gate = RequestGate::new();
        let Admission::Accepted(first) = gate.admit("seek", SeqId(1), client(1)) else {
            panic!("refused");
        };
        assert_eq!(gate.unblock("seek"), Some(first));
        assert!(!gate.is_busy("seek"));
        let Admission::Accepted(second) = gate.admit("seek", SeqId(2), client(2)) else {
            panic!("refused after unblock");
        };

        assert!(gate.prepare("seek", first));
        assert_eq!(gate.complete("seek").map(|r| r.client), Some(client(1)));
        assert_eq!(gate.current("seek"), Some(second));
        assert_eq!(gate.complete("seek").map(|r| r.client), Some(client(2)));
        assert!(gate.complete("seek").is_none());
    }

    #[test]
    fn dropping_the_holder_reopens_the_gate() {
        let mut gate = RequestGate::new();
        gate.admit("seek", SeqId(1), client(1));
        gate.drop_client(client(1));
        assert!(!gate.is_busy("seek"));
        assert_eq!(gate.pending("seek"), 0);
    }
}
