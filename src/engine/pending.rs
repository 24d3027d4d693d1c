use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::dns::Query;
use crate::engine::flow::{FlowProto, FlowToken};

/// In-flight state for one forwarded query. Every entry ends in exactly one
/// of: a forwarded upstream response, an explicit SERVFAIL, or cleanup
/// eviction past the age limit.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub token: FlowToken,
    pub client: SocketAddr,
    pub proto: FlowProto,
    pub query: Query,
    /// Original wire bytes, kept for connect-pending retries.
    pub wire: Bytes,
    /// Resolver to forward back to when preserving a DNS chain.
    pub original_resolver: Option<SocketAddr>,
    /// Upstream the query was last handed to.
    pub forwarded_to: Option<SocketAddr>,
    pub submitted_at: Instant,
    pub attempts: u8,
}

/// Transaction-id keyed map of in-flight queries. Owned by the engine task;
/// at most one entry per transaction id at a time.
#[derive(Debug, Default)]
pub struct PendingMap {
    map: HashMap<u16, PendingQuery>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning any displaced entry with the same transaction id.
    /// The caller fails the displaced query before proceeding.
    pub fn insert(&mut self, txid: u16, pending: PendingQuery) -> Option<PendingQuery> {
        self.map.insert(txid, pending)
    }

    pub fn take(&mut self, txid: u16) -> Option<PendingQuery> {
        self.map.remove(&txid)
    }

    pub fn get(&self, txid: u16) -> Option<&PendingQuery> {
        self.map.get(&txid)
    }

    pub fn get_mut(&mut self, txid: u16) -> Option<&mut PendingQuery> {
        self.map.get_mut(&txid)
    }

    pub fn contains(&self, txid: u16) -> bool {
        self.map.contains_key(&txid)
    }

    /// Transaction ids older than `max_age`, for the cleanup pass.
    pub fn expired(&self, max_age: Duration) -> Vec<u16> {
        let now = Instant::now();
        self.map
            .iter()
            .filter(|(_, p)| now.duration_since(p.submitted_at) > max_age)
            .map(|(txid, _)| *txid)
            .collect()
    }

    /// Every pending query on the given flow; used when a flow closes.
    pub fn on_flow(&self, token: FlowToken) -> Vec<u16> {
        self.map
            .iter()
            .filter(|(_, p)| p.token == token)
            .map(|(txid, _)| *txid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::QueryType;

    fn pending(token_id: u64) -> PendingQuery {
        PendingQuery {
            token: FlowToken {
                id: token_id,
                generation: token_id,
            },
            client: "127.0.0.1:5353".parse().unwrap(),
            proto: FlowProto::Udp,
            query: Query {
                id: 7,
                opcode: 0,
                recursion_desired: true,
                qname: "example.com".to_string(),
                qtype: QueryType::A,
            },
            wire: Bytes::new(),
            original_resolver: None,
            forwarded_to: None,
            submitted_at: Instant::now(),
            attempts: 0,
        }
    }

    #[test]
    fn single_entry_per_transaction_id() {
        let mut map = PendingMap::new();
        assert!(map.insert(7, pending(1)).is_none());
        let displaced = map.insert(7, pending(2)).expect("older entry displaced");
        assert_eq!(displaced.token.id, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn expiry_scan() {
        let mut map = PendingMap::new();
        let mut old = pending(1);
        old.submitted_at = Instant::now() - Duration::from_secs(10);
        map.insert(1, old);
        map.insert(2, pending(2));

        let expired = map.expired(Duration::from_secs(5));
        assert_eq!(expired, vec![1]);
    }

    #[test]
    fn flow_scoped_lookup() {
        let mut map = PendingMap::new();
        map.insert(1, pending(42));
        map.insert(2, pending(42));
        map.insert(3, pending(7));
        let mut on_flow = map.on_flow(FlowToken {
            id: 42,
            generation: 42,
        });
        on_flow.sort_unstable();
        assert_eq!(on_flow, vec![1, 2]);
    }
}
