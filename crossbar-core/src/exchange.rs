//! The routing exchange.
//!
//! Subscribers register interest in a qid (literal or pattern) and
//! publishers dispatch messages addressed to a literal qid. The exchange
//! fans a multicast out to every matching subscriber and routes a unicast
//! to one matching subscriber chosen uniformly at random.
//!
//! Concurrency model: single-threaded. The table lives behind an
//! `Rc<RefCell>`; every operation collects its delivery handles under a
//! short borrow and invokes them after the borrow is released, so a
//! delivery callback may re-enter the exchange.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::trace;

use crate::error::ExchangeError;
use crate::qid::Qid;

/// Compact integer id for attached clients.
pub type PeerKey = u64;

/// Delivery-side view of an attached client.
///
/// The exchange holds nothing else about a peer, which keeps the
/// client/exchange reference cycle one-directional: tearing a client down
/// is an explicit `disconnect`, never a destructor.
pub trait ExchangePeer {
    /// Push one message to the peer. `qid` is the literal dispatch target.
    fn deliver(&self, qid: &Bytes, message: &Bytes);

    /// Ask the peer to disconnect itself (used when an adapter stops).
    fn hangup(&self);
}

struct ClientEntry {
    peer: Rc<dyn ExchangePeer>,
    /// Subscribed qids in subscription order, one entry per occurrence.
    qids: Vec<Qid>,
}

/// The subscription table proper.
///
/// Two mappings kept mutually consistent: `subscribers` (qid -> occurrence
/// list of peer keys) and `clients` (peer -> qid list). Duplicate
/// subscriptions are independent occurrences on both sides; dispatch
/// deduplicates.
#[derive(Default)]
struct RoutingTable {
    clients: HashMap<PeerKey, ClientEntry>,
    subscribers: HashMap<Qid, SmallVec<[PeerKey; 4]>>,
}

impl RoutingTable {
    fn connect(&mut self, key: PeerKey, peer: Rc<dyn ExchangePeer>) {
        let previous = self.clients.insert(
            key,
            ClientEntry {
                peer,
                qids: Vec::new(),
            },
        );
        debug_assert!(previous.is_none(), "peer key reused");
    }

    fn disconnect(&mut self, key: PeerKey) -> bool {
        let Some(entry) = self.clients.remove(&key) else {
            return false;
        };
        for qid in &entry.qids {
            Self::remove_occurrence(&mut self.subscribers, qid, key);
        }
        true
    }

    fn subscribe(&mut self, key: PeerKey, qid: Qid) -> Result<(), ExchangeError> {
        let entry = self
            .clients
            .get_mut(&key)
            .ok_or(ExchangeError::NotConnected)?;
        entry.qids.push(qid.clone());
        self.subscribers.entry(qid).or_default().push(key);
        Ok(())
    }

    fn unsubscribe(&mut self, key: PeerKey, qid: &Qid) -> Result<(), ExchangeError> {
        let entry = self
            .clients
            .get_mut(&key)
            .ok_or(ExchangeError::NotConnected)?;
        let Some(pos) = entry.qids.iter().position(|q| q == qid) else {
            return Err(ExchangeError::NotSubscribed);
        };
        entry.qids.remove(pos);
        Self::remove_occurrence(&mut self.subscribers, qid, key);
        Ok(())
    }

    fn remove_occurrence(
        subscribers: &mut HashMap<Qid, SmallVec<[PeerKey; 4]>>,
        qid: &Qid,
        key: PeerKey,
    ) {
        if let Some(keys) = subscribers.get_mut(qid) {
            if let Some(pos) = keys.iter().position(|k| *k == key) {
                keys.swap_remove(pos);
            }
            if keys.is_empty() {
                subscribers.remove(qid);
            }
        }
    }

    /// Deduplicated keys of every subscriber whose qid selects `target`.
    ///
    /// Linear in the number of distinct subscription keys; subscription
    /// counts are assumed modest.
    fn match_target(&self, target: &[u8]) -> SmallVec<[PeerKey; 16]> {
        let mut out: SmallVec<[PeerKey; 16]> = SmallVec::new();
        for (qid, keys) in &self.subscribers {
            if qid.matches(target) {
                out.extend_from_slice(keys);
            }
        }
        if out.len() > 1 {
            out.sort_unstable();
            out.dedup();
        }
        out
    }

    fn peer(&self, key: PeerKey) -> Option<Rc<dyn ExchangePeer>> {
        self.clients.get(&key).map(|e| Rc::clone(&e.peer))
    }

    /// Every (qid, key) pair present in `subscribers` must appear in the
    /// owning client's qid list the same number of times, and vice versa.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let count_in_clients = |qid: &Qid, key: PeerKey| {
            self.clients
                .get(&key)
                .map_or(0, |e| e.qids.iter().filter(|q| *q == qid).count())
        };
        for (qid, keys) in &self.subscribers {
            for &key in keys {
                let by_qid = keys.iter().filter(|k| **k == key).count();
                if by_qid != count_in_clients(qid, key) {
                    return false;
                }
            }
        }
        for (key, entry) in &self.clients {
            for qid in &entry.qids {
                let by_client = entry.qids.iter().filter(|q| *q == qid).count();
                let by_qid = self
                    .subscribers
                    .get(qid)
                    .map_or(0, |keys| keys.iter().filter(|k| **k == *key).count());
                if by_client != by_qid {
                    return false;
                }
            }
        }
        true
    }
}

struct Inner {
    table: RoutingTable,
    rng: SmallRng,
    next_key: PeerKey,
}

/// Shared handle to one exchange.
///
/// Cloning is cheap; all clones address the same routing table.
#[derive(Clone)]
pub struct Exchange {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Deterministic unicast selection, for tests and reproduction runs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                table: RoutingTable::default(),
                rng,
                next_key: 1,
            })),
        }
    }

    /// Attach a peer and return its key.
    pub fn connect(&self, peer: Rc<dyn ExchangePeer>) -> PeerKey {
        let mut inner = self.inner.borrow_mut();
        let key = inner.next_key;
        inner.next_key += 1;
        inner.table.connect(key, peer);
        trace!(key, "peer attached");
        key
    }

    /// Detach a peer, dropping every subscription it holds first.
    pub fn disconnect(&self, key: PeerKey) {
        if self.inner.borrow_mut().table.disconnect(key) {
            trace!(key, "peer detached");
        }
    }

    pub fn subscribe(&self, key: PeerKey, qid: Qid) -> Result<(), ExchangeError> {
        trace!(key, %qid, "subscribe");
        self.inner.borrow_mut().table.subscribe(key, qid)
    }

    pub fn unsubscribe(&self, key: PeerKey, qid: &Qid) -> Result<(), ExchangeError> {
        trace!(key, %qid, "unsubscribe");
        self.inner.borrow_mut().table.unsubscribe(key, qid)
    }

    /// Route one message.
    ///
    /// Multicast delivers to every matching subscriber once; unicast picks
    /// one matching subscriber uniformly at random. A unicast with no
    /// matching subscriber is dropped silently: the exchange holds no
    /// queues for absent subscribers.
    pub fn dispatch(&self, qid: &Bytes, message: &Bytes, multicast: bool) {
        let peers: SmallVec<[Rc<dyn ExchangePeer>; 4]> = {
            let mut inner = self.inner.borrow_mut();
            let keys = inner.table.match_target(qid);
            if keys.is_empty() {
                trace!(qid = %String::from_utf8_lossy(qid), "no matching subscriber");
                return;
            }
            if multicast {
                keys.iter()
                    .filter_map(|&key| inner.table.peer(key))
                    .collect()
            } else {
                let picked = keys[inner.rng.gen_range(0..keys.len())];
                inner.table.peer(picked).into_iter().collect()
            }
        };
        for peer in peers {
            peer.deliver(qid, message);
        }
    }

    /// Disconnect every attached client (adapter stop path).
    ///
    /// Each peer is asked to hang up and removes itself through its own
    /// close path, so stream teardown and `on_disconnected` callbacks run
    /// exactly as they would for an individual disconnect.
    pub fn disconnect_all(&self) {
        let peers: Vec<Rc<dyn ExchangePeer>> = {
            let inner = self.inner.borrow();
            inner
                .table
                .clients
                .values()
                .map(|e| Rc::clone(&e.peer))
                .collect()
        };
        for peer in peers {
            peer.hangup();
        }
    }

    /// Number of attached clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.borrow().table.clients.len()
    }

    /// Number of live subscription occurrences across all clients.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner
            .borrow()
            .table
            .subscribers
            .values()
            .map(|keys| keys.len())
            .sum()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.inner.borrow().table.is_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Recorder {
        messages: RefCell<Vec<(Bytes, Bytes)>>,
        hangups: Cell<usize>,
    }

    impl ExchangePeer for Recorder {
        fn deliver(&self, qid: &Bytes, message: &Bytes) {
            self.messages.borrow_mut().push((qid.clone(), message.clone()));
        }

        fn hangup(&self) {
            self.hangups.set(self.hangups.get() + 1);
        }
    }

    fn attach(exchange: &Exchange) -> (PeerKey, Rc<Recorder>) {
        let peer = Rc::new(Recorder::default());
        let key = exchange.connect(Rc::clone(&peer) as Rc<dyn ExchangePeer>);
        (key, peer)
    }

    #[test]
    fn tables_stay_consistent_under_churn() {
        let exchange = Exchange::with_seed(7);
        let (a, _) = attach(&exchange);
        let (b, _) = attach(&exchange);

        exchange.subscribe(a, Qid::literal("/q")).unwrap();
        exchange.subscribe(a, Qid::literal("/q")).unwrap();
        exchange.subscribe(a, Qid::pattern("/room/.*").unwrap()).unwrap();
        exchange.subscribe(b, Qid::literal("/q")).unwrap();
        assert!(exchange.is_consistent());

        exchange.unsubscribe(a, &Qid::literal("/q")).unwrap();
        assert!(exchange.is_consistent());

        exchange.disconnect(b);
        assert!(exchange.is_consistent());
        assert_eq!(exchange.client_count(), 1);

        exchange.disconnect(a);
        assert!(exchange.is_consistent());
        assert_eq!(exchange.client_count(), 0);
    }

    #[test]
    fn duplicate_subscriptions_are_independent_occurrences() {
        let exchange = Exchange::with_seed(7);
        let (a, peer) = attach(&exchange);

        exchange.subscribe(a, Qid::literal("/q")).unwrap();
        exchange.subscribe(a, Qid::literal("/q")).unwrap();

        // One occurrence removed: still subscribed.
        exchange.unsubscribe(a, &Qid::literal("/q")).unwrap();
        exchange.dispatch(&Bytes::from_static(b"/q"), &Bytes::from_static(b"m"), true);
        assert_eq!(peer.messages.borrow().len(), 1);

        exchange.unsubscribe(a, &Qid::literal("/q")).unwrap();
        exchange.dispatch(&Bytes::from_static(b"/q"), &Bytes::from_static(b"m"), true);
        assert_eq!(peer.messages.borrow().len(), 1);

        assert!(matches!(
            exchange.unsubscribe(a, &Qid::literal("/q")),
            Err(ExchangeError::NotSubscribed)
        ));
    }

    #[test]
    fn dispatch_selects_literals_and_patterns_and_dedups() {
        let exchange = Exchange::with_seed(7);
        let (a, pa) = attach(&exchange);
        let (b, pb) = attach(&exchange);
        let (_, pc) = attach(&exchange);

        exchange.subscribe(a, Qid::literal("/room/42")).unwrap();
        exchange.subscribe(a, Qid::pattern("/room/.*").unwrap()).unwrap();
        exchange.subscribe(b, Qid::pattern("/room/4.").unwrap()).unwrap();

        let target = Bytes::from_static(b"/room/42");
        exchange.dispatch(&target, &Bytes::from_static(b"m"), true);

        // a matched through two keys but receives once.
        assert_eq!(pa.messages.borrow().len(), 1);
        assert_eq!(pb.messages.borrow().len(), 1);
        assert_eq!(pc.messages.borrow().len(), 0);

        exchange.dispatch(
            &Bytes::from_static(b"/chan/1"),
            &Bytes::from_static(b"m"),
            true,
        );
        assert_eq!(pa.messages.borrow().len(), 1);
    }

    #[test]
    fn subscribe_requires_connect() {
        let exchange = Exchange::with_seed(7);
        assert!(matches!(
            exchange.subscribe(99, Qid::literal("/q")),
            Err(ExchangeError::NotConnected)
        ));
    }

    #[test]
    fn unicast_with_no_subscriber_is_a_silent_drop() {
        let exchange = Exchange::with_seed(7);
        exchange.dispatch(&Bytes::from_static(b"/q"), &Bytes::from_static(b"m"), false);
    }

    #[test]
    fn unicast_is_roughly_uniform() {
        let exchange = Exchange::with_seed(42);
        let subscribers: Vec<_> = (0..4).map(|_| attach(&exchange)).collect();
        for (key, _) in &subscribers {
            exchange.subscribe(*key, Qid::literal("/u")).unwrap();
        }

        let rounds = 10_000usize;
        let target = Bytes::from_static(b"/u");
        let body = Bytes::from_static(b"m");
        for _ in 0..rounds {
            exchange.dispatch(&target, &body, false);
        }

        let expected = rounds / subscribers.len();
        let tolerance = expected / 20; // 5%
        let mut total = 0;
        for (_, peer) in &subscribers {
            let got = peer.messages.borrow().len();
            total += got;
            assert!(
                got.abs_diff(expected) <= tolerance,
                "got {got}, expected {expected} +/- {tolerance}"
            );
        }
        assert_eq!(total, rounds);
    }

    #[test]
    fn disconnect_all_hangs_up_every_peer() {
        let exchange = Exchange::with_seed(7);
        let (_, pa) = attach(&exchange);
        let (_, pb) = attach(&exchange);

        exchange.disconnect_all();
        assert_eq!(pa.hangups.get(), 1);
        assert_eq!(pb.hangups.get(), 1);
    }
}
