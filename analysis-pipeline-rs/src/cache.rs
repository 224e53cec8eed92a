// analysis-pipeline-rs/src/cache.rs
//
// Fingerprint cache with single-flight reservations: at most one analysis is
// ever in flight per fingerprint, and every concurrent caller for that
// fingerprint receives the same terminal result. All mutation happens inside
// one mutex around the map; analysis work runs outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use crate::finding::{AnalysisResult, AnalysisStatus};
use crate::transaction::Fingerprint;

type Slot = watch::Receiver<Option<Arc<AnalysisResult>>>;

enum Entry {
    /// Completed analysis, eligible for eviction.
    Ready(Arc<AnalysisResult>),
    /// Reserved: a worker owns the ticket; waiters subscribe to the channel.
    InFlight(Slot),
}

struct CacheInner {
    map: HashMap<Fingerprint, Entry>,
    /// LRU order, oldest first. Contains exactly the keys of `map`.
    order: Vec<Fingerprint>,
    capacity: usize,
}

impl CacheInner {
    fn touch(&mut self, fingerprint: &Fingerprint) {
        if let Some(pos) = self.order.iter().position(|fp| fp == fingerprint) {
            let fp = self.order.remove(pos);
            self.order.push(fp);
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) {
        self.map.remove(fingerprint);
        if let Some(pos) = self.order.iter().position(|fp| fp == fingerprint) {
            self.order.remove(pos);
        }
    }

    /// Evicts ready entries, oldest first, until within capacity. In-flight
    /// reservations are never evicted.
    fn evict_to_capacity(&mut self) {
        while self.map.len() > self.capacity {
            let victim = self
                .order
                .iter()
                .find(|fp| matches!(self.map.get(*fp), Some(Entry::Ready(_))))
                .copied();
            match victim {
                Some(fp) => {
                    debug!(fingerprint = %fp.short_hex(), "evicting cached analysis");
                    self.remove(&fp);
                }
                None => break,
            }
        }
    }
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// A completed result is already cached.
    Hit(Arc<AnalysisResult>),
    /// The caller now owns the exclusive right to run this analysis.
    Reserved(Ticket),
    /// Another caller already owns the reservation; subscribe to its result.
    Pending(Waiter),
}

/// Exclusive right to analyze one fingerprint. Must be resolved through
/// `complete` or `fail`; dropping an unresolved ticket releases waiters with
/// a failure so nobody blocks forever.
pub struct Ticket {
    fingerprint: Fingerprint,
    tx: Option<watch::Sender<Option<Arc<AnalysisResult>>>>,
    rx: Slot,
    shared: Arc<Mutex<CacheInner>>,
}

impl Ticket {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Receiver for the ticket's own result channel, so the submitting
    /// caller can await the value it will eventually publish.
    pub(crate) fn subscribe(&self) -> Slot {
        self.rx.clone()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let result = Arc::new(AnalysisResult::failed(
                self.fingerprint,
                "analysis abandoned before completion".to_string(),
                String::new(),
                Utc::now(),
            ));
            if let Ok(mut inner) = self.shared.lock() {
                inner.remove(&self.fingerprint);
            }
            let _ = tx.send(Some(result));
        }
    }
}

/// Subscription to an in-flight analysis owned by someone else.
pub struct Waiter {
    fingerprint: Fingerprint,
    rx: Slot,
}

impl Waiter {
    pub(crate) fn into_receiver(self) -> Slot {
        self.rx
    }

    /// Suspends until the owning ticket resolves. Always yields a value.
    pub async fn wait(mut self) -> Arc<AnalysisResult> {
        loop {
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return result;
            }
            if self.rx.changed().await.is_err() {
                // Sender vanished without publishing; surface as a failure
                // rather than hanging the caller.
                return Arc::new(AnalysisResult::failed(
                    self.fingerprint,
                    "analysis abandoned before completion".to_string(),
                    String::new(),
                    Utc::now(),
                ));
            }
        }
    }
}

/// Bounded single-flight result cache keyed by fingerprint.
pub struct FingerprintCache {
    shared: Arc<Mutex<CacheInner>>,
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(CacheInner {
                map: HashMap::new(),
                order: Vec::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    /// Looks up the fingerprint, reserving it when absent. The invariant:
    /// no fingerprint ever has more than one outstanding reservation.
    pub fn lookup_or_reserve(&self, fingerprint: Fingerprint) -> Lookup {
        let mut inner = self.shared.lock().expect("cache mutex poisoned");
        match inner.map.get(&fingerprint) {
            Some(Entry::Ready(result)) => {
                let result = Arc::clone(result);
                inner.touch(&fingerprint);
                Lookup::Hit(result)
            }
            Some(Entry::InFlight(rx)) => Lookup::Pending(Waiter {
                fingerprint,
                rx: rx.clone(),
            }),
            None => {
                let (tx, rx) = watch::channel(None);
                inner.map.insert(fingerprint, Entry::InFlight(rx.clone()));
                inner.order.push(fingerprint);
                inner.evict_to_capacity();
                Lookup::Reserved(Ticket {
                    fingerprint,
                    tx: Some(tx),
                    rx,
                    shared: Arc::clone(&self.shared),
                })
            }
        }
    }

    /// Publishes a successful result: cached for future hits, and every
    /// waiter is released with the same value.
    pub fn complete(&self, mut ticket: Ticket, result: Arc<AnalysisResult>) {
        let Some(tx) = ticket.tx.take() else {
            return;
        };
        {
            let mut inner = self.shared.lock().expect("cache mutex poisoned");
            if result.status == AnalysisStatus::Succeeded {
                inner
                    .map
                    .insert(ticket.fingerprint, Entry::Ready(Arc::clone(&result)));
                inner.touch(&ticket.fingerprint);
                // A reservation may have carried the map over capacity while
                // every other entry was in flight; enforce the bound now.
                inner.evict_to_capacity();
            } else {
                // Failures and cancellations release waiters but are not
                // cached; a later submission may retry.
                inner.remove(&ticket.fingerprint);
            }
        }
        let _ = tx.send(Some(result));
    }

    /// Releases the reservation with a failed or cancelled result. Never
    /// cached, so a subsequent submission retries from scratch.
    pub fn fail(&self, ticket: Ticket, result: Arc<AnalysisResult>) {
        self.complete(ticket, result);
    }

    pub fn len(&self) -> usize {
        self.shared.lock().expect("cache mutex poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
