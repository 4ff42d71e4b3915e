//! Selector layer
//!
//! Selectors are pure functions of a [`StoreSnapshot`]. The registry keeps the
//! last output of every subscription and calls back only when a batch changes
//! it. Every selector notified for a batch reads that batch's snapshot, so
//! related selectors never observe a partially applied batch.
//!
//! Subscriptions live in an arena: removal is O(1) by handle and notification
//! runs in slot order.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;

use crm_common::types::{EntityId, EntityKind};

use crate::engine::{Batch, Touched};
use crate::store::StoreSnapshot;

/// Pure derivation over the store
pub trait Selector: Send + Sync + 'static {
    type Output: PartialEq + Clone + Send + Sync + 'static;

    /// Entity kinds the output depends on
    fn kinds(&self) -> &[EntityKind];

    /// Whether a change to this entity can affect the output
    fn touches(&self, kind: EntityKind, id: &EntityId) -> bool {
        let _ = (kind, id);
        true
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output;
}

/// Whether `selector` must be recomputed for a batch
pub fn is_affected<S: Selector + ?Sized>(selector: &S, touched: &Touched) -> bool {
    selector.kinds().iter().any(|&kind| {
        touched.channel_changed(kind.channel())
            || (touched.touches_kind(kind) && touched.ids(kind).any(|id| selector.touches(kind, id)))
    })
}

type Predicate = Box<dyn Fn(EntityKind, &EntityId) -> bool + Send + Sync>;

/// Selector built from a closure
pub struct FnSelector<F, O> {
    kinds: Vec<EntityKind>,
    select: F,
    predicate: Option<Predicate>,
    _output: PhantomData<fn() -> O>,
}

impl<F, O> FnSelector<F, O>
where
    F: Fn(&StoreSnapshot) -> O + Send + Sync + 'static,
    O: PartialEq + Clone + Send + Sync + 'static,
{
    pub fn new(kinds: impl Into<Vec<EntityKind>>, select: F) -> Self {
        Self {
            kinds: kinds.into(),
            select,
            predicate: None,
            _output: PhantomData,
        }
    }

    /// Narrow which entity changes trigger a recomputation
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(EntityKind, &EntityId) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }
}

impl<F, O> Selector for FnSelector<F, O>
where
    F: Fn(&StoreSnapshot) -> O + Send + Sync + 'static,
    O: PartialEq + Clone + Send + Sync + 'static,
{
    type Output = O;

    fn kinds(&self) -> &[EntityKind] {
        &self.kinds
    }

    fn touches(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(kind, id))
    }

    fn select(&self, store: &StoreSnapshot) -> O {
        (self.select)(store)
    }
}

/// Output paired with the freshness of the channels it was read from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedValue<O> {
    pub value: O,
    /// Some input channel may be outdated
    pub stale: bool,
    /// Every input channel is live and fresh
    pub live: bool,
}

/// Wraps a selector so consumers can tell live data from stale data
pub struct Tracked<S>(pub S);

impl<S: Selector> Selector for Tracked<S> {
    type Output = TrackedValue<S::Output>;

    fn kinds(&self) -> &[EntityKind] {
        self.0.kinds()
    }

    fn touches(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.0.touches(kind, id)
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        let channels = self.0.kinds().iter().map(|k| k.channel());
        TrackedValue {
            value: self.0.select(store),
            stale: channels.clone().any(|c| store.is_stale(c)),
            live: channels.clone().all(|c| store.is_live(c)),
        }
    }
}

/// Identifies a subscription slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: usize,
    generation: u64,
}

trait Subscriber: Send + Sync {
    fn notify(&self, batch: &Batch);
    fn deactivate(&self);
}

struct Slot<S: Selector> {
    selector: S,
    callback: Box<dyn Fn(&S::Output) + Send + Sync>,
    last: Arc<Mutex<S::Output>>,
    alive: AtomicBool,
    /// Held while the callback runs; reentrant so a callback may unsubscribe itself
    gate: ReentrantMutex<()>,
}

impl<S: Selector> Subscriber for Slot<S> {
    fn notify(&self, batch: &Batch) {
        if !self.alive.load(Ordering::Acquire) || !is_affected(&self.selector, &batch.touched) {
            return;
        }
        let _gate = self.gate.lock();
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let value = self.selector.select(&batch.snapshot);
        {
            let mut last = self.last.lock();
            if *last == value {
                return;
            }
            *last = value.clone();
        }
        (self.callback)(&value);
    }

    fn deactivate(&self) {
        self.alive.store(false, Ordering::Release);
        // Wait out a callback in flight on another thread
        drop(self.gate.lock());
    }
}

struct Entry {
    generation: u64,
    subscriber: Arc<dyn Subscriber>,
}

struct Arena {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    next_generation: u64,
    current: Arc<StoreSnapshot>,
}

/// Registry of selector subscriptions; also the publication point of the
/// current store snapshot
pub struct SelectorRegistry {
    arena: RwLock<Arena>,
}

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                next_generation: 0,
                current: Arc::new(StoreSnapshot::empty()),
            }),
        }
    }

    /// Subscribe `callback` to changes of `selector`'s output. The initial
    /// output is computed immediately and available on the handle; the
    /// callback only fires for later changes.
    pub fn subscribe<S, F>(self: &Arc<Self>, selector: S, callback: F) -> SubscriptionHandle<S::Output>
    where
        S: Selector,
        F: Fn(&S::Output) + Send + Sync + 'static,
    {
        let mut arena = self.arena.write();
        let initial = selector.select(&arena.current);
        let last = Arc::new(Mutex::new(initial));
        let slot = Slot {
            selector,
            callback: Box::new(callback),
            last: Arc::clone(&last),
            alive: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        };

        arena.next_generation += 1;
        let generation = arena.next_generation;
        let entry = Entry {
            generation,
            subscriber: Arc::new(slot),
        };
        let index = match arena.free.pop() {
            Some(index) => {
                arena.slots[index] = Some(entry);
                index
            }
            None => {
                arena.slots.push(Some(entry));
                arena.slots.len() - 1
            }
        };

        SubscriptionHandle {
            registry: Arc::downgrade(self),
            key: SlotKey { index, generation },
            value: last,
            active: true,
        }
    }

    /// Remove a subscription. Once this returns its callback will not run again.
    pub fn unsubscribe(&self, key: SlotKey) -> bool {
        let removed = {
            let mut arena = self.arena.write();
            let live = arena
                .slots
                .get(key.index)
                .and_then(Option::as_ref)
                .is_some_and(|e| e.generation == key.generation);
            if live {
                arena.free.push(key.index);
                arena.slots[key.index].take()
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                entry.subscriber.deactivate();
                true
            }
            None => false,
        }
    }

    /// Publish a batch and notify affected subscriptions in slot order
    pub fn notify(&self, batch: &Batch) {
        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let mut arena = self.arena.write();
            arena.current = Arc::clone(&batch.snapshot);
            arena
                .slots
                .iter()
                .flatten()
                .map(|e| Arc::clone(&e.subscriber))
                .collect()
        };
        for subscriber in subscribers {
            subscriber.notify(batch);
        }
    }

    /// Replace the whole store (teardown, baseline restore) and re-evaluate
    /// every subscription against it
    pub fn replace(&self, snapshot: Arc<StoreSnapshot>) {
        let batch = Batch {
            seq: snapshot.seq,
            touched: Touched::all_channels(),
            snapshot,
        };
        self.notify(&batch);
    }

    /// Most recently published snapshot
    #[must_use]
    pub fn current(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.arena.read().current)
    }

    /// Evaluate a selector once against the current snapshot
    pub fn select<S: Selector>(&self, selector: &S) -> S::Output {
        selector.select(&self.current())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.read().slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live subscription; unsubscribes when dropped
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle<O> {
    registry: Weak<SelectorRegistry>,
    key: SlotKey,
    value: Arc<Mutex<O>>,
    active: bool,
}

impl<O: Clone> SubscriptionHandle<O> {
    /// Last output delivered (or the initial one)
    #[must_use]
    pub fn get(&self) -> O {
        self.value.lock().clone()
    }
}

impl<O> SubscriptionHandle<O> {
    #[must_use]
    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the subscription alive after the handle goes away; remove it
    /// later with [`SelectorRegistry::unsubscribe`]
    pub fn detach(mut self) -> SlotKey {
        self.active = false;
        self.key
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.key);
        }
    }
}

impl<O> Drop for SubscriptionHandle<O> {
    fn drop(&mut self) {
        self.release();
    }
}
