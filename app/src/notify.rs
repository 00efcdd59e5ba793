//! Fan-out of kitchen events to whoever is watching.
//!
//! Each observer owns a bounded channel. Publishing never blocks: an observer
//! whose channel is full or whose receiver has gone away is dropped from the
//! registry, and the remaining observers still get the event.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::*;
use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "inventory_update")]
    StockChanged { ingredient: String, quantity: f64 },
    #[serde(rename = "inventory_update")]
    MealServed { meal: String, portions: u32 },
    #[serde(rename = "inventory_delete")]
    IngredientRemoved { ingredient: String },
    Alert { message: String },
    ReportUpdate { discrepancy: f64 },
}

#[derive(Debug)]
struct Observer {
    id: u64,
    tx: Sender<Event>,
}

#[derive(Debug, Default)]
struct Registry {
    observers: Vec<Observer>,
    next_id: u64,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<Event>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Notifier {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = bounded(self.capacity);
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push(Observer { id, tx });
        debug!("Observer {} subscribed; {} watching", id, registry.observers.len());
        Subscription { rx }
    }

    pub fn publish(&self, event: Event) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Publishing {:?} to {} observers", event, registry.observers.len());
        registry
            .observers
            .retain(|observer| match observer.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Observer {} fell behind; dropping it", observer.id);
                    false
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Observer {} went away", observer.id);
                    false
                }
            });
    }

    pub fn observers(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observers
            .len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(DEFAULT_CAPACITY)
    }
}

impl Subscription {
    /// Everything published since the last drain, without waiting.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}
