//! In-process event bus.
//!
//! Events are produced by:
//! - the temperature manager (effective temperature changed)
//! - the power policy (state transitions, countdown ticks)
//! - the device-power facade (device state changes)
//! - the config store (SD card mounted / unmounted)
//!
//! Events are delivered synchronously to every matching handler, in
//! registration order, by whichever poster currently holds the delivery
//! role. A handler that posts while being delivered only enqueues; the
//! outer delivery loop drains it afterwards, so FIFO order holds.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ TempManager │────▶│              │     │ FanController    │
//! │ PowerPolicy │────▶│ Pending queue│────▶│ LogEventSink     │
//! │ DevicePower │────▶│ (bounded)    │     │ (any subscriber) │
//! │ ConfigStore │────▶│              │     │                  │
//! └─────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! Posters must not hold a subsystem lock while posting.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::{debug, warn};

use crate::device::{Device, DeviceState};
use crate::error::{Error, Result};
use crate::power::{PolicyState, PolicyStatus};
use crate::temp::SourceKind;

/// Maximum number of events waiting for delivery.
pub const QUEUE_DEPTH: usize = 16;

/// Maximum number of registered handlers.
pub const MAX_HANDLERS: usize = 32;

// ── Topics and payloads ───────────────────────────────────────

/// Event topic (the "base" an event is posted under).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Temp,
    Power,
    DeviceMon,
    Network,
    Storage,
}

/// Per-topic id selector used at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Every id on the topic.
    Any,
    /// Exactly one id.
    Id(u16),
}

/// Payload of [`TempEvent::Updated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempUpdate {
    /// New effective temperature (0.1 °C).
    pub temp: i16,
    pub source: SourceKind,
    pub prev_temp: i16,
    pub prev_source: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempEvent {
    Updated(TempUpdate),
    ManualModeChanged { enabled: bool },
}

impl TempEvent {
    pub const UPDATED: u16 = 1;
    pub const MANUAL_MODE_CHANGED: u16 = 2;
}

/// Reason a power-policy event was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEventKind {
    StateChanged { from: PolicyState, to: PolicyState },
    LowVoltage,
    ShutdownStart,
    Protected,
    RecoveryStart,
    RecoveryComplete,
    CountdownTick,
    DebugTick,
}

/// Power-policy event with a status snapshot taken when it fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerEvent {
    pub kind: PowerEventKind,
    pub status: PolicyStatus,
}

impl PowerEvent {
    pub const STATE_CHANGED: u16 = 1;
    pub const LOW_VOLTAGE: u16 = 2;
    pub const SHUTDOWN_START: u16 = 3;
    pub const PROTECTED: u16 = 4;
    pub const RECOVERY_START: u16 = 5;
    pub const RECOVERY_COMPLETE: u16 = 6;
    pub const COUNTDOWN_TICK: u16 = 7;
    pub const DEBUG_TICK: u16 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMonEvent {
    StateChanged {
        device: Device,
        from: DeviceState,
        to: DeviceState,
    },
}

impl DeviceMonEvent {
    pub const STATE_CHANGED: u16 = 1;
}

/// Network interface named in [`NetworkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Ethernet,
    Wifi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    LinkUp(Interface),
    LinkDown(Interface),
}

impl NetworkEvent {
    pub const LINK_UP: u16 = 1;
    pub const LINK_DOWN: u16 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    SdMounted,
    SdUnmounted,
    /// NVS keys copied to the card after a mount.
    Synced { keys: u16 },
}

impl StorageEvent {
    pub const SD_MOUNTED: u16 = 1;
    pub const SD_UNMOUNTED: u16 = 2;
    pub const SYNCED: u16 = 3;
}

/// A posted event. The payload is copied into the queue on post.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Temp(TempEvent),
    Power(PowerEvent),
    DeviceMon(DeviceMonEvent),
    Network(NetworkEvent),
    Storage(StorageEvent),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Temp(_) => Topic::Temp,
            Self::Power(_) => Topic::Power,
            Self::DeviceMon(_) => Topic::DeviceMon,
            Self::Network(_) => Topic::Network,
            Self::Storage(_) => Topic::Storage,
        }
    }

    /// Numeric id within the topic.
    pub fn id(&self) -> u16 {
        match self {
            Self::Temp(TempEvent::Updated(_)) => TempEvent::UPDATED,
            Self::Temp(TempEvent::ManualModeChanged { .. }) => TempEvent::MANUAL_MODE_CHANGED,
            Self::Power(p) => match p.kind {
                PowerEventKind::StateChanged { .. } => PowerEvent::STATE_CHANGED,
                PowerEventKind::LowVoltage => PowerEvent::LOW_VOLTAGE,
                PowerEventKind::ShutdownStart => PowerEvent::SHUTDOWN_START,
                PowerEventKind::Protected => PowerEvent::PROTECTED,
                PowerEventKind::RecoveryStart => PowerEvent::RECOVERY_START,
                PowerEventKind::RecoveryComplete => PowerEvent::RECOVERY_COMPLETE,
                PowerEventKind::CountdownTick => PowerEvent::COUNTDOWN_TICK,
                PowerEventKind::DebugTick => PowerEvent::DEBUG_TICK,
            },
            Self::DeviceMon(DeviceMonEvent::StateChanged { .. }) => DeviceMonEvent::STATE_CHANGED,
            Self::Network(NetworkEvent::LinkUp(_)) => NetworkEvent::LINK_UP,
            Self::Network(NetworkEvent::LinkDown(_)) => NetworkEvent::LINK_DOWN,
            Self::Storage(StorageEvent::SdMounted) => StorageEvent::SD_MOUNTED,
            Self::Storage(StorageEvent::SdUnmounted) => StorageEvent::SD_UNMOUNTED,
            Self::Storage(StorageEvent::Synced { .. }) => StorageEvent::SYNCED,
        }
    }
}

// ── Handler registry ──────────────────────────────────────────

/// Opaque registration handle returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

type HandlerFn = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: HandlerId,
    topic: Topic,
    filter: Filter,
    handler: HandlerFn,
    /// Cleared on unregister so an in-flight snapshot skips the handler.
    live: Arc<AtomicBool>,
}

impl Registration {
    fn matches(&self, event: &Event) -> bool {
        self.topic == event.topic()
            && match self.filter {
                Filter::Any => true,
                Filter::Id(id) => id == event.id(),
            }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub posted: u32,
    pub delivered: u32,
    pub dropped: u32,
    pub handlers: u32,
}

// ── Bus ───────────────────────────────────────────────────────

pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
    queue: Channel<CriticalSectionRawMutex, Event, QUEUE_DEPTH>,
    delivering: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU32,
    posted: AtomicU32,
    delivered: AtomicU32,
    dropped: AtomicU32,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            queue: Channel::new(),
            delivering: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            posted: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    /// Register `handler` for events on `topic` matching `filter`.
    pub fn register<F>(&self, topic: Topic, filter: Filter, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.len() >= MAX_HANDLERS {
            warn!("event: handler table full ({})", MAX_HANDLERS);
            return Err(Error::Internal("event handler table full"));
        }
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        handlers.push(Registration {
            id,
            topic,
            filter,
            handler: Arc::new(handler),
            live: Arc::new(AtomicBool::new(true)),
        });
        debug!("event: registered handler {:?} on {:?}/{:?}", id, topic, filter);
        Ok(id)
    }

    /// Remove a handler. No event is delivered to it after this returns.
    pub fn unregister(&self, id: HandlerId) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let idx = handlers.iter().position(|r| r.id == id).ok_or(Error::NotFound)?;
        let reg = handlers.remove(idx);
        reg.live.store(false, Ordering::Release);
        debug!("event: unregistered handler {:?}", id);
        Ok(())
    }

    /// Post an event.
    ///
    /// With `timeout_ms == 0` this never blocks and returns
    /// [`Error::Busy`] when the pending queue is full. A positive timeout
    /// retries until the deadline.
    pub fn post(&self, event: Event, timeout_ms: u32) -> Result<()> {
        self.push(event, timeout_ms, true)?;
        self.deliver_pending();
        Ok(())
    }

    /// Queue an event without delivering it. A full queue is never drained
    /// from here, so this is safe to call while holding a lock that
    /// handlers may take. Pair with [`flush`](Self::flush) once the lock
    /// is released.
    pub fn enqueue(&self, event: Event, timeout_ms: u32) -> Result<()> {
        self.push(event, timeout_ms, false)
    }

    /// Deliver whatever is queued, unless another context is already
    /// delivering.
    pub fn flush(&self) {
        self.deliver_pending();
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            posted: self.posted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handlers: self.handler_count() as u32,
        }
    }

    /// Stop accepting posts and drop every registration.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !handlers.is_empty() {
            warn!("event: shutting down with {} handler(s) still registered", handlers.len());
        }
        for reg in handlers.drain(..) {
            reg.live.store(false, Ordering::Release);
        }
        self.queue.clear();
    }

    // ── Internal ──────────────────────────────────────────────

    fn push(&self, event: Event, timeout_ms: u32, drain: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut pending = event;
        loop {
            match self.queue.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(ev)) => {
                    pending = ev;
                    // Drain if nobody else is delivering, then retry.
                    if drain && self.deliver_pending() {
                        continue;
                    }
                    if timeout_ms == 0 || Instant::now() >= deadline {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("event: queue full, dropped {:?}/{}", pending.topic(), pending.id());
                        return Err(Error::Busy);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the delivery role and drain the queue. Returns `false` if
    /// another context already holds the role.
    fn deliver_pending(&self) -> bool {
        if !self.take_role() {
            return false;
        }

        loop {
            {
                let _role = DeliveryRole(&self.delivering);
                while let Ok(event) = self.queue.try_receive() {
                    self.dispatch(&event);
                }
            }

            // A post may have landed between the last receive and the release.
            if self.queue.is_empty() || !self.take_role() {
                return true;
            }
        }
    }

    fn take_role(&self) -> bool {
        self.delivering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn dispatch(&self, event: &Event) {
        let targets: Vec<(HandlerFn, Arc<AtomicBool>)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.matches(event))
            .map(|r| (Arc::clone(&r.handler), Arc::clone(&r.live)))
            .collect();

        for (handler, live) in targets {
            if !live.load(Ordering::Acquire) {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("event: handler panicked on {:?}/{}", event.topic(), event.id());
                continue;
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Holds the delivery role; released on drop, including during unwinding.
struct DeliveryRole<'a>(&'a AtomicBool);

impl Drop for DeliveryRole<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn temp_event(temp: i16) -> Event {
        Event::Temp(TempEvent::Updated(TempUpdate {
            temp,
            source: SourceKind::SensorLocal,
            prev_temp: 250,
            prev_source: SourceKind::Default,
        }))
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            bus.register(Topic::Temp, Filter::Any, move |_| log.lock().unwrap().push(tag))
                .unwrap();
        }
        bus.post(temp_event(300), 0).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn filters_by_topic_and_id() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        bus.register(Topic::Temp, Filter::Id(TempEvent::UPDATED), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        bus.post(temp_event(300), 0).unwrap();
        bus.post(Event::Temp(TempEvent::ManualModeChanged { enabled: true }), 0)
            .unwrap();
        bus.post(Event::Storage(StorageEvent::SdMounted), 0).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_handler_sees_nothing() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let id = bus
            .register(Topic::Temp, Filter::Any, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        bus.post(temp_event(300), 0).unwrap();
        bus.unregister(id).unwrap();
        bus.post(temp_event(310), 0).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.unregister(id), Err(Error::NotFound));
    }

    #[test]
    fn reentrant_post_is_delivered_after_current_event() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = Arc::clone(&bus);
        let o = Arc::clone(&order);
        bus.register(Topic::Temp, Filter::Any, move |ev| {
            o.lock().unwrap().push(format!("temp:{}", ev.id()));
            let _ = inner_bus.post(Event::Storage(StorageEvent::SdMounted), 0);
        })
        .unwrap();
        let o = Arc::clone(&order);
        bus.register(Topic::Temp, Filter::Any, move |_| o.lock().unwrap().push("temp2".into()))
            .unwrap();
        let o = Arc::clone(&order);
        bus.register(Topic::Storage, Filter::Any, move |_| {
            o.lock().unwrap().push("storage".into());
        })
        .unwrap();

        bus.post(temp_event(300), 0).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["temp:1", "temp2", "storage"]);
    }

    #[test]
    fn full_queue_with_zero_timeout_returns_busy() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        let results = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&results);
        // Handler floods the queue while it holds the delivery role.
        bus.register(Topic::Network, Filter::Any, move |_| {
            for _ in 0..=QUEUE_DEPTH {
                r.lock()
                    .unwrap()
                    .push(inner.post(Event::Storage(StorageEvent::SdMounted), 0));
            }
        })
        .unwrap();

        bus.post(Event::Network(NetworkEvent::LinkUp(Interface::Ethernet)), 0)
            .unwrap();
        let results = results.lock().unwrap();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), QUEUE_DEPTH);
        assert_eq!(results.last(), Some(&Err(Error::Busy)));
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn panicking_handler_does_not_stall_delivery() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU32::new(0));
        bus.register(Topic::Storage, Filter::Any, |_| panic!("storage handler failed"))
            .unwrap();
        let h = Arc::clone(&hits);
        bus.register(Topic::Temp, Filter::Any, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let poster = Arc::clone(&bus);
        let posted = std::thread::spawn(move || poster.post(Event::Storage(StorageEvent::SdMounted), 0))
            .join();
        assert_eq!(posted.ok(), Some(Ok(())));

        bus.post(Event::Temp(TempEvent::ManualModeChanged { enabled: true }), 0)
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().delivered, 1);
    }

    #[test]
    fn role_is_released_when_dispatch_unwinds() {
        let bus = EventBus::new();
        assert!(bus.take_role());
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _role = DeliveryRole(&bus.delivering);
            panic!("dispatch failed");
        }));
        assert!(unwound.is_err());
        assert!(!bus.delivering.load(Ordering::Acquire));
    }

    #[test]
    fn enqueue_waits_for_flush() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        bus.register(Topic::Temp, Filter::Any, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        bus.enqueue(temp_event(300), 0).unwrap();
        bus.enqueue(temp_event(310), 0).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().posted, 2);
    }

    #[test]
    fn shutdown_rejects_posts() {
        let bus = EventBus::new();
        bus.register(Topic::Temp, Filter::Any, |_| {}).unwrap();
        bus.shutdown();
        assert_eq!(bus.handler_count(), 0);
        assert_eq!(bus.post(temp_event(300), 0), Err(Error::InvalidState));
    }

    #[test]
    fn stats_count_posts_and_deliveries() {
        let bus = EventBus::new();
        bus.register(Topic::Temp, Filter::Any, |_| {}).unwrap();
        bus.register(Topic::Temp, Filter::Any, |_| {}).unwrap();
        bus.post(temp_event(300), 0).unwrap();
        let s = bus.stats();
        assert_eq!(s.posted, 1);
        assert_eq!(s.delivered, 2);
        assert_eq!(s.handlers, 2);
    }
}
