//! Log-based event sink.
//!
//! Subscribes to every bus topic and writes one structured line per event
//! to the logger (UART / USB-CDC in production). Useful as the default
//! observer when no network consumer is attached.

use std::sync::Arc;

use log::info;

use crate::error::Result;
use crate::events::{
    DeviceMonEvent, Event, EventBus, Filter, HandlerId, NetworkEvent, PowerEventKind,
    StorageEvent, TempEvent, Topic,
};

const TOPICS: [Topic; 5] = [
    Topic::Temp,
    Topic::Power,
    Topic::DeviceMon,
    Topic::Network,
    Topic::Storage,
];

/// Registration handles held by the sink; dropped with [`LogEventSink::detach`].
pub struct LogEventSink {
    bus: Arc<EventBus>,
    handles: Vec<HandlerId>,
}

impl LogEventSink {
    /// Register on every topic.
    pub fn attach(bus: Arc<EventBus>) -> Result<Self> {
        let mut handles = Vec::with_capacity(TOPICS.len());
        for topic in TOPICS {
            handles.push(bus.register(topic, Filter::Any, |ev| emit(ev))?);
        }
        Ok(Self { bus, handles })
    }

    pub fn detach(self) {
        for id in self.handles {
            let _ = self.bus.unregister(id);
        }
    }
}

fn emit(event: &Event) {
    match event {
        Event::Temp(TempEvent::Updated(u)) => {
            info!(
                "TEMP  | {:.1}\u{00b0}C via {} (was {:.1}\u{00b0}C via {})",
                f32::from(u.temp) / 10.0,
                u.source.name(),
                f32::from(u.prev_temp) / 10.0,
                u.prev_source.name(),
            );
        }
        Event::Temp(TempEvent::ManualModeChanged { enabled }) => {
            info!("TEMP  | manual mode {}", if *enabled { "on" } else { "off" });
        }
        Event::Power(p) => match p.kind {
            PowerEventKind::StateChanged { from, to } => {
                info!("POWER | {} -> {} @ {:.2}V", from.name(), to.name(), p.status.voltage);
            }
            PowerEventKind::CountdownTick => {
                info!("POWER | shutdown in {}s", p.status.countdown_sec);
            }
            kind => {
                info!(
                    "POWER | {:?} state={} V={:.2}",
                    kind,
                    p.status.state.name(),
                    p.status.voltage
                );
            }
        },
        Event::DeviceMon(DeviceMonEvent::StateChanged { device, from, to }) => {
            info!("DEV   | {} {} -> {}", device.name(), from.name(), to.name());
        }
        Event::Network(NetworkEvent::LinkUp(iface)) => info!("NET   | {:?} up", iface),
        Event::Network(NetworkEvent::LinkDown(iface)) => info!("NET   | {:?} down", iface),
        Event::Storage(StorageEvent::SdMounted) => info!("STORE | SD mounted"),
        Event::Storage(StorageEvent::SdUnmounted) => info!("STORE | SD unmounted"),
        Event::Storage(StorageEvent::Synced { keys }) => {
            info!("STORE | {} record(s) synced to SD", keys);
        }
    }
}
