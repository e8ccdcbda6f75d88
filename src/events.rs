//! Typed publish/subscribe event bus.
//!
//! Per the design note in this crate's spec, subscribers are grouped by a
//! statically-typed event kind rather than registered against a single
//! duck-typed dispatch map. Delivery is synchronous, in subscription order,
//! on the caller's own stack — there is no queuing and no guaranteed
//! delivery: an event dispatched with no subscriber attached is simply
//! dropped. Dispatch is not reentrant: a subscriber must not call
//! `dispatch` again while it is running.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::proto;
use crate::session::DeviceStatus;

/// Broadcast vs. direct, mirrors `to == BROADCAST_ADDR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Broadcast,
    Direct,
}

/// Common envelope attached to every inbound application event.
#[derive(Debug, Clone)]
pub struct PacketMeta {
    pub id: u32,
    pub rx_time: DateTime<Utc>,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub kind: PacketKind,
}

#[derive(Debug, Clone)]
pub struct TextMessageEvent {
    pub meta: PacketMeta,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct WaypointEvent {
    pub meta: PacketMeta,
    pub waypoint: proto::Waypoint,
}

#[derive(Debug, Clone)]
pub struct PositionEvent {
    pub meta: PacketMeta,
    pub position: proto::Position,
}

#[derive(Debug, Clone)]
pub struct UserEvent {
    pub meta: PacketMeta,
    pub user: proto::User,
}

#[derive(Debug, Clone)]
pub struct RoutingEvent {
    pub meta: PacketMeta,
    pub routing: proto::Routing,
}

#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub meta: PacketMeta,
    pub telemetry: proto::Telemetry,
}

#[derive(Debug, Clone)]
pub struct TracerouteEvent {
    pub meta: PacketMeta,
    pub route: proto::RouteDiscovery,
}

#[derive(Debug, Clone)]
pub struct NeighborInfoEvent {
    pub meta: PacketMeta,
    pub neighbor_info: proto::NeighborInfo,
}

#[derive(Debug, Clone)]
pub struct PaxcountEvent {
    pub meta: PacketMeta,
    pub paxcount: proto::Paxcount,
}

#[derive(Debug, Clone)]
pub struct HardwareEvent {
    pub meta: PacketMeta,
    pub hardware: proto::HardwareMessage,
}

#[derive(Debug, Clone)]
pub struct AdminEvent {
    pub meta: PacketMeta,
    pub admin: proto::AdminMessage,
}

#[derive(Debug, Clone)]
pub struct RawPortEvent {
    pub meta: PacketMeta,
    pub port: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NodeInfoEvent {
    pub node: proto::NodeInfo,
}

#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub from: u32,
    pub at: DateTime<Utc>,
}

/// Every event kind the core can dispatch. One `Event` instance per
/// dispatch call; subscribers register against the matching [`EventKind`].
#[derive(Debug, Clone)]
pub enum Event {
    RawFromRadio(proto::FromRadio),
    RawMeshPacket(proto::MeshPacket),
    MyNodeInfo(proto::MyNodeInfo),
    NodeInfo(NodeInfoEvent),
    Config(proto::Config),
    ModuleConfig(proto::ModuleConfig),
    Channel(proto::Channel),
    LogRecord(proto::LogRecord),
    QueueStatus(proto::QueueStatus),
    Metadata(proto::DeviceMetadata),
    DeviceStatus(DeviceStatus),
    Heartbeat(HeartbeatEvent),
    PendingChangesChanged(bool),
    TextMessage(TextMessageEvent),
    Waypoint(WaypointEvent),
    Position(PositionEvent),
    User(UserEvent),
    Routing(RoutingEvent),
    Admin(AdminEvent),
    Telemetry(TelemetryEvent),
    Traceroute(TracerouteEvent),
    NeighborInfoReport(NeighborInfoEvent),
    Paxcount(PaxcountEvent),
    Hardware(HardwareEvent),
    Raw(RawPortEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RawFromRadio,
    RawMeshPacket,
    MyNodeInfo,
    NodeInfo,
    Config,
    ModuleConfig,
    Channel,
    LogRecord,
    QueueStatus,
    Metadata,
    DeviceStatus,
    Heartbeat,
    PendingChangesChanged,
    TextMessage,
    Waypoint,
    Position,
    User,
    Routing,
    Admin,
    Telemetry,
    Traceroute,
    NeighborInfoReport,
    Paxcount,
    Hardware,
    Raw,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RawFromRadio(_) => EventKind::RawFromRadio,
            Event::RawMeshPacket(_) => EventKind::RawMeshPacket,
            Event::MyNodeInfo(_) => EventKind::MyNodeInfo,
            Event::NodeInfo(_) => EventKind::NodeInfo,
            Event::Config(_) => EventKind::Config,
            Event::ModuleConfig(_) => EventKind::ModuleConfig,
            Event::Channel(_) => EventKind::Channel,
            Event::LogRecord(_) => EventKind::LogRecord,
            Event::QueueStatus(_) => EventKind::QueueStatus,
            Event::Metadata(_) => EventKind::Metadata,
            Event::DeviceStatus(_) => EventKind::DeviceStatus,
            Event::Heartbeat(_) => EventKind::Heartbeat,
            Event::PendingChangesChanged(_) => EventKind::PendingChangesChanged,
            Event::TextMessage(_) => EventKind::TextMessage,
            Event::Waypoint(_) => EventKind::Waypoint,
            Event::Position(_) => EventKind::Position,
            Event::User(_) => EventKind::User,
            Event::Routing(_) => EventKind::Routing,
            Event::Admin(_) => EventKind::Admin,
            Event::Telemetry(_) => EventKind::Telemetry,
            Event::Traceroute(_) => EventKind::Traceroute,
            Event::NeighborInfoReport(_) => EventKind::NeighborInfoReport,
            Event::Paxcount(_) => EventKind::Paxcount,
            Event::Hardware(_) => EventKind::Hardware,
            Event::Raw(_) => EventKind::Raw,
        }
    }
}

type Subscriber = Box<dyn FnMut(&Event) + Send>;

/// Subscription handle returned by [`EventBus::subscribe`]; drop it (or call
/// nothing) to leave the subscriber attached for the bus's lifetime, or pass
/// it to [`EventBus::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(u64, Subscriber)>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            subscribers: HashMap::new(),
        }
    }

    /// Register a subscriber for a single event kind. Invoked synchronously,
    /// in registration order, every time a matching event is dispatched.
    pub fn subscribe(&mut self, kind: EventKind, handler: impl FnMut(&Event) + Send + 'static) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.entry(kind).or_default().push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&mut self, kind: EventKind, id: SubscriptionId) {
        if let Some(list) = self.subscribers.get_mut(&kind) {
            list.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    /// Dispatch `event` to every subscriber of its kind, in subscription
    /// order. A kind with no subscribers silently drops the event.
    pub fn dispatch(&mut self, event: Event) {
        if let Some(list) = self.subscribers.get_mut(&event.kind()) {
            for (_, handler) in list.iter_mut() {
                handler(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatch_invokes_subscribers_in_registration_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(EventKind::MyNodeInfo, move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.subscribe(EventKind::MyNodeInfo, move |_| o2.lock().unwrap().push(2));

        bus.dispatch(Event::MyNodeInfo(proto::MyNodeInfo { my_node_num: 7, reboot_count: 0 }));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn event_with_no_subscriber_is_dropped_without_panicking() {
        let mut bus = EventBus::new();
        bus.dispatch(Event::MyNodeInfo(proto::MyNodeInfo { my_node_num: 1, reboot_count: 0 }));
    }

    #[test]
    fn unsubscribed_handler_stops_receiving() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe(EventKind::Heartbeat, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(Event::Heartbeat(HeartbeatEvent { from: 1, at: Utc::now() }));
        bus.unsubscribe(EventKind::Heartbeat, id);
        bus.dispatch(Event::Heartbeat(HeartbeatEvent { from: 1, at: Utc::now() }));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
