//! fromRadio demultiplexer (§4.4.3–§4.4.5).
//!
//! For every decoded `FromRadio` message: dispatch a raw event, then switch
//! on the payload variant. Mesh packets get a further two-level dispatch
//! (raw packet → decoded port), with `ROUTING_APP` and `ADMIN_APP` carrying
//! extra correlation/re-routing semantics.

use chrono::Utc;

use crate::error::{CoreError, CoreResult};
use crate::events::{
    AdminEvent, Event, HardwareEvent, HeartbeatEvent, NeighborInfoEvent, NodeInfoEvent, PacketKind, PacketMeta,
    PaxcountEvent, PositionEvent, RawPortEvent, RoutingEvent, TelemetryEvent, TextMessageEvent, TracerouteEvent,
    UserEvent, WaypointEvent,
};
use crate::destination::BROADCAST_ADDR;
use crate::proto::{self, from_radio, mesh_packet, routing};
use crate::transport::Transport;

use super::{DeviceSession, DeviceStatus};

impl<T: Transport + 'static> DeviceSession<T> {
    pub(crate) async fn handle_from_radio(&self, message: proto::FromRadio) -> CoreResult<()> {
        self.dispatch(Event::RawFromRadio(message.clone()));

        let Some(variant) = message.payload_variant else {
            log::warn!("FromRadio message with no payload variant");
            return Ok(());
        };

        match variant {
            from_radio::PayloadVariant::Packet(packet) => self.handle_mesh_packet(packet).await,
            from_radio::PayloadVariant::MyInfo(info) => {
                self.state.lock(|cell| cell.borrow_mut().my_node_num = Some(info.my_node_num));
                self.dispatch(Event::MyNodeInfo(info));
                Ok(())
            }
            from_radio::PayloadVariant::NodeInfo(node) => {
                self.dispatch(Event::NodeInfo(NodeInfoEvent { node: node.clone() }));
                let has_position = node.position.is_some();
                let has_user = node.user.is_some();
                if has_position || has_user {
                    let meta = PacketMeta {
                        id: 0,
                        rx_time: Utc::now(),
                        from: node.num,
                        to: node.num,
                        channel: 0,
                        kind: PacketKind::Direct,
                    };
                    if let Some(position) = node.position {
                        self.dispatch(Event::Position(PositionEvent { meta: meta.clone(), position }));
                    }
                    if let Some(user) = node.user {
                        self.dispatch(Event::User(UserEvent { meta, user }));
                    }
                }
                Ok(())
            }
            from_radio::PayloadVariant::Config(config) => {
                self.dispatch(Event::Config(config));
                Ok(())
            }
            from_radio::PayloadVariant::ModuleConfig(module_config) => {
                self.dispatch(Event::ModuleConfig(module_config));
                Ok(())
            }
            from_radio::PayloadVariant::Channel(channel) => {
                self.dispatch(Event::Channel(channel));
                Ok(())
            }
            from_radio::PayloadVariant::LogRecord(record) => {
                self.dispatch(Event::LogRecord(record));
                Ok(())
            }
            from_radio::PayloadVariant::ConfigCompleteId(id) => {
                if id != self.lockstep_id {
                    log::error!(
                        "configuration lockstep mismatch: expected {:#010x}, got {id:#010x} (proceeding anyway)",
                        self.lockstep_id
                    );
                }
                self.set_status(DeviceStatus::Configured);
                Ok(())
            }
            from_radio::PayloadVariant::Rebooted(_) => self.configure().await,
            from_radio::PayloadVariant::QueueStatus(status) => {
                self.dispatch(Event::QueueStatus(status));
                Ok(())
            }
            from_radio::PayloadVariant::XmodemPacket(frame) => self.xmodem.handle_packet(frame).await,
            from_radio::PayloadVariant::Metadata(metadata) => {
                if metadata.firmware_version < self.config.minimum_firmware_version {
                    log::error!(
                        "firmware version {} is below the minimum supported version {} (fatal, continuing anyway)",
                        metadata.firmware_version,
                        self.config.minimum_firmware_version
                    );
                }
                self.dispatch(Event::Metadata(metadata));
                Ok(())
            }
            from_radio::PayloadVariant::MqttClientProxyMessage(_) => Ok(()),
        }
    }

    async fn handle_mesh_packet(&self, packet: proto::MeshPacket) -> CoreResult<()> {
        self.dispatch(Event::RawMeshPacket(packet.clone()));

        if Some(packet.from) != self.my_node_num() {
            self.dispatch(Event::Heartbeat(HeartbeatEvent { from: packet.from, at: Utc::now() }));
        }

        match packet.payload_variant.clone() {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => self.handle_decoded(&packet, data).await,
            Some(mesh_packet::PayloadVariant::Encrypted(_)) => {
                log::debug!("ignoring encrypted mesh packet id={}", packet.id);
                Ok(())
            }
            None => Err(CoreError::ProtocolError(format!(
                "mesh packet id={} carries no payload variant",
                packet.id
            ))),
        }
    }

    async fn handle_decoded(&self, packet: &proto::MeshPacket, data: proto::Data) -> CoreResult<()> {
        let meta = PacketMeta {
            id: packet.id,
            rx_time: Utc::now(),
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            kind: if packet.to == BROADCAST_ADDR { PacketKind::Broadcast } else { PacketKind::Direct },
        };
        self.dispatch_decoded(meta, data);
        Ok(())
    }

    /// Port-based typed dispatch (§4.4.5), shared between inbound mesh
    /// packets and `sendPacket`'s `echoResponse` self-injection.
    pub(crate) fn dispatch_decoded(&self, meta: PacketMeta, data: proto::Data) {
        let port = proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp);

        match port {
            proto::PortNum::TextMessageApp => {
                let text = String::from_utf8_lossy(&data.payload).into_owned();
                self.dispatch(Event::TextMessage(TextMessageEvent { meta, text }));
            }
            proto::PortNum::PositionApp => {
                if let Ok(position) = proto::Position::decode_bytes(&data.payload) {
                    self.dispatch(Event::Position(PositionEvent { meta, position }));
                }
            }
            proto::PortNum::NodeinfoApp => {
                if let Ok(user) = proto::User::decode_bytes(&data.payload) {
                    self.dispatch(Event::User(UserEvent { meta, user }));
                }
            }
            proto::PortNum::WaypointApp => {
                if let Ok(waypoint) = proto::Waypoint::decode_bytes(&data.payload) {
                    self.dispatch(Event::Waypoint(WaypointEvent { meta, waypoint }));
                }
            }
            proto::PortNum::RoutingApp => {
                if let Ok(routing) = proto::Routing::decode_bytes(&data.payload) {
                    self.handle_routing(&meta, &data, routing);
                }
            }
            proto::PortNum::AdminApp => {
                if let Ok(admin) = proto::AdminMessage::decode_bytes(&data.payload) {
                    self.handle_admin(meta, admin);
                }
            }
            proto::PortNum::TelemetryApp => {
                if let Ok(telemetry) = proto::Telemetry::decode_bytes(&data.payload) {
                    self.dispatch(Event::Telemetry(TelemetryEvent { meta, telemetry }));
                }
            }
            proto::PortNum::TracerouteApp => {
                if let Ok(route) = proto::RouteDiscovery::decode_bytes(&data.payload) {
                    self.dispatch(Event::Traceroute(TracerouteEvent { meta, route }));
                }
            }
            proto::PortNum::NeighborinfoApp => {
                if let Ok(neighbor_info) = proto::NeighborInfo::decode_bytes(&data.payload) {
                    self.dispatch(Event::NeighborInfoReport(NeighborInfoEvent { meta, neighbor_info }));
                }
            }
            proto::PortNum::PaxcounterApp => {
                if let Ok(paxcount) = proto::Paxcount::decode_bytes(&data.payload) {
                    self.dispatch(Event::Paxcount(PaxcountEvent { meta, paxcount }));
                }
            }
            proto::PortNum::RemoteHardwareApp => {
                if let Ok(hardware) = proto::HardwareMessage::decode_bytes(&data.payload) {
                    self.dispatch(Event::Hardware(HardwareEvent { meta, hardware }));
                }
            }
            other => {
                self.dispatch(Event::Raw(RawPortEvent { meta, port: other as i32, payload: data.payload }));
            }
        }
    }

    fn handle_routing(&self, meta: &PacketMeta, data: &proto::Data, routing: proto::Routing) {
        self.dispatch(Event::Routing(RoutingEvent { meta: meta.clone(), routing: routing.clone() }));

        if let Some(routing::Variant::ErrorReason(reason)) = routing.variant {
            let reason = routing::ErrorReason::try_from(reason).unwrap_or(routing::ErrorReason::None);
            if reason == routing::ErrorReason::None {
                self.queue.process_ack(data.request_id);
            } else {
                self.queue.process_error(data.request_id, CoreError::RoutingError(reason));
            }
        }
    }

    fn handle_admin(&self, meta: PacketMeta, admin: proto::AdminMessage) {
        use crate::proto::admin_message::PayloadVariant as A;

        match admin.payload_variant.clone() {
            Some(A::GetConfigResponse(config)) => self.dispatch(Event::Config(config)),
            Some(A::GetModuleConfigResponse(module_config)) => self.dispatch(Event::ModuleConfig(module_config)),
            Some(A::GetChannelResponse(channel)) => self.dispatch(Event::Channel(channel)),
            Some(A::GetOwnerResponse(user)) => self.dispatch(Event::User(UserEvent { meta: meta.clone(), user })),
            Some(A::GetDeviceMetadataResponse(metadata)) => self.dispatch(Event::Metadata(metadata)),
            _ => {}
        }
        self.dispatch(Event::Admin(AdminEvent { meta, admin }));
    }
}

/// Small helper trait so `demux` can decode an optional inner message type
/// with one call site instead of repeating `Message::decode` + map_err.
trait DecodeBytes: Sized {
    fn decode_bytes(buf: &[u8]) -> Result<Self, prost::DecodeError>;
}

impl<M: prost::Message + Default> DecodeBytes for M {
    fn decode_bytes(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        <M as prost::Message>::decode(buf)
    }
}
