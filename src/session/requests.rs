//! Outbound request construction (§4.4.1): admin operations and the
//! application-level send surface (`sendText`/`sendWaypoint`/`sendPacket`).
//!
//! Every operation here ends the same way: build a `MeshPacket`, frame it,
//! hand it to the transmit queue, and drain. The queue — not this module —
//! owns ordering and ack correlation.

use chrono::Utc;
use prost::Message;

use crate::destination::{ChannelIndex, Destination};
use crate::error::CoreResult;
use crate::events::{Event, PacketKind, PacketMeta};
use crate::id::generate_packet_id;
use crate::proto::{self, admin_message::PayloadVariant as Admin};
use crate::queue::SendFuture;
use crate::transport::Transport;

use super::DeviceSession;

/// Maps onto [`proto::AdminConfigType`] for `getConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminConfigKind {
    Device,
    Position,
    Power,
    Network,
    Display,
    Lora,
    Bluetooth,
}

impl From<AdminConfigKind> for proto::AdminConfigType {
    fn from(kind: AdminConfigKind) -> Self {
        match kind {
            AdminConfigKind::Device => proto::AdminConfigType::DeviceConfig,
            AdminConfigKind::Position => proto::AdminConfigType::PositionConfig,
            AdminConfigKind::Power => proto::AdminConfigType::PowerConfig,
            AdminConfigKind::Network => proto::AdminConfigType::NetworkConfig,
            AdminConfigKind::Display => proto::AdminConfigType::DisplayConfig,
            AdminConfigKind::Lora => proto::AdminConfigType::LoraConfig,
            AdminConfigKind::Bluetooth => proto::AdminConfigType::BluetoothConfig,
        }
    }
}

/// Maps onto [`proto::AdminModuleConfigType`] for `getModuleConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminModuleConfigKind {
    Mqtt,
    Serial,
    ExtNotification,
    StoreForward,
    RangeTest,
    Telemetry,
    CannedMessage,
    Audio,
    RemoteHardware,
    NeighborInfo,
    AmbientLighting,
    DetectionSensor,
    Paxcounter,
}

impl From<AdminModuleConfigKind> for proto::AdminModuleConfigType {
    fn from(kind: AdminModuleConfigKind) -> Self {
        match kind {
            AdminModuleConfigKind::Mqtt => proto::AdminModuleConfigType::MqttConfig,
            AdminModuleConfigKind::Serial => proto::AdminModuleConfigType::SerialConfig,
            AdminModuleConfigKind::ExtNotification => proto::AdminModuleConfigType::ExtnotifConfig,
            AdminModuleConfigKind::StoreForward => proto::AdminModuleConfigType::StoreforwardConfig,
            AdminModuleConfigKind::RangeTest => proto::AdminModuleConfigType::RangetestConfig,
            AdminModuleConfigKind::Telemetry => proto::AdminModuleConfigType::TelemetryConfig,
            AdminModuleConfigKind::CannedMessage => proto::AdminModuleConfigType::CannedmsgConfig,
            AdminModuleConfigKind::Audio => proto::AdminModuleConfigType::AudioConfig,
            AdminModuleConfigKind::RemoteHardware => proto::AdminModuleConfigType::RemotehardwareConfig,
            AdminModuleConfigKind::NeighborInfo => proto::AdminModuleConfigType::NeighborinfoConfig,
            AdminModuleConfigKind::AmbientLighting => proto::AdminModuleConfigType::AmbientlightingConfig,
            AdminModuleConfigKind::DetectionSensor => proto::AdminModuleConfigType::DetectionsensorConfig,
            AdminModuleConfigKind::Paxcounter => proto::AdminModuleConfigType::PaxcounterConfig,
        }
    }
}

/// Arguments for the general-purpose [`DeviceSession::send_packet`].
pub struct SendPacketArgs {
    pub bytes: Vec<u8>,
    pub port: proto::PortNum,
    pub dest: Destination,
    pub channel: ChannelIndex,
    pub want_ack: bool,
    pub want_response: bool,
    pub echo_response: bool,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
}

impl<T: Transport + 'static> DeviceSession<T> {
    /// Generic packet send: the basis every other send operation in this
    /// module is built on.
    pub async fn send_packet(&self, args: SendPacketArgs) -> CoreResult<SendFuture> {
        let my_node_num = self.my_node_num().unwrap_or(0);
        let id = generate_packet_id()?;
        let to = args.dest.resolve(my_node_num);
        let channel = args.channel.as_wire_value();

        let data = proto::Data {
            portnum: args.port as i32,
            payload: args.bytes,
            want_response: args.want_response,
            dest: 0,
            source: 0,
            request_id: 0,
            reply_id: args.reply_id.unwrap_or(0),
            emoji: args.emoji.unwrap_or(0),
        };

        if args.echo_response {
            let meta = PacketMeta {
                id,
                rx_time: Utc::now(),
                from: my_node_num,
                to,
                channel,
                kind: if to == crate::destination::BROADCAST_ADDR { PacketKind::Broadcast } else { PacketKind::Direct },
            };
            self.dispatch_decoded(meta, data.clone());
        }

        let packet = proto::MeshPacket {
            from: my_node_num,
            to,
            channel,
            id,
            want_ack: args.want_ack,
            rx_time: 0,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data)),
        };

        self.enqueue_packet(id, packet).await
    }

    pub async fn send_text(&self, text: &str, dest: Destination, channel: ChannelIndex, want_ack: bool) -> CoreResult<SendFuture> {
        self.send_packet(SendPacketArgs {
            bytes: text.as_bytes().to_vec(),
            port: proto::PortNum::TextMessageApp,
            dest,
            channel,
            want_ack,
            want_response: false,
            echo_response: false,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    pub async fn send_waypoint(&self, waypoint: proto::Waypoint, dest: Destination, channel: ChannelIndex) -> CoreResult<SendFuture> {
        self.send_packet(SendPacketArgs {
            bytes: waypoint.encode_to_vec(),
            port: proto::PortNum::WaypointApp,
            dest,
            channel,
            want_ack: true,
            want_response: false,
            echo_response: false,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    pub async fn trace_route(&self, dest: u32) -> CoreResult<SendFuture> {
        let discovery = proto::RouteDiscovery { route: Vec::new() };
        self.send_packet(SendPacketArgs {
            bytes: discovery.encode_to_vec(),
            port: proto::PortNum::TracerouteApp,
            dest: Destination::Node(dest),
            channel: ChannelIndex::Primary,
            want_ack: true,
            want_response: true,
            echo_response: false,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    pub async fn request_position(&self, dest: u32) -> CoreResult<SendFuture> {
        self.send_packet(SendPacketArgs {
            bytes: Vec::new(),
            port: proto::PortNum::PositionApp,
            dest: Destination::Node(dest),
            channel: ChannelIndex::Primary,
            want_ack: true,
            want_response: true,
            echo_response: false,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    pub async fn set_config(&self, config: proto::Config) -> CoreResult<SendFuture> {
        if !self.pending_changes() {
            self.begin_edit_settings().await?;
        }
        self.send_local_admin(Admin::SetConfig(config)).await
    }

    pub async fn set_module_config(&self, module_config: proto::ModuleConfig) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::SetModuleConfig(module_config)).await
    }

    pub async fn set_channel(&self, channel: proto::Channel) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::SetChannel(channel)).await
    }

    pub async fn set_owner(&self, user: proto::User) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::SetOwner(user)).await
    }

    pub async fn set_position(&self, position: proto::Position) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::SetPosition(position)).await
    }

    pub async fn set_canned_messages(&self, messages: String) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::SetCannedMessageModuleMessages(messages)).await
    }

    pub async fn get_channel(&self, index: u8) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::GetChannelRequest(index as u32)).await
    }

    pub async fn get_config(&self, kind: AdminConfigKind) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::GetConfigRequest(proto::AdminConfigType::from(kind) as i32)).await
    }

    pub async fn get_module_config(&self, kind: AdminModuleConfigKind) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::GetModuleConfigRequest(proto::AdminModuleConfigType::from(kind) as i32)).await
    }

    pub async fn get_owner(&self) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::GetOwnerRequest(true)).await
    }

    pub async fn get_metadata(&self, node_num: u32) -> CoreResult<SendFuture> {
        self.send_remote_admin(Admin::GetDeviceMetadataRequest(true), node_num).await
    }

    /// Meshtastic has no dedicated "clear channel" admin variant; the way
    /// every existing client clears one is by writing back a disabled
    /// channel with empty settings at that index.
    pub async fn clear_channel(&self, index: u8) -> CoreResult<SendFuture> {
        self.set_channel(proto::Channel {
            index: index as u32,
            role: proto::ChannelRole::Disabled as i32,
            settings: Vec::new(),
        })
        .await
    }

    pub async fn begin_edit_settings(&self) -> CoreResult<SendFuture> {
        let result = self.send_local_admin(Admin::BeginEditSettings(true)).await;
        if result.is_ok() {
            self.set_pending_changes(true);
        }
        result
    }

    pub async fn commit_edit_settings(&self) -> CoreResult<SendFuture> {
        let result = self.send_local_admin(Admin::CommitEditSettings(true)).await;
        if result.is_ok() {
            self.set_pending_changes(false);
        }
        result
    }

    pub async fn reset_nodes(&self) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::NodedbReset(1)).await
    }

    pub async fn remove_node_by_num(&self, node_num: u32) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::RemoveByNodenum(node_num)).await
    }

    /// Logs "rebooting now" for `time <= 2` seconds and "rebooting in {time}s"
    /// otherwise; the wire request always carries the literal `time`.
    pub async fn shutdown(&self, time: i32) -> CoreResult<SendFuture> {
        if time <= 2 {
            log::info!("rebooting now");
        } else {
            log::info!("rebooting in {time}s");
        }
        self.send_local_admin(Admin::ShutdownSeconds(time)).await
    }

    pub async fn reboot(&self, time: i32) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::RebootSeconds(time)).await
    }

    pub async fn reboot_ota(&self, time: i32) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::RebootOtaSeconds(time)).await
    }

    pub async fn factory_reset_device(&self) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::FactoryResetDevice(true)).await
    }

    pub async fn factory_reset_config(&self) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::FactoryResetConfig(true)).await
    }

    pub async fn enter_dfu_mode(&self) -> CoreResult<SendFuture> {
        self.send_local_admin(Admin::EnterDfuModeRequest(true)).await
    }

    fn set_pending_changes(&self, pending: bool) {
        let changed = self.state.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let changed = inner.pending_changes != pending;
            inner.pending_changes = pending;
            changed
        });
        if changed {
            self.dispatch(Event::PendingChangesChanged(pending));
        }
    }

    async fn send_local_admin(&self, variant: Admin) -> CoreResult<SendFuture> {
        self.send_admin(variant, Destination::SelfNode, ChannelIndex::Primary).await
    }

    async fn send_remote_admin(&self, variant: Admin, node_num: u32) -> CoreResult<SendFuture> {
        self.send_admin(variant, Destination::Node(node_num), ChannelIndex::Admin).await
    }

    async fn send_admin(&self, variant: Admin, dest: Destination, channel: ChannelIndex) -> CoreResult<SendFuture> {
        let admin = proto::AdminMessage { payload_variant: Some(variant) };
        self.send_packet(SendPacketArgs {
            bytes: admin.encode_to_vec(),
            port: proto::PortNum::AdminApp,
            dest,
            channel,
            want_ack: true,
            want_response: true,
            echo_response: false,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    async fn enqueue_packet(&self, id: u32, packet: proto::MeshPacket) -> CoreResult<SendFuture> {
        let to_radio = proto::ToRadio { payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)) };
        let bytes = to_radio.encode_to_vec();
        let framed = crate::codec::encode(&bytes)?;
        let future = self.queue.enqueue(id, framed)?;
        self.drain().await?;
        Ok(future)
    }
}
