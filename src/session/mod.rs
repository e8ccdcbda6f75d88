//! Device session: the configuration lifecycle state machine, request
//! builders, and the fromRadio demultiplexer. This is the component that
//! owns everything else — queue, bus, XMODEM engine, and the transport.
//!
//! Roughly 55% of the protocol core lives here, matching the spec's own
//! component budget; see `requests.rs` for outbound request construction and
//! `demux.rs` for the inbound demultiplexer.

mod demux;
mod requests;

pub use requests::{AdminConfigKind, AdminModuleConfigKind, SendPacketArgs};

use std::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use prost::Message;

use crate::codec::{self, FrameDecoder};
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus, EventKind};
use crate::id::generate_packet_id;
use crate::proto;
use crate::queue::TransmitQueue;
use crate::transport::Transport;
use crate::xmodem::XmodemEngine;

/// Minimum supported firmware version, compiled in as a fallback; normally
/// overridden by [`SessionConfig::minimum_firmware_version`].
pub const BUILTIN_MINIMUM_FIRMWARE_VERSION: u32 = crate::config::DEFAULT_MINIMUM_FIRMWARE_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Configuring,
    Configured,
    Reconnecting,
    Disconnecting,
    FirmwareUpdate,
    Restarting,
}

pub(crate) struct SessionState {
    pub status: DeviceStatus,
    pub my_node_num: Option<u32>,
    pub pending_changes: bool,
}

/// The protocol core's unit of isolation: one session per radio. Multiple
/// sessions may coexist, each addressing a different radio over its own
/// transport instance.
pub struct DeviceSession<T: Transport + 'static> {
    pub(crate) config: SessionConfig,
    pub(crate) lockstep_id: u32,
    pub(crate) transport: Arc<AsyncMutex<CriticalSectionRawMutex, T>>,
    pub(crate) queue: TransmitQueue,
    pub(crate) bus: BlockingMutex<CriticalSectionRawMutex, RefCell<EventBus>>,
    pub(crate) xmodem: Arc<XmodemEngine>,
    pub(crate) decoder: BlockingMutex<CriticalSectionRawMutex, RefCell<FrameDecoder>>,
    pub(crate) state: BlockingMutex<CriticalSectionRawMutex, RefCell<SessionState>>,
}

impl<T: Transport + 'static> DeviceSession<T> {
    /// Build a new session around `transport`. The lockstep identifier is
    /// drawn from a CSPRNG unless `config.lockstep_id` injects one (tests use
    /// this for determinism, per §6).
    pub fn new(transport: T, config: SessionConfig) -> CoreResult<Self> {
        let lockstep_id = match config.lockstep_id {
            Some(id) => id,
            None => generate_packet_id()?,
        };

        let transport = Arc::new(AsyncMutex::new(transport));
        let xmodem_transport = transport.clone();
        let xmodem_retries = config.xmodem_max_retries;
        let queue_capacity = config.queue_capacity;

        let xmodem_sink: crate::xmodem::SendRaw = Arc::new(move |frame: proto::XModem| {
            let transport = xmodem_transport.clone();
            Box::pin(async move {
                let bytes = proto::ToRadio {
                    payload_variant: Some(proto::to_radio::PayloadVariant::XmodemPacket(frame)),
                }
                .encode_to_vec();
                let framed = codec::encode(&bytes)?;
                let mut guard = transport.lock().await;
                guard.write(framed).await.map_err(CoreError::TransportError)
            })
        });

        Ok(Self {
            config,
            lockstep_id,
            transport,
            queue: TransmitQueue::new(queue_capacity),
            bus: BlockingMutex::new(RefCell::new(EventBus::new())),
            xmodem: Arc::new(XmodemEngine::new(xmodem_sink, xmodem_retries)),
            decoder: BlockingMutex::new(RefCell::new(FrameDecoder::new())),
            state: BlockingMutex::new(RefCell::new(SessionState {
                status: DeviceStatus::Disconnected,
                my_node_num: None,
                pending_changes: false,
            })),
        })
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock(|cell| cell.borrow().status)
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.state.lock(|cell| cell.borrow().my_node_num)
    }

    pub fn pending_changes(&self) -> bool {
        self.state.lock(|cell| cell.borrow().pending_changes)
    }

    pub fn subscribe(&self, kind: EventKind, handler: impl FnMut(&Event) + Send + 'static) -> crate::events::SubscriptionId {
        self.bus.lock(|cell| cell.borrow_mut().subscribe(kind, handler))
    }

    pub(crate) fn dispatch(&self, event: Event) {
        self.bus.lock(|cell| cell.borrow_mut().dispatch(event));
    }

    fn set_status(&self, status: DeviceStatus) {
        self.state.lock(|cell| cell.borrow_mut().status = status);
        self.dispatch(Event::DeviceStatus(status));
    }

    /// Begin (or restart) the configuration handshake: transitions to
    /// `Configuring` and writes a raw `want_config_id` frame carrying the
    /// lockstep identifier, bypassing the transmit queue (there is no
    /// per-id ack for this request — completion is signalled by
    /// `configCompleteId` instead).
    pub async fn configure(&self) -> CoreResult<()> {
        self.set_status(DeviceStatus::Configuring);

        let bytes = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(self.lockstep_id)),
        }
        .encode_to_vec();
        let framed = codec::encode(&bytes)?;

        let mut guard = self.transport.lock().await;
        guard.write(framed).await.map_err(CoreError::TransportError)
    }

    /// Clears the transmit queue (cancelling pending sends) and transitions
    /// to `Disconnected`. Called on transport disconnection.
    pub fn complete(&self) {
        self.queue.clear();
        self.set_status(DeviceStatus::Disconnected);
    }

    /// Feed freshly-arrived transport bytes through the frame codec and
    /// dispatch each completed `FromRadio` message in arrival order.
    pub async fn feed_bytes(&self, chunk: &[u8]) -> CoreResult<()> {
        let frames = self.decoder.lock(|cell| cell.borrow_mut().decode_stream(chunk));
        for payload in frames {
            match proto::FromRadio::decode(payload.as_slice()) {
                Ok(message) => {
                    if let Err(e) = self.handle_from_radio(message).await {
                        log::warn!("error handling FromRadio message: {e}");
                    }
                }
                Err(e) => log::warn!("dropping malformed FromRadio frame: {e}"),
            }
        }
        Ok(())
    }

    /// Drain the transmit queue against this session's transport. Exposed so
    /// callers on a custom event loop can pump sends explicitly; request
    /// builders call this automatically after enqueuing.
    pub async fn drain(&self) -> CoreResult<()> {
        let transport = self.transport.clone();
        self.queue
            .drain(move |bytes| {
                let transport = transport.clone();
                async move {
                    let mut guard = transport.lock().await;
                    guard.write(bytes).await
                }
            })
            .await
    }
}

/// End-to-end scenarios (T1-T6, §8) against an in-memory mock transport.
#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};

    use prost::Message;

    use super::*;
    use crate::destination::{ChannelIndex, Destination};
    use crate::events::EventKind;
    use crate::proto::{self, from_radio, mesh_packet, routing};
    use crate::transport::ConnectParams;

    #[derive(Clone, Default)]
    struct MockTransport {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport for MockTransport {
        fn connect(&mut self, _params: ConnectParams) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }

        fn write(&mut self, bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
            let writes = self.writes.clone();
            Box::pin(async move {
                writes.lock().unwrap().push(bytes);
                Ok(())
            })
        }

        fn ping(&mut self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async { true })
        }
    }

    fn last_to_radio(writes: &Arc<Mutex<Vec<Vec<u8>>>>) -> proto::ToRadio {
        let frames = writes.lock().unwrap();
        let frame = frames.last().expect("expected at least one written frame");
        proto::ToRadio::decode(&frame[4..]).expect("written frame decodes as ToRadio")
    }

    fn from_radio_frame(message: proto::FromRadio) -> Vec<u8> {
        crate::codec::encode(&message.encode_to_vec()).unwrap()
    }

    #[test]
    fn t1_configure_handshake() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let config = SessionConfig { lockstep_id: Some(0x4242), ..Default::default() };
            let session = DeviceSession::new(transport, config).unwrap();

            assert_eq!(session.status(), DeviceStatus::Disconnected);

            session.configure().await.unwrap();
            assert_eq!(session.status(), DeviceStatus::Configuring);
            assert!(matches!(last_to_radio(&writes).payload_variant, Some(proto::to_radio::PayloadVariant::WantConfigId(0x4242))));

            session
                .feed_bytes(&from_radio_frame(proto::FromRadio {
                    id: 0,
                    payload_variant: Some(from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo { my_node_num: 7, reboot_count: 0 })),
                }))
                .await
                .unwrap();
            assert_eq!(session.my_node_num(), Some(7));

            session
                .feed_bytes(&from_radio_frame(proto::FromRadio {
                    id: 0,
                    payload_variant: Some(from_radio::PayloadVariant::ConfigCompleteId(0x4242)),
                }))
                .await
                .unwrap();
            assert_eq!(session.status(), DeviceStatus::Configured);
        });
    }

    #[test]
    fn t2_send_text_acked() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let session = DeviceSession::new(transport, SessionConfig::default()).unwrap();

            let fut = session.send_text("hi", Destination::Broadcast, ChannelIndex::Index(0), true).await.unwrap();

            let sent = last_to_radio(&writes);
            let Some(proto::to_radio::PayloadVariant::Packet(packet)) = sent.payload_variant else {
                panic!("expected a Packet variant");
            };
            assert_eq!(packet.to, crate::destination::BROADCAST_ADDR);
            assert!(packet.want_ack);
            let Some(mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant else {
                panic!("expected decoded data");
            };
            assert_eq!(data.portnum, proto::PortNum::TextMessageApp as i32);
            assert_eq!(data.payload, b"hi");

            let routing = proto::Routing { variant: Some(routing::Variant::ErrorReason(routing::ErrorReason::None as i32)) };
            let ack_data = proto::Data {
                portnum: proto::PortNum::RoutingApp as i32,
                payload: routing.encode_to_vec(),
                want_response: false,
                dest: 0,
                source: 0,
                request_id: packet.id,
                reply_id: 0,
                emoji: 0,
            };
            let ack_packet = proto::MeshPacket {
                from: 1,
                to: 0,
                channel: 0,
                id: 999,
                want_ack: false,
                rx_time: 0,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(ack_data)),
            };
            session
                .feed_bytes(&from_radio_frame(proto::FromRadio { id: 0, payload_variant: Some(from_radio::PayloadVariant::Packet(ack_packet)) }))
                .await
                .unwrap();

            assert_eq!(fut.wait().await, Ok(packet.id));
        });
    }

    #[test]
    fn t3_send_text_errored() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let session = DeviceSession::new(transport, SessionConfig::default()).unwrap();

            let fut = session.send_text("hi", Destination::Broadcast, ChannelIndex::Index(0), true).await.unwrap();
            let sent = last_to_radio(&writes);
            let Some(proto::to_radio::PayloadVariant::Packet(packet)) = sent.payload_variant else {
                panic!("expected a Packet variant");
            };

            let routing = proto::Routing { variant: Some(routing::Variant::ErrorReason(routing::ErrorReason::Timeout as i32)) };
            let err_data = proto::Data {
                portnum: proto::PortNum::RoutingApp as i32,
                payload: routing.encode_to_vec(),
                want_response: false,
                dest: 0,
                source: 0,
                request_id: packet.id,
                reply_id: 0,
                emoji: 0,
            };
            let err_packet = proto::MeshPacket {
                from: 1,
                to: 0,
                channel: 0,
                id: 1000,
                want_ack: false,
                rx_time: 0,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(err_data)),
            };
            session
                .feed_bytes(&from_radio_frame(proto::FromRadio { id: 0, payload_variant: Some(from_radio::PayloadVariant::Packet(err_packet)) }))
                .await
                .unwrap();

            assert_eq!(fut.wait().await, Err(CoreError::RoutingError(routing::ErrorReason::Timeout)));
        });
    }

    #[test]
    fn t4_oversize_rejection() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let session = DeviceSession::new(transport, SessionConfig::default()).unwrap();

            let result = session
                .send_packet(SendPacketArgs {
                    bytes: vec![0u8; 600],
                    port: proto::PortNum::TextMessageApp,
                    dest: Destination::Broadcast,
                    channel: ChannelIndex::Primary,
                    want_ack: false,
                    want_response: false,
                    echo_response: false,
                    reply_id: None,
                    emoji: None,
                })
                .await;

            assert!(matches!(result, Err(CoreError::PayloadTooLarge { .. })));
            assert!(writes.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn t5_reboot_triggers_reconfigure() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let config = SessionConfig { lockstep_id: Some(0x1), ..Default::default() };
            let session = DeviceSession::new(transport, config).unwrap();

            session.configure().await.unwrap();
            session
                .feed_bytes(&from_radio_frame(proto::FromRadio { id: 0, payload_variant: Some(from_radio::PayloadVariant::ConfigCompleteId(0x1)) }))
                .await
                .unwrap();
            assert_eq!(session.status(), DeviceStatus::Configured);
            let writes_before = writes.lock().unwrap().len();

            session
                .feed_bytes(&from_radio_frame(proto::FromRadio { id: 0, payload_variant: Some(from_radio::PayloadVariant::Rebooted(true)) }))
                .await
                .unwrap();

            assert_eq!(session.status(), DeviceStatus::Configuring);
            let writes_after = writes.lock().unwrap().len();
            assert_eq!(writes_after, writes_before + 1);
            assert!(matches!(last_to_radio(&writes).payload_variant, Some(proto::to_radio::PayloadVariant::WantConfigId(0x1))));
        });
    }

    #[test]
    fn telemetry_port_decodes_with_schema_instead_of_raw() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let session = DeviceSession::new(transport, SessionConfig::default()).unwrap();

            let seen = Arc::new(Mutex::new(None));
            let seen_handle = seen.clone();
            session.subscribe(EventKind::Telemetry, move |event| {
                if let crate::events::Event::Telemetry(ev) = event {
                    *seen_handle.lock().unwrap() = Some(ev.telemetry.time);
                }
            });
            let raw_hits = Arc::new(Mutex::new(0));
            let raw_handle = raw_hits.clone();
            session.subscribe(EventKind::Raw, move |_| {
                *raw_handle.lock().unwrap() += 1;
            });

            let telemetry = proto::Telemetry { time: 1234, variant: vec![1, 2, 3] };
            let data = proto::Data {
                portnum: proto::PortNum::TelemetryApp as i32,
                payload: telemetry.encode_to_vec(),
                want_response: false,
                dest: 0,
                source: 0,
                request_id: 0,
                reply_id: 0,
                emoji: 0,
            };
            let packet = proto::MeshPacket {
                from: 9,
                to: crate::destination::BROADCAST_ADDR,
                channel: 0,
                id: 55,
                want_ack: false,
                rx_time: 0,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
            };
            session
                .feed_bytes(&from_radio_frame(proto::FromRadio { id: 0, payload_variant: Some(from_radio::PayloadVariant::Packet(packet)) }))
                .await
                .unwrap();

            assert_eq!(*seen.lock().unwrap(), Some(1234));
            assert_eq!(*raw_hits.lock().unwrap(), 0);
        });
    }

    #[test]
    fn t6_echo_response_fires_before_write_completes() {
        futures::executor::block_on(async {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport { writes: writes.clone() };
            let session = DeviceSession::new(transport, SessionConfig::default()).unwrap();

            let seen = Arc::new(Mutex::new(None));
            let seen_handle = seen.clone();
            session.subscribe(EventKind::TextMessage, move |event| {
                if let crate::events::Event::TextMessage(text_event) = event {
                    *seen_handle.lock().unwrap() = Some(text_event.text.clone());
                }
            });

            session
                .send_packet(SendPacketArgs {
                    bytes: b"echo me".to_vec(),
                    port: proto::PortNum::TextMessageApp,
                    dest: Destination::Broadcast,
                    channel: ChannelIndex::Primary,
                    want_ack: false,
                    want_response: false,
                    echo_response: true,
                    reply_id: None,
                    emoji: None,
                })
                .await
                .unwrap();

            assert_eq!(seen.lock().unwrap().as_deref(), Some("echo me"));
        });
    }
}
