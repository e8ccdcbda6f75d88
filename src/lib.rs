//! Protocol core for a host-side Meshtastic client.
//!
//! Owns the frame codec, the transmit queue, the typed event bus, the XMODEM
//! block-transfer engine, and the device session that ties them together.
//! Concrete transport adapters (serial, BLE, HTTP) and the full Meshtastic
//! protobuf schema are collaborators outside this crate's scope — see
//! [`transport`] and [`proto`].

pub mod codec;
pub mod config;
pub mod destination;
pub mod error;
pub mod events;
pub mod id;
pub mod proto;
pub mod queue;
pub mod session;
pub mod transport;
pub mod xmodem;

pub use config::SessionConfig;
pub use destination::{ChannelIndex, Destination, BROADCAST_ADDR};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventKind, SubscriptionId};
pub use queue::SendFuture;
pub use session::{AdminConfigKind, AdminModuleConfigKind, DeviceSession, DeviceStatus, SendPacketArgs};
pub use transport::{ConnectParams, Transport};
pub use xmodem::{XmodemEngine, XmodemState};
