//! Transport contract (§6).
//!
//! Concrete serial/BLE/HTTP adapters are collaborators, not specified here —
//! this module only defines the byte-stream interface a transport must
//! satisfy and the parameter shapes each kind of transport is configured
//! with, for documentation and interop purposes. No adapter ships in this
//! crate.

use std::future::Future;
use std::pin::Pin;

use crate::error::CoreResult;

/// A transport the session can drive. Implementations are expected to pump
/// bytes they receive into the session's [`crate::codec::FrameDecoder`]
/// themselves (the pump is implementation-specific and out of scope here).
pub trait Transport: Send {
    fn connect(&mut self, params: ConnectParams) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>>;
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    fn write(&mut self, bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
    fn ping(&mut self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Connection parameters, one variant per supported transport kind.
#[derive(Debug, Clone)]
pub enum ConnectParams {
    Serial { device_path: String, baud_rate: u32 },
    Ble { device_id: String },
    Http { base_url: String },
}
