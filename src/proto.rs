//! Vendored wire schema.
//!
//! Generated at build time by `prost-build` from `proto/meshtastic_core.proto`
//! (see `build.rs`). This is a deliberately minimal subset of the real
//! Meshtastic protobuf tree — only the messages the protocol core touches.
//! Treat it as the "external schema library" the core spec assumes; nothing
//! in this module is hand-tuned beyond the `.proto` source.

include!(concat!(env!("OUT_DIR"), "/meshtastic.core.rs"));
