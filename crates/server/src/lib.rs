//! Control plane and room registry
//!
//! Hosts the HTTP API the Talk server calls to enable and disable
//! transcription, the process-wide registry of room orchestrators, the
//! signaling settings fetch and the memory watchdog.

pub mod error;
pub mod hpb;
pub mod http;
pub mod registry;
pub mod watchdog;

pub use error::ProviderError;
pub use http::{create_router, AppState};
pub use registry::RoomRegistry;
