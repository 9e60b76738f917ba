//! peek-relay: inspect the beginning of an HTTP response body without
//! disturbing the body that is forwarded.
//!
//! A prefix of up to `threshold + 1` bytes is read with a minimum-fill read,
//! classified by length alone, handed to a logging collaborator when small
//! enough, and the full byte sequence is then forwarded unchanged using one
//! of two reconstruction strategies:
//!
//! - **Duplicate-and-discard** (`/clone`): tee the source, read the prefix
//!   from the duplicate, release the duplicate, forward the primary.
//! - **Splice-and-continue** (`/stream`): emit the prefix already read, then
//!   the remainder in bounded chunks, under the upstream's declared length.

pub mod config;
pub mod error;
pub mod gate;
pub mod length;
pub mod logging_layer;
pub mod proxy_service;
pub mod reader;
pub mod reconstruct;
pub mod routing;
pub mod source;
pub mod timeout;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_bodies;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use gate::{Classification, InspectionSink, classify};
pub use proxy_service::RelayService;
pub use reconstruct::{RelayBody, Relayed, Strategy};
pub use source::{ByteSource, CancelReason};
