//! strand-core: wire format, naming and shared types.
//! All other Strand crates depend on this one.

pub mod config;
pub mod crc;
pub mod data;
pub mod manifest;
pub mod meta;
pub mod name;
pub mod namespace;
pub mod wire;

pub use data::{Data, Request};
pub use name::{Name, NameError};
pub use namespace::{NamespaceInfo, SampleClass, SegmentClass, StreamNamespace, StreamType};
