pub mod connection;
pub mod descriptor;
pub mod table;

pub use connection::{resolve_connection, AttributeKind, AttributeSpec, ConnectionProfile, ConnectionSchema};
pub use descriptor::{DescriptorShape, PluginDefaults, PluginDescriptor, Table};
pub use table::{Column, ColumnKind, QueryContext, Row, TableProvider, TableSchema, TransformPolicy};

/// Version of the handshake and request framing spoken toward the host.
pub const PROTOCOL_VERSION: u32 = 1;

/// Constructor seam between a plugin binary and the serve harness.
///
/// The harness may call `build` more than once (for instance per host
/// connection); implementations must be pure with respect to process state so
/// that every invocation yields a descriptor with the same
/// [`DescriptorShape`]. The host caches schema, and a drifting shape would
/// poison that cache.
pub trait PluginFactory: Send + Sync + 'static {
    fn build(&self) -> anyhow::Result<PluginDescriptor>;
}
