pub mod forwarder;
pub mod render;
pub mod sink;
pub mod types;

pub use forwarder::{DrainSettings, ForwardOutcome, Forwarder, Teardown};
pub use render::DataProcessor;
pub use sink::{CaptureSink, ConnectionAcceptor};
pub use types::{ConnectionInfo, DataPacket, DataType, Direction};
