//! NDSI wire protocol: frame header, message schema and sockets.

pub mod header;
pub mod messages;
pub mod transport;

pub use header::{FLAG_ALL, FrameHeader, HEADER_LEN};
pub use messages::{
    CommandError, ControlChanges, ControlEnumOption, ControlValue, SensorAttach, SensorCommand,
    UpdateControlMessage, ValueType,
};
pub use transport::{Bound, CommandSocket, PublishSocket, Transport, ZmqTransport};
