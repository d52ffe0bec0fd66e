pub mod decode;
pub mod reader;
pub mod reconnect;

pub use decode::LineDecoder;
pub use reader::{
    ConnectionState, Connector, DeviceReader, DeviceStream, EndpointConfig, ErrorSink,
    ReadingHandler,
};
pub use reconnect::{ExponentialBackoff, NeverReconnect, ReconnectPolicy, ReconnectSettings};
