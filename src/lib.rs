/// Actuator Driver Library
/// 
/// Serial session engine for a stepper actuator, shared by the console binary

pub mod error;
pub mod line_config;
pub mod command_encoder;
pub mod serial_channel;
pub mod log_record;
pub mod session;
pub mod config_loader;

pub use error::{ChannelError, SessionError, SessionResult};
pub use session::{AvailableActions, ConnectionState, SessionEngine, SessionSink};
