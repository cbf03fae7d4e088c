pub mod command_listener;
pub mod gateway;
pub mod pipeline;
pub mod synchronizer;
pub mod twin;

pub use command_listener::CommandListener;
pub use gateway::Gateway;
pub use pipeline::{LiveEvent, ReadingPipeline};
pub use synchronizer::{BufferStatus, Synchronizer};
pub use twin::{DeviceProfile, TwinForwarder, TwinPublisher};
