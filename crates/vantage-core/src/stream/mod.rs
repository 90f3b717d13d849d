pub mod consumer;
pub mod decoder;
pub mod events;

pub use consumer::{RunCallbacks, StreamConsumer};
pub use decoder::{Frame, FrameDecoder};
pub use events::RunEvent;
