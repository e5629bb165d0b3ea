// crates/framepipe-core/src/lib.rs

pub mod callback;
pub mod error;
pub mod flag;
pub mod mask;
pub mod shape;
pub mod spsc;

pub use callback::{FrameCallback, Identity, OnImageResult};
pub use error::QueueError;
pub use flag::DoneFlag;
pub use shape::FrameShape;
