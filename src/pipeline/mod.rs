//! Object synchronization pipeline: render, queue, write.
pub mod queue;
pub mod render;
pub mod task;
pub mod writer;

pub use queue::{write_queue, WriteQueue, WriteReceiver};
pub use render::RenderStage;
pub use task::{Attempt, Continuation, WriteMessage, WriteTask};
pub use writer::{run_consumer, Outcome, Writer};
