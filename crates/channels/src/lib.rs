//! Delivery channels between the job submitter and continuation handlers.
//!
//! - [`DispatchQueue`]: at-least-once queue with a lease window and a redrive
//!   policy that routes exhausted messages to a dead-letter path.
//! - [`FanoutStream`]: ordered, partitioned log consumed in bounded batches.
//! - [`Dispatcher`]: the emit-only view the submitter uses, over either channel.
//!
//! Transport-specific implementations (Redis) live in `cubeflow-infra`.

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod in_memory_queue;
pub mod in_memory_stream;
pub mod message;
pub mod queue;
pub mod stream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{Dispatcher, QueueDispatcher, StreamDispatcher};
pub use error::ChannelError;
pub use in_memory_queue::InMemoryDispatchQueue;
pub use in_memory_stream::InMemoryFanoutStream;
pub use message::{DeadLetterRecord, Delivery, DispatchMessage, ReceiptHandle, StreamPosition, StreamRecord};
pub use queue::{DispatchQueue, QueueDepth, RedrivePolicy};
pub use stream::{FanoutStream, StreamConfig, MAX_BATCH_SIZE, partition_for};
