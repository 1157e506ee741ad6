pub mod config;
pub mod group_consumer;
pub mod partition_scanner;
pub mod session;

pub use config::{ConsumerConfig, KafkaConfig, SecurityProtocol};
pub use group_consumer::{Delivery, GroupConsumer, Offset, OffsetErr, ProbeError};
pub use partition_scanner::{PartitionScanner, ScannedMessage};
pub use session::{InvalidTransition, SessionEvent, SessionState, SessionTracker};
