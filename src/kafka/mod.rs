pub mod accumulator;
pub mod connection;
pub mod librdkafka;
pub mod metadata;
pub mod mock;
pub mod partitioner;
pub mod producer;
pub mod record;
pub mod tracker;
pub mod transport;


pub use accumulator::{AppendOutcome, Batch, BatchAccumulator, BatchState};
pub use connection::{Backoff, ConnectionManager};
pub use librdkafka::RdKafkaTransport;
pub use metadata::MetadataCache;
pub use mock::MockTransport;
pub use partitioner::Partitioner;
pub use producer::{ProducerClient, ProducerStats};
pub use record::{DeliveryResult, Record, RecordMetadata, TopicPartition};
pub use tracker::{Completion, DeliveryFuture, DeliveryTracker};
pub use transport::{
    ClusterMetadata, Endpoint, PartitionMetadata, ProduceRequest, ProduceResponse, Session,
    TopicMetadata, Transport,
};
