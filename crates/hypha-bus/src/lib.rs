//! Messaging-bus surface consumed by the Hypha runtime.
//!
//! The runtime core never talks to a concrete broker; it goes through the
//! traits in [`traits`]: request/reply with subjects, key-value buckets with
//! watch, object buckets, and durable stream consumers with explicit
//! acknowledgment. Two implementations ship here:
//!
//! - [`memory::MemoryBus`]: an embedded bus for local mode and tests, with
//!   subject wildcards, queue groups, KV watch, and redelivery semantics.
//! - [`remote::RemoteBus`]: a thin TCP client for tooling that needs to
//!   reach the buckets and request/reply plane of a running daemon, served
//!   by [`gateway::Gateway`].
//!
//! The [`service`] module layers the bus's service-control convention on
//! top: named services with endpoints, `$SRV.PING` / `$SRV.INFO` /
//! `$SRV.STATS` discovery subjects, and per-endpoint counters.

pub mod error;
pub mod gateway;
pub mod memory;
pub mod remote;
pub mod service;
pub mod subject;
pub mod traits;

pub use error::{BusError, BusResult};
pub use memory::MemoryBus;
pub use remote::RemoteBus;
pub use service::{EndpointHandler, Service, ServiceBuilder, ServiceInfo, ServiceRequest};
pub use traits::{
    Bus, BusMessage, ConsumerConfig, DeliverPolicy, KvBucket, KvChange, KvOperation, KvWatcher,
    ObjectBucket, StreamConsumer, StreamMessage, Subscription,
};
