//! Event publication: in-process fan-out and forwarding to a durable log.

mod forwarder;
mod publisher;
mod subscriber;

pub use forwarder::{EventForwarder, ForwardingMetrics, ForwardingQueue};
pub use publisher::{EventPublisher, SubscriberId, DEFAULT_DELIVERY_TIMEOUT};
pub use subscriber::{ChannelSubscriber, CollectingSubscriber, EventSubscriber, LoggingSubscriber};
