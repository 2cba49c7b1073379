//! Real-time fan-out to live viewers.
//!
//! - [`FanoutBroadcaster`]: tenant → subscriber registry, publish, unsubscribe
//! - [`SubscriptionFilter`]: node / incidents-only / key-value predicates
//! - [`FrameSink`]: transport seam implemented by the WebSocket layer
//!
//! Delivery is at-most-once. A full subscriber queue drops its oldest frame.

mod broadcaster;
mod frame;
mod subscriber;

pub use broadcaster::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_TIMEOUT, FanoutBroadcaster,
    FanoutConfig,
};
pub use frame::{FrameSink, FrameType, LiveEvent, SinkError, StreamFrame};
pub use subscriber::{SubscriptionFilter, SubscriptionHandle};
