//! Internal DHT tasks: the short lived jobs that talk to other nodes.

mod factory;
mod queue;
mod task;

use std::time::Duration;

pub use factory::TaskFactory;
pub use queue::TaskQueue;
pub use task::{BucketRefreshTask, DhtTask, NodeLookupTask, PeerLookupTask, PingTask};

/// A bucket that saw no activity for this long gets refreshed with a lookup.
pub const DHT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
