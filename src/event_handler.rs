use std::error::Error;

use async_trait::async_trait;

use crate::node::Node;
use crate::state::NodeStatus;

/// Callback for membership status transitions.
///
/// Invoked whenever a peer's registry status actually changes: a no-op
/// update (re-asserting the current status) never fires. The handler runs on
/// a dedicated dispatch task, off the registry locks, so implementations may
/// block or await without stalling the protocol.
#[async_trait]
pub trait ClusterEventHandler: Send + Sync {
    async fn on_status_change(
        &self,
        node: &Node,
        new_status: NodeStatus,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}
