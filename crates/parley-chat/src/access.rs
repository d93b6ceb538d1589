use anyhow::Result;
use uuid::Uuid;

use parley_db::Database;

/// Read-only view of the social follow graph. The chat core consumes the
/// relation purely as an authorization input.
pub trait FollowGraph: Send + Sync {
    /// Directed: does `follower` follow `following`?
    fn follows(&self, follower: Uuid, following: Uuid) -> Result<bool>;
}

impl FollowGraph for Database {
    fn follows(&self, follower: Uuid, following: Uuid) -> Result<bool> {
        self.follow_exists(&follower.to_string(), &following.to_string())
    }
}

/// User A can chat with user B iff A follows B OR B follows A (at least one
/// direction). Consulted only when a conversation does not yet exist; once
/// one does, membership governs and severing the follow edge does not
/// retroactively lock it. That is intentional.
pub fn can_chat(graph: &dyn FollowGraph, a: Uuid, b: Uuid) -> Result<bool> {
    if a == b {
        return Ok(false);
    }
    Ok(graph.follows(a, b)? || graph.follows(b, a)?)
}
