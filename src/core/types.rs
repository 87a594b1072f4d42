use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type PostId = i64;

/// A post as it appears in a friend feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSummary {
    pub id: PostId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One offset/limit window over a post listing, plus the size of the full listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<PostSummary>,
    pub total_elements: u64,
}

impl PostPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Transaction mode declared by the caller of a database operation.
///
/// This is the only input the router uses to pick between the write node
/// and the replicas; statement text is never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

impl TxMode {
    pub fn is_read_only(self) -> bool {
        self == TxMode::ReadOnly
    }
}
