use crate::core::{PostPage, PostSummary, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ask a feed worker for one page of a user's friend feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRequest {
    pub request_id: Uuid,
    pub user_id: UserId,
    pub page_offset: u32,
    pub page_size: u32,
    /// Queue the response must be published to
    pub reply_to: String,
}

impl FeedRequest {
    pub fn new(user_id: UserId, page_offset: u32, page_size: u32, reply_to: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id,
            page_offset,
            page_size,
            reply_to: reply_to.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Ok,
    Failed { reason: String },
}

/// Answer to exactly one `FeedRequest`, matched by `request_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub request_id: Uuid,
    pub user_id: UserId,
    pub posts: Vec<PostSummary>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_elements: u64,
    pub status: FeedStatus,
}

impl FeedResponse {
    pub fn page(request: &FeedRequest, page: PostPage) -> Self {
        Self {
            request_id: request.request_id,
            user_id: request.user_id,
            posts: page.posts,
            page_number: page_number(request.page_offset, request.page_size),
            page_size: request.page_size,
            total_elements: page.total_elements,
            status: FeedStatus::Ok,
        }
    }

    /// Empty response telling the waiting caller that the request could not be served
    pub fn failed(request: &FeedRequest, reason: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id,
            user_id: request.user_id,
            posts: Vec::new(),
            page_number: page_number(request.page_offset, request.page_size),
            page_size: request.page_size,
            total_elements: 0,
            status: FeedStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, FeedStatus::Ok)
    }
}

fn page_number(offset: u32, size: u32) -> u32 {
    offset.checked_div(size).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    PostCreated,
    FriendsChanged,
}

/// Notice that the cached feed of `user_id` is stale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInvalidation {
    pub user_id: UserId,
    pub reason: InvalidationReason,
}
