use crate::types::{ProjectId, UserId};

/// Database request for registering an uploaded photo as a pending job
#[derive(Debug, Clone)]
pub struct JobCreateDBRequest {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub original_url: String,
    /// Style/room parameters assembled outside the core, passed through to the provider
    pub generation_params: serde_json::Value,
}
