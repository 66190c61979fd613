use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One entry of `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    /// The configured language model id.
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    /// Always `"parley"`.
    pub owned_by: String,
}

/// Response body for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelListResponse {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<ModelInfo>,
}
