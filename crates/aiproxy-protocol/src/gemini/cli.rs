use serde::{Deserialize, Serialize};

use super::request::GenerateContentRequest;
use super::response::GenerateContentResponse;

/// Request envelope used by the Gemini CLI cloudcode endpoint: the public
/// generate-content body is nested under `request` next to routing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliRequestEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(
        rename = "user_prompt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_prompt_id: Option<String>,
    pub request: GenerateContentRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliResponseEnvelope {
    pub response: GenerateContentResponse,
}
