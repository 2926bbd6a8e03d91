use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    /// Whether the backend accepts a `tools` array for this model.
    #[serde(default = "default_supports_tools")]
    pub supports_tools: bool,
}

fn default_supports_tools() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

impl ProviderInfo {
    /// First advertised model; providers list their configured default first.
    pub fn default_model(&self) -> Option<&str> {
        self.models.first().map(|m| m.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_first_listed() {
        let info: ProviderInfo = serde_json::from_value(serde_json::json!({
            "id": "openrouter",
            "name": "OpenRouter",
            "models": [{"id": "google/gemini-2.5-flash", "provider_id": "openrouter"}]
        }))
        .expect("provider info");
        assert_eq!(info.default_model(), Some("google/gemini-2.5-flash"));
        assert!(info.models[0].supports_tools);

        let empty = ProviderInfo {
            id: "local".to_string(),
            name: "Local".to_string(),
            models: Vec::new(),
        };
        assert_eq!(empty.default_model(), None);
    }
}
