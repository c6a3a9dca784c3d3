//! Model alias table.
//!
//! Callers use public Anthropic model names (`claude-3-5-sonnet-20240620`);
//! Vertex publishes the same models under `name@version` ids. The table maps
//! known aliases to Vertex ids; anything unknown is forwarded unchanged.

use std::collections::HashMap;

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("claude-3.5-sonnet", "claude-3-5-sonnet@20240620"),
    ("claude-3-5-sonnet", "claude-3-5-sonnet@20240620"),
    ("claude-3.5-sonnet-20240620", "claude-3-5-sonnet@20240620"),
    ("claude-3-5-sonnet-20240620", "claude-3-5-sonnet@20240620"),
    ("claude-3-5-sonnet-20241022", "claude-3-5-sonnet-v2@20241022"),
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet-v2@20241022"),
    ("claude-3-5-haiku-20241022", "claude-3-5-haiku@20241022"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku@20241022"),
    ("claude-3-7-sonnet-20250219", "claude-3-7-sonnet@20250219"),
    ("claude-3-7-sonnet-latest", "claude-3-7-sonnet@20250219"),
    ("claude-3-opus-20240229", "claude-3-opus@20240229"),
    ("claude-3-sonnet-20240229", "claude-3-sonnet@20240229"),
    ("claude-3-haiku-20240307", "claude-3-haiku@20240307"),
];

/// Read-only alias table shared by all requests.
#[derive(Debug, Clone)]
pub struct ModelMap {
    aliases: HashMap<String, String>,
    default_model: String,
}

impl ModelMap {
    /// Built-in aliases overlaid with `overrides`. `default_model` is used for
    /// requests that leave `model` empty.
    pub fn new(overrides: &HashMap<String, String>, default_model: impl Into<String>) -> Self {
        let mut aliases: HashMap<String, String> = BUILTIN_ALIASES
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        aliases.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            aliases,
            default_model: default_model.into(),
        }
    }

    /// Resolve a caller model name to the backend model id.
    #[must_use]
    pub fn normalize(&self, model: &str) -> String {
        let model = model.trim();
        if model.is_empty() {
            return self.default_model.clone();
        }
        self.aliases
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// Resolve a model name sent by an `OpenAI`-format caller. Those callers
    /// usually name non-Claude models (`gpt-4o`), which Vertex cannot serve;
    /// anything that is neither an alias nor a `claude*` id goes to the
    /// default model.
    #[must_use]
    pub fn normalize_foreign(&self, model: &str) -> String {
        let trimmed = model.trim();
        if self.aliases.contains_key(trimmed) || trimmed.starts_with("claude") {
            return self.normalize(trimmed);
        }
        if !trimmed.is_empty() {
            tracing::debug!(
                model = trimmed,
                default = %self.default_model,
                "Routing non-Claude model to the default model"
            );
        }
        self.default_model.clone()
    }

    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_alias() {
        let map = ModelMap::new(&HashMap::new(), "claude-3-haiku@20240307");
        assert_eq!(map.normalize("claude-3.5-sonnet"), "claude-3-5-sonnet@20240620");
        assert_eq!(
            map.normalize("claude-3-5-sonnet-20240620"),
            "claude-3-5-sonnet@20240620"
        );
    }

    #[test]
    fn test_unknown_model_passes_through() {
        let map = ModelMap::new(&HashMap::new(), "claude-3-haiku@20240307");
        assert_eq!(map.normalize("claude-v1"), "claude-v1");
        assert_eq!(map.normalize("claude-3-5-sonnet@20240620"), "claude-3-5-sonnet@20240620");
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides = HashMap::from([
            ("gpt-4o".to_string(), "claude-3-opus@20240229".to_string()),
            ("claude-3-5-sonnet".to_string(), "claude-3-5-sonnet-v2@20241022".to_string()),
        ]);
        let map = ModelMap::new(&overrides, "claude-3-haiku@20240307");
        assert_eq!(map.normalize("gpt-4o"), "claude-3-opus@20240229");
        assert_eq!(map.normalize("claude-3-5-sonnet"), "claude-3-5-sonnet-v2@20241022");
    }

    #[test]
    fn test_empty_model_uses_default() {
        let map = ModelMap::new(&HashMap::new(), "claude-3-haiku@20240307");
        assert_eq!(map.normalize(""), "claude-3-haiku@20240307");
        assert_eq!(map.normalize("  "), "claude-3-haiku@20240307");
        assert_eq!(map.default_model(), "claude-3-haiku@20240307");
    }

    #[test]
    fn test_foreign_models_route_to_default() {
        let overrides = HashMap::from([("gpt-4".to_string(), "claude-3-opus@20240229".to_string())]);
        let map = ModelMap::new(&overrides, "claude-3-haiku@20240307");
        assert_eq!(map.normalize_foreign("gpt-4o"), "claude-3-haiku@20240307");
        assert_eq!(map.normalize_foreign(""), "claude-3-haiku@20240307");
        assert_eq!(map.normalize_foreign("gpt-4"), "claude-3-opus@20240229");
        assert_eq!(map.normalize_foreign("claude-3.5-sonnet"), "claude-3-5-sonnet@20240620");
        assert_eq!(map.normalize_foreign("claude-v1"), "claude-v1");
    }
}
