// ⚙️ Configuration
// Engine limits + rating field declarations, loaded from JSON.
//
// {
//   "engine": { "votes_per_ip": 3, "votes_per_ip_window_secs": 86400 },
//   "fields": [
//     { "entity_type": 1, "name": "quality", "range": [1, 2, 3, 4, 5],
//       "allow_anonymous": true, "formula": { "kind": "weighted_average" } }
//   ]
// }

use crate::error::ConfigError;
use crate::field::{FieldRegistry, RatingField};
use crate::formula::{Formula, FormulaKind};
use crate::identity::RateLimit;
use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One year, how long the client keeps an anonymous vote cookie
pub const COOKIE_MAX_AGE_SECS: i64 = 31_536_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First-time anonymous votes allowed per IP inside the window (0 = unlimited)
    pub votes_per_ip: u32,
    pub votes_per_ip_window_secs: i64,
    /// Formula for fields that do not pick one
    pub default_formula: FormulaKind,
    pub cookie_max_age_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            votes_per_ip: 3,
            votes_per_ip_window_secs: 86_400,
            default_formula: FormulaKind::BinaryLowerBound,
            cookie_max_age_secs: COOKIE_MAX_AGE_SECS,
        }
    }
}

impl EngineConfig {
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit::new(
            self.votes_per_ip,
            Duration::seconds(self.votes_per_ip_window_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub entity_type: i64,
    pub name: String,
    pub range: Vec<i64>,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub use_cookies: bool,
    #[serde(default)]
    pub allow_delete: bool,
    #[serde(default)]
    pub can_change_vote: bool,
    #[serde(default)]
    pub formula: Option<FormulaKind>,
}

impl FieldDefinition {
    pub fn build(&self, default_formula: &FormulaKind) -> Result<RatingField, ConfigError> {
        let kind = self.formula.as_ref().unwrap_or(default_formula);

        Ok(
            RatingField::new(self.name.clone(), self.range.clone(), Formula::from_kind(kind))?
                .allow_anonymous(self.allow_anonymous)
                .use_cookies(self.use_cookies)
                .allow_delete(self.allow_delete)
                .can_change_vote(self.can_change_vote),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read settings file: {:?}", path.as_ref()))?;

        Settings::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse settings JSON")
    }

    /// Validate every field declaration into a registry
    pub fn registry(&self) -> Result<FieldRegistry, ConfigError> {
        let mut registry = FieldRegistry::new();
        for def in &self.fields {
            registry.register(def.entity_type, def.build(&self.engine.default_formula)?)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "engine": { "votes_per_ip": 5 },
        "fields": [
            { "entity_type": 1, "name": "quality", "range": [1, 2, 3, 4, 5],
              "allow_anonymous": true, "use_cookies": true,
              "formula": { "kind": "weighted_average" } },
            { "entity_type": 1, "name": "useful", "range": [-1, 1],
              "allow_delete": true, "can_change_vote": true }
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.votes_per_ip, 3);
        assert_eq!(config.rate_limit().window, Duration::days(1));
        assert_eq!(config.cookie_max_age_secs, 365 * 24 * 3600);
    }

    #[test]
    fn test_parse_and_build_registry() {
        let settings = Settings::from_json(SAMPLE).unwrap();
        assert_eq!(settings.engine.votes_per_ip, 5);
        assert_eq!(settings.engine.votes_per_ip_window_secs, 86_400);

        let registry = settings.registry().unwrap();
        let quality = registry.get(1, "quality").unwrap();
        assert!(quality.uses_cookies());
        assert_eq!(quality.formula().name(), "weighted_average");

        let useful = registry.get(1, "useful").unwrap();
        assert!(useful.allows_delete() && useful.allows_change());
        assert_eq!(useful.formula().name(), "binary_lower_bound");
    }

    #[test]
    fn test_invalid_field_is_rejected() {
        let settings = Settings::from_json(
            r#"{ "fields": [ { "entity_type": 1, "name": "q", "range": [1, 1] } ] }"#,
        )
        .unwrap();

        assert!(matches!(
            settings.registry(),
            Err(ConfigError::DuplicateScore { score: 1, .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.fields.len(), 2);

        let missing = Settings::from_file(dir.path().join("nope.json"));
        assert!(missing.is_err());
    }
}
