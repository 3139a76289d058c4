// 🏷️ Rating Field Descriptor
// One rating dimension on an entity type: allowed scores + voting policy + formula.

use crate::entity::EntityRef;
use crate::error::ConfigError;
use crate::formula::Formula;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Width of the stored field key (hex characters)
pub const FIELD_KEY_LEN: usize = 32;

/// How much of the field key goes into the cookie name
pub const COOKIE_KEY_PREFIX_LEN: usize = 6;

/// Stable storage key for a field name
pub fn field_key(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut key = format!("{:x}", digest);
    key.truncate(FIELD_KEY_LEN);
    key
}

// ============================================================================
// RATING FIELD
// ============================================================================

#[derive(Debug, Clone)]
pub struct RatingField {
    name: String,
    key: String,
    range: Vec<i64>,
    allow_anonymous: bool,
    use_cookies: bool,
    allow_delete: bool,
    can_change_vote: bool,
    formula: Formula,
}

impl RatingField {
    /// New field with every policy flag off: authenticated, final, undeletable votes
    pub fn new(
        name: impl Into<String>,
        range: Vec<i64>,
        formula: Formula,
    ) -> Result<Self, ConfigError> {
        let name = name.into();

        if range.is_empty() {
            return Err(ConfigError::EmptyRange { field: name });
        }

        let mut seen = HashSet::new();
        for score in &range {
            if !seen.insert(*score) {
                return Err(ConfigError::DuplicateScore {
                    field: name,
                    score: *score,
                });
            }
        }

        Ok(RatingField {
            key: field_key(&name),
            name,
            range,
            allow_anonymous: false,
            use_cookies: false,
            allow_delete: false,
            can_change_vote: false,
            formula,
        })
    }

    /// Field that accepts anonymous votes from the start
    pub fn anonymous(
        name: impl Into<String>,
        range: Vec<i64>,
        formula: Formula,
    ) -> Result<Self, ConfigError> {
        Ok(RatingField::new(name, range, formula)?.allow_anonymous(true))
    }

    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn use_cookies(mut self, use_cookies: bool) -> Self {
        self.use_cookies = use_cookies;
        self
    }

    pub fn allow_delete(mut self, allow: bool) -> Self {
        self.allow_delete = allow;
        self
    }

    pub fn can_change_vote(mut self, allow: bool) -> Self {
        self.can_change_vote = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn range(&self) -> &[i64] {
        &self.range
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub fn allows_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn allows_delete(&self) -> bool {
        self.allow_delete
    }

    pub fn allows_change(&self) -> bool {
        self.can_change_vote
    }

    /// Cookies only matter when anonymous votes are possible at all
    pub fn uses_cookies(&self) -> bool {
        self.allow_anonymous && self.use_cookies
    }

    pub fn check_range(&self, score: i64) -> bool {
        self.range.contains(&score)
    }

    /// Distribution slot for a score
    pub fn index_of(&self, score: i64) -> Option<usize> {
        self.range.iter().position(|s| *s == score)
    }

    /// Cookie holding this voter's token for `entity` on this field
    pub fn cookie_name(&self, entity: &EntityRef) -> String {
        format!(
            "vote-{}.{}.{}",
            entity.entity_type,
            entity.object_id,
            &self.key[..COOKIE_KEY_PREFIX_LEN]
        )
    }

    /// Score of this field for a distribution
    pub fn compute(&self, distribution: &[u64]) -> f64 {
        self.formula.apply(distribution, &self.range)
    }
}

// ============================================================================
// FIELD REGISTRY
// ============================================================================

/// Rating fields declared per entity type
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: HashMap<i64, Vec<RatingField>>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: i64, field: RatingField) -> Result<(), ConfigError> {
        let fields = self.fields.entry(entity_type).or_default();

        if fields.iter().any(|f| f.name == field.name) {
            return Err(ConfigError::DuplicateField {
                entity_type,
                field: field.name,
            });
        }

        fields.push(field);
        Ok(())
    }

    pub fn get(&self, entity_type: i64, name: &str) -> Option<&RatingField> {
        self.fields_for(entity_type).iter().find(|f| f.name == name)
    }

    pub fn get_by_key(&self, entity_type: i64, key: &str) -> Option<&RatingField> {
        self.fields_for(entity_type).iter().find(|f| f.key == key)
    }

    /// All fields of an entity type, in declaration order
    pub fn fields_for(&self, entity_type: i64) -> &[RatingField] {
        self.fields
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn field_count(&self) -> usize {
        self.fields.values().map(Vec::len).sum()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stars() -> RatingField {
        RatingField::new("quality", vec![1, 2, 3, 4, 5], Formula::weighted_average()).unwrap()
    }

    #[test]
    fn test_range_validation() {
        let empty = RatingField::new("quality", vec![], Formula::weighted_average());
        assert_eq!(
            empty.unwrap_err(),
            ConfigError::EmptyRange {
                field: "quality".to_string()
            }
        );

        let dup = RatingField::new("quality", vec![1, 2, 2], Formula::weighted_average());
        assert_eq!(
            dup.unwrap_err(),
            ConfigError::DuplicateScore {
                field: "quality".to_string(),
                score: 2
            }
        );
    }

    #[test]
    fn test_defaults_and_builders() {
        let field = stars();
        assert!(!field.allows_anonymous());
        assert!(!field.allows_delete());
        assert!(!field.allows_change());
        assert!(!field.uses_cookies());

        // Cookies without anonymous voting stay off
        let field = stars().use_cookies(true);
        assert!(!field.uses_cookies());

        let field = RatingField::anonymous("quality", vec![1, 2], Formula::binary_lower_bound())
            .unwrap()
            .use_cookies(true);
        assert!(field.uses_cookies());
    }

    #[test]
    fn test_key_and_cookie_name() {
        let field = stars();
        assert_eq!(field.key().len(), FIELD_KEY_LEN);
        assert_eq!(field.key(), field_key("quality"));
        assert_ne!(field.key(), field_key("difficulty"));

        let entity = EntityRef::new(12, 345);
        let cookie = field.cookie_name(&entity);
        assert_eq!(cookie, format!("vote-12.345.{}", &field.key()[..6]));
    }

    #[test]
    fn test_index_of() {
        let field = stars();
        assert_eq!(field.index_of(1), Some(0));
        assert_eq!(field.index_of(5), Some(4));
        assert_eq!(field.index_of(0), None);
        assert!(field.check_range(3));
        assert!(!field.check_range(6));
    }

    #[test]
    fn test_registry() {
        let mut registry = FieldRegistry::new();
        registry.register(1, stars()).unwrap();
        registry
            .register(
                1,
                RatingField::new("difficulty", vec![1, 2, 3], Formula::weighted_average())
                    .unwrap(),
            )
            .unwrap();

        let err = registry.register(1, stars()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateField { entity_type: 1, .. }));

        assert_eq!(registry.fields_for(1).len(), 2);
        assert!(registry.fields_for(2).is_empty());
        assert_eq!(registry.get(1, "difficulty").unwrap().range(), &[1, 2, 3]);
        assert_eq!(
            registry.get_by_key(1, &field_key("quality")).unwrap().name(),
            "quality"
        );
        assert_eq!(registry.field_count(), 2);
    }
}
