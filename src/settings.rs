//! Declarative settings consumed by the linkage engine.
//!
//! Nothing here evaluates a rule or compares a record: this module only
//! assembles blocking rules and comparison definitions into the JSON
//! settings object the engine expects when a session is created.

use anyhow::Result;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A predicate restricting which record pairs the engine compares.
///
/// Built from equality on one or more columns via [`block_on`], or from a
/// raw SQL condition via [`BlockingRule::from_sql`]. A rule may carry
/// salting partitions to split a skewed blocking key across workers.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockingRule {
    sql: String,
    salting_partitions: Option<u32>,
}

/// Equality blocking on the given columns: `l.a = r.a and l.b = r.b`.
pub fn block_on(columns: &[&str]) -> Result<BlockingRule> {
    if columns.is_empty() {
        anyhow::bail!("block_on requires at least one column");
    }
    let sql = columns
        .iter()
        .map(|col| format!("l.{} = r.{}", col, col))
        .collect::<Vec<_>>()
        .join(" and ");
    Ok(BlockingRule {
        sql,
        salting_partitions: None,
    })
}

impl BlockingRule {
    /// A rule written directly as SQL, for conditions `block_on` cannot
    /// express (substrings, functions of columns).
    pub fn from_sql(sql: &str) -> Self {
        BlockingRule {
            sql: sql.to_string(),
            salting_partitions: None,
        }
    }

    /// Split this rule's blocking key into `partitions` sub-partitions so a
    /// skewed key does not pin the whole comparison onto one worker.
    pub fn with_salting_partitions(mut self, partitions: u32) -> Result<Self> {
        if partitions == 0 {
            anyhow::bail!("salting_partitions must be at least 1");
        }
        self.salting_partitions = Some(partitions);
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn salting_partitions(&self) -> Option<u32> {
        self.salting_partitions
    }
}

// Unsalted rules serialize as a bare SQL string, salted rules as an object.
// The engine accepts both forms.
impl Serialize for BlockingRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.salting_partitions {
            None => serializer.serialize_str(&self.sql),
            Some(partitions) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("blocking_rule", &self.sql)?;
                map.serialize_entry("salting_partitions", &partitions)?;
                map.end()
            }
        }
    }
}

/// How a single column contributes to the comparison vector.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Comparison {
    comparison_type: ComparisonType,
    column_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thresholds: Option<Vec<f64>>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ComparisonType {
    ExactMatch,
    JaroWinklerAtThresholds,
    LevenshteinAtThresholds,
}

pub fn exact_match(column_name: &str) -> Comparison {
    Comparison {
        comparison_type: ComparisonType::ExactMatch,
        column_name: column_name.to_string(),
        thresholds: None,
    }
}

pub fn jaro_winkler_at_thresholds(column_name: &str) -> Comparison {
    Comparison {
        comparison_type: ComparisonType::JaroWinklerAtThresholds,
        column_name: column_name.to_string(),
        thresholds: Some(vec![0.9, 0.7]),
    }
}

pub fn levenshtein_at_thresholds(column_name: &str) -> Comparison {
    Comparison {
        comparison_type: ComparisonType::LevenshteinAtThresholds,
        column_name: column_name.to_string(),
        thresholds: Some(vec![1.0, 2.0]),
    }
}

/// The declarative settings object a session is created with.
#[derive(Clone, Debug, Serialize)]
pub struct Settings {
    pub link_type: String,
    pub probability_two_random_records_match: f64,
    pub blocking_rules_to_generate_predictions: Vec<BlockingRule>,
    pub comparisons: Vec<Comparison>,
    pub retain_matching_columns: bool,
    pub retain_intermediate_calculation_columns: bool,
    pub additional_columns_to_retain: Vec<String>,
    pub max_iterations: u32,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }
}

pub struct SettingsBuilder {
    link_type: String,
    probability_two_random_records_match: f64,
    blocking_rules: Vec<BlockingRule>,
    comparisons: Vec<Comparison>,
    retain_matching_columns: bool,
    retain_intermediate_calculation_columns: bool,
    additional_columns_to_retain: Vec<String>,
    max_iterations: u32,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder {
            link_type: "dedupe_only".to_string(),
            probability_two_random_records_match: 0.0001,
            blocking_rules: Vec::new(),
            comparisons: Vec::new(),
            retain_matching_columns: false,
            retain_intermediate_calculation_columns: false,
            additional_columns_to_retain: Vec::new(),
            max_iterations: 20,
        }
    }
}

impl SettingsBuilder {
    pub fn probability_two_random_records_match(mut self, probability: f64) -> Self {
        self.probability_two_random_records_match = probability;
        self
    }

    pub fn blocking_rule(mut self, rule: BlockingRule) -> Self {
        self.blocking_rules.push(rule);
        self
    }

    pub fn comparison(mut self, comparison: Comparison) -> Self {
        self.comparisons.push(comparison);
        self
    }

    pub fn retain_matching_columns(mut self, retain: bool) -> Self {
        self.retain_matching_columns = retain;
        self
    }

    pub fn retain_intermediate_calculation_columns(mut self, retain: bool) -> Self {
        self.retain_intermediate_calculation_columns = retain;
        self
    }

    pub fn additional_column_to_retain(mut self, column: &str) -> Self {
        self.additional_columns_to_retain.push(column.to_string());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<Settings> {
        if self.blocking_rules.is_empty() {
            anyhow::bail!("Settings require at least one blocking rule to generate predictions");
        }
        if self.comparisons.is_empty() {
            anyhow::bail!("Settings require at least one comparison");
        }
        Ok(Settings {
            link_type: self.link_type,
            probability_two_random_records_match: self.probability_two_random_records_match,
            blocking_rules_to_generate_predictions: self.blocking_rules,
            comparisons: self.comparisons,
            retain_matching_columns: self.retain_matching_columns,
            retain_intermediate_calculation_columns: self.retain_intermediate_calculation_columns,
            additional_columns_to_retain: self.additional_columns_to_retain,
            max_iterations: self.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_on_builds_equality_sql() {
        let rule = block_on(&["first_name", "last_name", "dob"]).unwrap();
        assert_eq!(
            rule.sql(),
            "l.first_name = r.first_name and l.last_name = r.last_name and l.dob = r.dob"
        );
        assert_eq!(rule.salting_partitions(), None);
    }

    #[test]
    fn test_block_on_rejects_empty_columns() {
        assert!(block_on(&[]).is_err());
    }

    #[test]
    fn test_salting_partitions_must_be_positive() {
        let rule = block_on(&["dob"]).unwrap();
        assert!(rule.clone().with_salting_partitions(0).is_err());
        let salted = rule.with_salting_partitions(8).unwrap();
        assert_eq!(salted.salting_partitions(), Some(8));
    }

    #[test]
    fn test_unsalted_rule_serializes_as_string() {
        let rule = BlockingRule::from_sql("l.postcode = r.postcode");
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value, json!("l.postcode = r.postcode"));
    }

    #[test]
    fn test_salted_rule_serializes_as_object() {
        let rule = block_on(&["first_name", "last_name"])
            .unwrap()
            .with_salting_partitions(4)
            .unwrap();
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            value,
            json!({
                "blocking_rule": "l.first_name = r.first_name and l.last_name = r.last_name",
                "salting_partitions": 4
            })
        );
    }

    #[test]
    fn test_comparison_serialization() {
        let value = serde_json::to_value(jaro_winkler_at_thresholds("surname")).unwrap();
        assert_eq!(
            value,
            json!({
                "comparison_type": "jaro_winkler_at_thresholds",
                "column_name": "surname",
                "thresholds": [0.9, 0.7]
            })
        );

        let value = serde_json::to_value(exact_match("gender")).unwrap();
        assert_eq!(
            value,
            json!({
                "comparison_type": "exact_match",
                "column_name": "gender"
            })
        );
    }

    #[test]
    fn test_settings_builder_defaults() {
        let settings = Settings::builder()
            .blocking_rule(BlockingRule::from_sql("l.dob = r.dob"))
            .comparison(exact_match("dob"))
            .build()
            .unwrap();
        assert_eq!(settings.link_type, "dedupe_only");
        assert_eq!(settings.probability_two_random_records_match, 0.0001);
        assert_eq!(settings.max_iterations, 20);
        assert!(!settings.retain_matching_columns);
    }

    #[test]
    fn test_settings_builder_rejects_empty_rules_or_comparisons() {
        assert!(Settings::builder().comparison(exact_match("dob")).build().is_err());
        assert!(Settings::builder()
            .blocking_rule(BlockingRule::from_sql("l.dob = r.dob"))
            .build()
            .is_err());
    }

    #[test]
    fn test_settings_json_field_names() {
        let settings = Settings::builder()
            .probability_two_random_records_match(0.0001)
            .blocking_rule(BlockingRule::from_sql(
                "l.first_name = r.first_name and l.surname = r.surname",
            ))
            .comparison(levenshtein_at_thresholds("dob"))
            .additional_column_to_retain("cluster")
            .build()
            .unwrap();
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["link_type"], "dedupe_only");
        assert_eq!(value["additional_columns_to_retain"], json!(["cluster"]));
        assert!(value["blocking_rules_to_generate_predictions"].is_array());
        assert_eq!(value["max_iterations"], 20);
    }
}
