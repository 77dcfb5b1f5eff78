use std::collections::{BTreeMap, HashMap};

use crate::config::PredictionRule;

/// Keyword-driven lookup of which families apply to an event type
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<PredictionRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<PredictionRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PredictionRule] {
        &self.rules
    }

    /// Families whose keywords occur in `event_type`, restricted to `families`
    /// when given. Table order is preserved.
    pub fn matching(&self, event_type: &str, families: Option<&[String]>) -> Vec<&PredictionRule> {
        let event_type = event_type.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| families.map_or(true, |wanted| wanted.iter().any(|f| f == &rule.name)))
            .filter(|rule| {
                rule.trigger_keywords
                    .iter()
                    .any(|kw| event_type.contains(&kw.to_lowercase()))
            })
            .collect()
    }
}

/// Groups event types into categories for fulfillment matching
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    category_of: HashMap<String, String>,
}

impl AliasTable {
    pub fn new(categories: &BTreeMap<String, Vec<String>>) -> Self {
        let mut category_of = HashMap::new();
        for (category, members) in categories {
            let category_key = category.to_lowercase();
            category_of.insert(category_key.clone(), category_key.clone());
            for member in members {
                category_of.insert(member.to_lowercase(), category_key.clone());
            }
        }
        Self { category_of }
    }

    pub fn category(&self, event_type: &str) -> Option<&str> {
        self.category_of
            .get(&event_type.to_lowercase())
            .map(String::as_str)
    }

    /// Exact type match, or both types belong to the same category.
    pub fn matches(&self, predicted: &str, actual: &str) -> bool {
        if predicted.eq_ignore_ascii_case(actual) {
            return true;
        }
        match (self.category(predicted), self.category(actual)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Whether a predicted type is about price action, so that the observed market
/// impact of the base event should weigh in.
pub fn is_market_related(predicted_type: &str, keywords: &[String]) -> bool {
    let predicted_type = predicted_type.to_lowercase();
    keywords
        .iter()
        .any(|kw| predicted_type.contains(&kw.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictionConfig;

    fn tables() -> (RuleTable, AliasTable) {
        let config = PredictionConfig::default();
        (
            RuleTable::new(config.rules.clone()),
            AliasTable::new(&config.category_aliases),
        )
    }

    #[test]
    fn test_keyword_matching() {
        let (rules, _) = tables();

        let names = |t: &str| -> Vec<String> {
            rules.matching(t, None).iter().map(|r| r.name.clone()).collect()
        };

        assert_eq!(names("sanctions"), vec!["sanctions_impact"]);
        assert_eq!(names("interest_rate_hike"), vec!["rate_change"]);
        assert_eq!(names("Quarterly_Results"), vec!["earnings_impact"]);
        assert_eq!(names("market_volatility"), vec!["market_volatility"]);
        assert!(names("merger_announcement").is_empty());
    }

    #[test]
    fn test_family_filter() {
        let (rules, _) = tables();
        let only = vec!["rate_change".to_string()];

        assert!(rules.matching("sanctions", Some(only.as_slice())).is_empty());
        assert_eq!(rules.matching("rate_cut", Some(only.as_slice())).len(), 1);
    }

    #[test]
    fn test_alias_matching() {
        let (_, aliases) = tables();

        assert!(aliases.matches("rate_cut", "rate_cut"));
        assert!(aliases.matches("trade_restrictions", "sanctions"));
        assert!(aliases.matches("sanctions_compliance", "banking_limitations"));
        assert!(aliases.matches("currency_movement", "fx_intervention"));
        assert!(!aliases.matches("trade_restrictions", "rate_cut"));
        // Unknown types only match themselves
        assert!(!aliases.matches("merger", "acquisition"));
        assert_eq!(aliases.category("Asset_Freeze"), Some("sanctions"));
    }

    #[test]
    fn test_market_related() {
        let keywords = PredictionConfig::default().market_keywords;
        assert!(is_market_related("market_volatility", &keywords));
        assert!(is_market_related("market_reaction", &keywords));
        assert!(!is_market_related("analyst_revision", &keywords));
    }
}
