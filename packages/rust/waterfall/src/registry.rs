//! Source Registry: for every fact, the fixed priority order of providers,
//! where each keeps the field, how it is normalized, and how far it is trusted.
//!
//! The order is static configuration. It is never learned or reshuffled at
//! runtime; the first provider in the list that answers wins outright.

use dealflow_shared::{Confidence, Fact};

use crate::normalize::Normalizer;

/// Professional-network export.
pub const LINKEDIN: &str = "LinkedIn";
/// Company-database export.
pub const CRUNCHBASE: &str = "Crunchbase";
/// Generic enrichment blob caching fields from the exports above.
pub const ENRICHMENT: &str = "Enrichment";
/// Direct columns of the deal record.
pub const DEAL: &str = "Deal";

const MORE_INFO_PROFILES: &str = "Require more information. Add LinkedIn or Crunchbase";
const MORE_INFO_MODEL: &str = "Require more information. Add a pitch deck or Crunchbase";
const MORE_INFO_INDUSTRY: &str = "Require more information. Add Crunchbase or a company description";
const MORE_INFO_FUNDING: &str = "Require more information. Add Crunchbase funding data";

/// One candidate location for a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpec {
    /// Provider whose most recent record is consulted.
    pub provider: &'static str,
    /// Dotted path into that record's payload.
    pub path: &'static str,
    /// Confidence reported when this entry answers.
    pub confidence: Confidence,
}

const fn spec(provider: &'static str, path: &'static str, confidence: Confidence) -> SourceSpec {
    SourceSpec {
        provider,
        path,
        confidence,
    }
}

/// Everything the resolver needs to know about one fact.
#[derive(Debug, Clone, Copy)]
pub struct FactSpec {
    pub fact: Fact,
    pub normalizer: Normalizer,
    /// Most to least trusted.
    pub order: &'static [SourceSpec],
    /// Instruction shown when no provider answers.
    pub fallback: &'static str,
}

static EMPLOYEE_COUNT: FactSpec = FactSpec {
    fact: Fact::EmployeeCount,
    normalizer: Normalizer::EmployeeCount,
    order: &[
        spec(LINKEDIN, "employee_count", Confidence::High),
        spec(CRUNCHBASE, "num_employees", Confidence::High),
        spec(ENRICHMENT, "linkedin.employee_count", Confidence::Medium),
        spec(ENRICHMENT, "crunchbase.num_employees", Confidence::Medium),
    ],
    fallback: MORE_INFO_PROFILES,
};

static FOUNDING_YEAR: FactSpec = FactSpec {
    fact: Fact::FoundingYear,
    normalizer: Normalizer::Year,
    order: &[
        spec(LINKEDIN, "founded_year", Confidence::High),
        spec(CRUNCHBASE, "founded_date", Confidence::High),
        spec(ENRICHMENT, "linkedin.founded_year", Confidence::Medium),
        spec(ENRICHMENT, "crunchbase.founded_date", Confidence::Medium),
    ],
    fallback: MORE_INFO_PROFILES,
};

static BUSINESS_MODEL: FactSpec = FactSpec {
    fact: Fact::BusinessModel,
    normalizer: Normalizer::Text,
    order: &[
        spec(DEAL, "business_model", Confidence::High),
        spec(CRUNCHBASE, "business_model", Confidence::Medium),
        spec(ENRICHMENT, "analysis.business_model", Confidence::Medium),
    ],
    fallback: MORE_INFO_MODEL,
};

static INDUSTRY: FactSpec = FactSpec {
    fact: Fact::Industry,
    normalizer: Normalizer::Text,
    order: &[
        spec(DEAL, "industry", Confidence::High),
        spec(CRUNCHBASE, "industry", Confidence::High),
        spec(LINKEDIN, "industry", Confidence::Medium),
        spec(ENRICHMENT, "crunchbase.industry", Confidence::Medium),
    ],
    fallback: MORE_INFO_INDUSTRY,
};

static TOTAL_FUNDING: FactSpec = FactSpec {
    fact: Fact::TotalFunding,
    normalizer: Normalizer::Money,
    order: &[
        spec(CRUNCHBASE, "total_funding_usd", Confidence::High),
        spec(DEAL, "total_funding", Confidence::Medium),
        spec(ENRICHMENT, "crunchbase.total_funding_usd", Confidence::Medium),
    ],
    fallback: MORE_INFO_FUNDING,
};

/// The registry entry for `fact`.
pub fn fact_spec(fact: Fact) -> &'static FactSpec {
    match fact {
        Fact::EmployeeCount => &EMPLOYEE_COUNT,
        Fact::FoundingYear => &FOUNDING_YEAR,
        Fact::BusinessModel => &BUSINESS_MODEL,
        Fact::Industry => &INDUSTRY,
        Fact::TotalFunding => &TOTAL_FUNDING,
    }
}

/// Every provider named anywhere in the registry, deduplicated.
pub fn known_providers() -> Vec<&'static str> {
    let mut providers: Vec<&'static str> = Vec::new();
    for fact in Fact::ALL {
        for source in fact_spec(fact).order {
            if !providers.contains(&source.provider) {
                providers.push(source.provider);
            }
        }
    }
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::get_nested_value;

    #[test]
    fn every_fact_has_an_order_and_fallback() {
        for fact in Fact::ALL {
            let spec = fact_spec(fact);
            assert_eq!(spec.fact, fact);
            assert!(!spec.order.is_empty(), "{fact} has no sources");
            assert!(spec.fallback.starts_with("Require more information"));
        }
    }

    #[test]
    fn registry_paths_are_well_formed() {
        let empty = serde_json::json!({});
        for fact in Fact::ALL {
            for source in fact_spec(fact).order {
                assert!(get_nested_value(&empty, source.path).is_ok(), "{}", source.path);
            }
        }
    }

    #[test]
    fn employee_count_prefers_profile_exports() {
        let order = fact_spec(Fact::EmployeeCount).order;
        assert_eq!(order[0].provider, LINKEDIN);
        assert_eq!(order[1].provider, CRUNCHBASE);
        assert!(order[2..].iter().all(|s| s.provider == ENRICHMENT));
        assert_eq!(
            fact_spec(Fact::EmployeeCount).fallback,
            "Require more information. Add LinkedIn or Crunchbase"
        );
    }

    #[test]
    fn known_providers_are_unique() {
        let providers = known_providers();
        assert_eq!(providers, vec![LINKEDIN, CRUNCHBASE, ENRICHMENT, DEAL]);
    }
}
