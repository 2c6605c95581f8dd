//! Read-only scenario catalog.
//!
//! Scenarios are static data: the assets worth protecting, the attack
//! vectors against them and the defenses in place. The built-in catalog is
//! embedded at compile time; a custom catalog can be parsed from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const BUILTIN_CATALOG: &str = include_str!("catalog.toml");

/// Scenario used when a run does not name one
pub const DEFAULT_SCENARIO: &str = "soci_energy_grid";

const MIN_DISTINCT_TECHNIQUES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalAsset {
    pub asset_type: String,
    pub criticality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackVector {
    pub vector_id: String,
    pub name: String,
    pub attack_stage: String,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    pub likelihood: String,
    pub impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub sector: String,
    #[serde(default)]
    pub red_team_agents: usize,
    #[serde(default)]
    pub blue_team_agents: usize,
    #[serde(default)]
    pub compliance_frameworks: Vec<String>,
    #[serde(default)]
    pub critical_assets: BTreeMap<String, CriticalAsset>,
    #[serde(default)]
    pub attack_surface: Vec<String>,
    #[serde(default)]
    pub defensive_measures: Vec<String>,
    #[serde(default)]
    pub attack_vectors: Vec<AttackVector>,
}

impl Scenario {
    pub fn asset_names(&self) -> Vec<String> {
        self.critical_assets.keys().cloned().collect()
    }

    /// Distinct MITRE technique ids across all attack vectors.
    pub fn mitre_techniques(&self) -> BTreeSet<String> {
        self.attack_vectors
            .iter()
            .flat_map(|v| v.mitre_techniques.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> ScenarioValidation {
        let mut validation = ScenarioValidation::default();

        if self.critical_assets.is_empty() {
            validation.errors.push("No critical assets defined".to_string());
        }
        if self.attack_vectors.is_empty() {
            validation.errors.push("No attack vectors defined".to_string());
        }
        if self.defensive_measures.is_empty() {
            validation
                .warnings
                .push("No defensive measures defined".to_string());
        }

        let techniques = self.mitre_techniques().len();
        if techniques < MIN_DISTINCT_TECHNIQUES {
            validation.warnings.push(format!(
                "Only {} distinct MITRE techniques covered (expected at least {})",
                techniques, MIN_DISTINCT_TECHNIQUES
            ));
        }

        validation
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ScenarioValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    scenario: Vec<Scenario>,
}

#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_CATALOG).context("Built-in scenario catalog is invalid")
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text).context("Failed to parse scenario catalog")?;
        let scenarios = file
            .scenario
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Ok(Self { scenarios })
    }

    pub fn names(&self) -> Vec<&str> {
        self.scenarios.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
