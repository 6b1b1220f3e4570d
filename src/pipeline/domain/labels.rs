use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Coarse grouping of vocabulary labels. Retrieval budgets, scoring and
/// alerting key off the category, never off individual label names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelCategory {
    PpeViolation,
    PpeCompliance,
    Machinery,
    /// Equipment workers use directly; retrieved like machinery but never
    /// counted as heavy equipment
    SiteEquipment,
    Person,
    Vehicle,
    SiteObject,
}

impl LabelCategory {
    pub fn is_violation(&self) -> bool {
        matches!(self, LabelCategory::PpeViolation)
    }
}

/// One vocabulary entry as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub name: String,
    pub category: LabelCategory,
    pub query: String,
    #[serde(default)]
    pub severity_weight: Option<u32>,
    #[serde(default)]
    pub remediation: Option<String>,
}

impl LabelEntry {
    fn new(name: &str, category: LabelCategory, query: &str) -> Self {
        Self {
            name: name.to_string(),
            category,
            query: query.to_string(),
            severity_weight: None,
            remediation: None,
        }
    }

    fn with_weight(mut self, weight: u32) -> Self {
        self.severity_weight = Some(weight);
        self
    }

    fn with_remediation(mut self, remediation: &str) -> Self {
        self.remediation = Some(remediation.to_string());
        self
    }
}

/// Closed detection vocabulary with case-insensitive lookup.
#[derive(Debug, Clone)]
pub struct LabelCatalog {
    entries: IndexMap<String, LabelEntry>,
}

impl LabelCatalog {
    pub fn new(entries: impl IntoIterator<Item = LabelEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.name.to_lowercase(), entry))
            .collect();
        Self { entries }
    }

    pub fn get(&self, label: &str) -> Option<&LabelEntry> {
        self.entries.get(&label.trim().to_lowercase())
    }

    /// Canonical spelling of `label`, or `None` when it is outside the vocabulary.
    pub fn canonical(&self, label: &str) -> Option<&str> {
        self.get(label).map(|entry| entry.name.as_str())
    }

    pub fn category(&self, label: &str) -> Option<LabelCategory> {
        self.get(label).map(|entry| entry.category)
    }

    pub fn is_violation(&self, label: &str) -> bool {
        self.category(label)
            .map(|category| category.is_violation())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LabelEntry> {
        self.entries.values()
    }

    /// The construction-site vocabulary of the stock detector model.
    pub fn default_entries() -> Vec<LabelEntry> {
        use LabelCategory::*;
        vec![
            LabelEntry::new(
                "NO-Hardhat",
                PpeViolation,
                "hard hat head protection requirement construction site",
            )
            .with_weight(35)
            .with_remediation("Require hard hats for every worker inside the site perimeter."),
            LabelEntry::new(
                "NO-Mask",
                PpeViolation,
                "respiratory protection mask requirement airborne contaminants",
            )
            .with_weight(20)
            .with_remediation("Issue respirators where airborne contaminants are present."),
            LabelEntry::new(
                "NO-Safety Vest",
                PpeViolation,
                "high visibility safety vest apparel requirement flagger",
            )
            .with_weight(25)
            .with_remediation("Enforce high-visibility vests near traffic and moving equipment."),
            LabelEntry::new("Hardhat", PpeCompliance, "hard hat head protection compliance standard"),
            LabelEntry::new("Mask", PpeCompliance, "respiratory protection mask compliance"),
            LabelEntry::new("Safety Vest", PpeCompliance, "high visibility safety apparel compliance"),
            LabelEntry::new("Gloves", PpeCompliance, "hand protection gloves requirement construction"),
            LabelEntry::new("Person", Person, "worker safety requirement construction site general"),
            LabelEntry::new(
                "Excavator",
                Machinery,
                "excavator heavy equipment operator safety clearance zone",
            ),
            LabelEntry::new(
                "Wheel Loader",
                Machinery,
                "wheel loader heavy machinery operator safety requirement",
            ),
            LabelEntry::new("Machinery", Machinery, "machinery equipment safety requirement construction"),
            LabelEntry::new("Dump Truck", Machinery, "dump truck vehicle safety construction site"),
            LabelEntry::new("Truck", Vehicle, "truck vehicle safety construction site"),
            LabelEntry::new("Truck and Trailer", Vehicle, "truck trailer vehicle safety construction site"),
            LabelEntry::new("Trailer", Vehicle, "trailer vehicle safety requirement"),
            LabelEntry::new("Semi", Vehicle, "semi truck heavy vehicle safety requirement"),
            LabelEntry::new("SUV", Vehicle, "vehicle traffic control construction zone safety"),
            LabelEntry::new("Van", Vehicle, "van vehicle traffic control construction zone"),
            LabelEntry::new("Mini-Van", Vehicle, "vehicle traffic control construction zone safety"),
            LabelEntry::new("Sedan", Vehicle, "vehicle traffic control construction zone safety"),
            LabelEntry::new("Bus", Vehicle, "bus vehicle traffic control construction zone"),
            LabelEntry::new("Vehicle", Vehicle, "vehicle traffic control construction zone safety"),
            LabelEntry::new(
                "Safety Cone",
                SiteObject,
                "traffic cone safety barrier construction zone requirement",
            ),
            LabelEntry::new(
                "Ladder",
                SiteEquipment,
                "ladder safety requirement portable climbing construction",
            ),
            LabelEntry::new("Fire Hydrant", SiteObject, "fire hydrant clearance requirement obstruction"),
        ]
    }
}

impl Default for LabelCatalog {
    fn default() -> Self {
        Self::new(Self::default_entries())
    }
}
