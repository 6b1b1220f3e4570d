pub mod detection;
pub mod labels;
pub mod report;
pub mod retrieval;
pub mod risk;

pub use detection::{BoundingBox, Detection, DetectionSource, RawDetection};
pub use labels::{LabelCatalog, LabelCategory, LabelEntry};
pub use report::{AlertMessage, RegulationExcerpt, ReportPaths, ReportSections};
pub use retrieval::{IndexedDocument, RankedDocument, RetrievalBudget, RetrievalHit};
pub use risk::{AlertBreakpoints, AlertLevel, Breakpoint, RiskAssessment, ScoringPath, ViolationFinding};
