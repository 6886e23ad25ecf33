// Facades exposed to external collaborators (admin API, UI); plain structs
// because the HTTP surface lives outside the core

pub mod analysis;
pub mod extraction;

pub use analysis::{
    AnalysisService, CaptureCreated, LlmAnalysisResult, LlmAnalysisSummary, MappingProposal,
    SchemaAwareAnalysis, SchemaAwareSummary,
};
pub use extraction::{CommitResult, ExtractionService};
