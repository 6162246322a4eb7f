pub mod analysis;
pub mod llm;
pub mod review;
pub mod score;

pub use analysis::{
    run_analyzers, Analyzer, BoundedFile, CiReport, CiStatus, Issue, IssueKind, PrMetadata,
    PrMetrics, Severity, StaticReport,
};
pub use llm::{parse_llm_review, LlmParseError, LlmReview, NEUTRAL_SCORE};
pub use review::{create_user_prompt, get_system_prompt, MAX_DIFF_FILES, MAX_LINES_PER_FILE};
pub use score::{
    compute_breakdown, Badge, CategoryScores, LegacyScores, ScoreBreakdown, FUSION_LLM_WEIGHT,
};
