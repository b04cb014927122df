pub mod analyzer;
pub mod boundaries;
pub mod viterbi;
pub mod vocabulary;

pub use analyzer::{AlignmentComparison, AlignmentPathAnalyzer, PathAnalysis};
pub use boundaries::{compare_boundaries, derive_boundaries};
pub use vocabulary::LabelVocabulary;
