//! Long-document handling: token-bounded chunking and iterative summarization.

pub mod chunker;
pub mod summarizer;

pub use chunker::{ChunkedDocument, ChunkerConfig, Excerpt, TextChunker};
pub use summarizer::{
    DocumentSummarizer, DocumentSummary, FnProgress, LoggingProgress, NoProgress,
    ProgressObserver, ProgressSignal, SummarizationState, SummarizerConfig, SummarizerPhase,
    SummaryOutcome,
};
