//! applyforge: asynchronous drafting pipeline for application postings.
//!
//! Submitting a posting URL creates a pipeline run that, off the request
//! path, fetches the page (static fetch with rendered fallback), derives a
//! structured list of application questions, drafts one answer per question
//! from the user's document-derived context, and records progress durably
//! at every step so the run survives crashes and racing workers.

// Core modules
pub mod cli;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod generate;
pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{
    CapabilityError, ContextError, ErrorClass, ExtractionError, FetchError, GenerationError,
};
