//! Capability clients for the external AI services.
//!
//! The pipeline consumes two opaque capabilities (structured extraction and
//! answer generation) through a single [`CompletionProvider`] trait with an
//! OpenAI-compatible HTTP implementation. Vendors stay behind this boundary;
//! the adapters in `extract` and `generate` own their prompt contracts.

pub mod client;

pub use client::{
    Choice, CompletionProvider, CompletionRequest, CompletionResponse, Message,
    OpenAiCompatClient, Usage,
};
