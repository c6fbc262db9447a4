//! Backend module - client contract, OpenAI-compatible client, and registry

pub mod model_catalog;
pub mod openai;
pub mod registry;
pub mod sse;
pub mod text_backend;

// Re-export text backend types for convenience
pub use text_backend::{
    create_text_backend, ChatMessage, EventStream, FailureSeverity, GenerationRequest,
    ProbeOutcome, SamplingParams, StreamError, StreamEvent, TextBackend, Usage,
};

pub use registry::{BackendDescriptor, BackendRegistry, Capabilities, RegisteredBackend, RegistrySnapshot};
