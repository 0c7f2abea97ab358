//! Generative-AI collaborator interface.
//!
//! The core treats the generator as an external collaborator: it hands
//! over a prompt (plus an optional inline image) and gets raw text back.
//! Output is untrusted structured text; [`parse`] strips code fences and
//! extracts JSON, and a parse failure surfaces as
//! [`GenerationError::Parse`](crate::errors::GenerationError) without any
//! automatic retry here.

use async_trait::async_trait;

use crate::errors::GenerationError;

mod gemini;
pub mod parse;

pub use gemini::GeminiGenerator;

/// An inline image attached to a generation request.
#[derive(Debug, Clone)]
pub struct InlineImage {
    /// MIME type, e.g. `image/jpeg`.
    pub mime_type: String,
    /// Raw image bytes (base64-encoded on the wire by the client).
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<InlineImage>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(prompt: impl Into<String>, image: InlineImage) -> Self {
        Self {
            prompt: prompt.into(),
            image: Some(image),
        }
    }
}

/// The generative-AI collaborator. Implementations must carry a bounded
/// timeout and translate it into `GenerationError::Timeout`, never a hang.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError>;
}
