//! Stateless converters between the Anthropic Messages dialect and the
//! OpenAI Chat Completions dialect.
//!
//! Three entry points: [`convert_request`] rewrites an inbound Messages
//! request into a Chat Completions request, [`convert_response`] maps a
//! buffered Chat Completions response back, and [`StreamConverter`] rewrites
//! an SSE chunk stream event-by-event. Nothing here does I/O and nothing is
//! remembered across requests.

mod request;
mod response;
mod stream;

pub use request::{ConvertedRequest, convert_request};
pub use response::convert_response;
pub use stream::StreamConverter;

/// Gemini-family targets get Google-flavored thought signatures instead of
/// the `reasoning` field.
pub(crate) fn is_gemini_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("gemini")
}

#[cfg(test)]
mod tests;
