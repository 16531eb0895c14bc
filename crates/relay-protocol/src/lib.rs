//! Wire shapes for the two dialects the relay speaks: the Anthropic
//! Messages API and the OpenAI Chat Completions API, plus SSE framing.
//!
//! Shapes are typed on the fields the relay inspects or rewrites; anything
//! else rides along in flattened `extra` maps so unknown fields survive a
//! round trip.

pub mod anthropic;
pub mod openai;
pub mod sse;

pub type JsonValue = serde_json::Value;
pub type JsonObject = serde_json::Map<String, serde_json::Value>;
