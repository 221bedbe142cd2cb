//! OpenAI-facing types and the upstream-to-OpenAI stream translation.
//!
//! Chunk construction and SSE framing are pure; [`streaming::translate_fragments`]
//! is the only piece that drives I/O, and only through the stream it is given.

pub mod openai_types;
pub mod streaming;
