//! Wire-level shapes shared by the provider adapters.
//!
//! Only the fields the pipeline reads are typed; everything else travels as
//! raw JSON so requests and responses pass through without loss.

pub mod claude;
pub mod openai;
pub mod sse;

pub use sse::{SseEvent, SseParser, encode_sse};
