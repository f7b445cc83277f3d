//! Wire shapes of every dialect the relay speaks.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod responses;
pub mod task;
