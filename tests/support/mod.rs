// Each integration test (`lifecycle.rs`, `relay.rs`, `log_matching.rs`) compiles this
// module independently via `mod support;`, so items used by one test appear unused in others.
#![allow(unused)]

pub mod backend;
mod logs;
pub mod relay;

pub use logs::{Logs, buf_contains, line_matches};
