// crates/framepipe-media/src/helpers/mod.rs
//
// Internal helpers for framepipe-media. Not re-exported from lib.rs;
// stride plumbing is a codec implementation detail, not part of the API.

pub mod frames;
