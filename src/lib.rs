//! modsplice - byte-level mod installer
//!
//! Applies mods as offset-addressed writes into an application's files,
//! detects overlapping writes across mods, and rolls every touched file back
//! when a session cannot finish.

pub mod archive;
pub mod hash;
pub mod installer;
pub mod manifest;
pub mod paths;
