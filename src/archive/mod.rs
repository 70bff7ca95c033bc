//! Archive handling utilities.
//!
//! Archive formats are never parsed here; mods that ship packed data name a
//! QuickBMS script and the archive it unpacks, and extraction is delegated
//! to the external tool.

pub mod quickbms;

pub use quickbms::{locate, ExtractionBatch, ExtractionWorkspace, QuickBmsRunner, ToolError};
