//! Mod manifest JSON types
//!
//! Serde definitions for the `mod.json` file shipped with each mod.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a mod within one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModId(pub String);

impl ModId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Root manifest structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModManifest {
    pub id: ModId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Archives to unpack with the external tool before planning
    #[serde(default)]
    pub extract: Vec<ArchiveExtraction>,
    #[serde(default)]
    pub files: Vec<ModFile>,
}

impl ModManifest {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

/// One archive extraction request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveExtraction {
    /// Archive path relative to the mod root
    pub archive: String,
    /// BMS script path relative to the mod root
    pub script: String,
}

/// One destination file touched by a mod
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModFile {
    /// Destination relative to the target directory
    pub destination: String,
    /// Zero-tolerance collision policy for this destination
    #[serde(default)]
    pub reserved: bool,
    #[serde(flatten)]
    pub action: FileAction,
}

/// What a mod does to a destination - tagged union based on `Action`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Action", rename_all_fields = "PascalCase")]
pub enum FileAction {
    /// Byte-level writes, applied in declared order
    Write { writes: Vec<WriteContent> },
    /// Remove the destination
    Delete,
    /// Rename the destination to another relative path
    Move { to: String },
}

/// Declarative write instruction
///
/// Offsets stay signed so a negative value in the manifest reaches the
/// planner and is reported as an invalid write instead of a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWriteContent", into = "RawWriteContent")]
pub struct WriteContent {
    pub start_offset: i64,
    pub end_offset: Option<i64>,
    pub payload: WritePayload,
    pub replace: bool,
}

/// Payload of a write: exactly one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    /// File path relative to the mod root (or its extraction output)
    File(String),
    /// Inline UTF-8 text
    Text(String),
}

impl WriteContent {
    /// Insert inline text at `start`
    pub fn insert_text(start: i64, text: impl Into<String>) -> Self {
        Self {
            start_offset: start,
            end_offset: None,
            payload: WritePayload::Text(text.into()),
            replace: false,
        }
    }

    /// Replace `[start, end)` (or the payload length when `end` is None) with inline text
    pub fn replace_text(start: i64, end: Option<i64>, text: impl Into<String>) -> Self {
        Self {
            start_offset: start,
            end_offset: end,
            payload: WritePayload::Text(text.into()),
            replace: true,
        }
    }
}

/// Wire form of [`WriteContent`]; both payload keys are optional here
/// and exactly one must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawWriteContent {
    start_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default)]
    replace: bool,
}

impl TryFrom<RawWriteContent> for WriteContent {
    type Error = String;

    fn try_from(raw: RawWriteContent) -> Result<Self, Self::Error> {
        let payload = match (raw.source_file, raw.text) {
            (Some(file), None) => WritePayload::File(file),
            (None, Some(text)) => WritePayload::Text(text),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "write at offset {} sets both SourceFile and Text",
                    raw.start_offset
                ))
            }
            (None, None) => {
                return Err(format!(
                    "write at offset {} sets neither SourceFile nor Text",
                    raw.start_offset
                ))
            }
        };

        Ok(Self {
            start_offset: raw.start_offset,
            end_offset: raw.end_offset,
            payload,
            replace: raw.replace,
        })
    }
}

impl From<WriteContent> for RawWriteContent {
    fn from(write: WriteContent) -> Self {
        let (source_file, text) = match write.payload {
            WritePayload::File(file) => (Some(file), None),
            WritePayload::Text(text) => (None, Some(text)),
        };
        Self {
            start_offset: write.start_offset,
            end_offset: write.end_offset,
            source_file,
            text,
            replace: write.replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let json = r#"{
            "Id": "better-hud",
            "Name": "Better HUD",
            "Files": [
                {
                    "Destination": "Data\\hud.cfg",
                    "Action": "Write",
                    "Writes": [
                        { "StartOffset": 4, "Text": "wide", "Replace": true },
                        { "StartOffset": 0, "SourceFile": "patch/header.bin" }
                    ]
                },
                { "Destination": "Data\\old.cfg", "Action": "Delete", "Reserved": true },
                { "Destination": "a.txt", "Action": "Move", "To": "b.txt" }
            ]
        }"#;

        let manifest: ModManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.id, ModId::new("better-hud"));
        assert_eq!(manifest.files.len(), 3);

        match &manifest.files[0].action {
            FileAction::Write { writes } => {
                assert_eq!(writes[0].payload, WritePayload::Text("wide".into()));
                assert!(writes[0].replace);
                assert_eq!(writes[1].payload, WritePayload::File("patch/header.bin".into()));
                assert!(!writes[1].replace);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(manifest.files[1].reserved);
        assert!(matches!(manifest.files[1].action, FileAction::Delete));
        assert!(matches!(&manifest.files[2].action, FileAction::Move { to } if to == "b.txt"));
    }

    #[test]
    fn test_payload_must_be_exactly_one() {
        let both = r#"{ "StartOffset": 0, "Text": "a", "SourceFile": "b" }"#;
        let err = serde_json::from_str::<WriteContent>(both).unwrap_err();
        assert!(err.to_string().contains("both"));

        let neither = r#"{ "StartOffset": 0 }"#;
        let err = serde_json::from_str::<WriteContent>(neither).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn test_write_content_serializes_back() {
        let write = WriteContent::replace_text(2, Some(4), "XY");
        let json = serde_json::to_string(&write).unwrap();
        assert!(json.contains("\"Text\":\"XY\""));
        assert!(!json.contains("SourceFile"));
        let back: WriteContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, write);
    }
}
