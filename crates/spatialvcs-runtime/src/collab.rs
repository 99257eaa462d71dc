//! Contracts with the external description service.
//!
//! The service itself (a multimodal model behind some API) is not part of
//! this crate.  What is defined here is what we send it, what we expect back,
//! and how a reply is read:
//!
//! - [`Describer`] – the seam a concrete client implements.
//! - [`SceneDescription`] / [`SpatialDiff`] – the JSON shapes requested by
//!   [`SCENE_PROMPT`] and [`DIFF_PROMPT`].
//! - [`parse_fenced_json`] – replies often arrive wrapped in a Markdown code
//!   fence.  The accepted grammar is
//!
//!   ```text
//!   reply := ws* ( "```" lang? ws* body ws* "```"? | body ) ws*
//!   lang  := [A-Za-z0-9_+-]+
//!   ```
//!
//!   where `body` must be a JSON document.  Anything else is
//!   [`ParsedJson::Malformed`], and the typed parsers fall back to keeping
//!   the raw reply as the summary text.

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spatialvcs_memory::SearchHit;
use spatialvcs_types::SpatialError;
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

/// Instruction sent with a whole frame.
pub const SCENE_PROMPT: &str = "\
You are a spatial analysis assistant. List every distinct object visible in this image.
For each object give:
- name: what the object is (e.g. 'red ceramic mug', 'silver laptop')
- position: where in the frame (e.g. 'left side of desk')
- details: distinguishing features (color, brand, state)
Return ONLY JSON matching the attached schema. Include small items such as keys, pens and cables.";

/// Instruction sent with a single object crop.
pub const OBJECT_PROMPT: &str = "\
Describe the object in this image in one sentence: what it is, its color and material, and its state.";

/// Instruction sent with a question and the ranked memory hits for it.
pub const ANSWER_PROMPT: &str = "\
The user scanned their space earlier and now asks a question. Using the ranked results from \
spatial memory, answer clearly and concisely. Mention when and where the object was seen. \
If the results are not conclusive, say so. Keep it under 3 sentences.";

/// Instruction sent with two object lists.
pub const DIFF_PROMPT: &str = "\
Compare the BEFORE and AFTER snapshots of the same space and list every change.
Return ONLY JSON: {\"changes\": [{\"object\": \"name\", \"action\": \"moved|added|removed|modified\", \
\"from\": \"previous location or state\", \"to\": \"new location or state\", \"details\": \"brief explanation\"}], \
\"summary\": \"one sentence\", \"change_count\": number}";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CollabError {
    /// The service could not be reached or refused the request.
    #[error("description service unavailable: {0}")]
    Unavailable(String),
    /// The service answered with something unusable.
    #[error("bad reply from description service: {0}")]
    BadReply(String),
}

impl From<CollabError> for SpatialError {
    fn from(e: CollabError) -> Self {
        SpatialError::Collaborator(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Describer seam
// ─────────────────────────────────────────────────────────────────────────────

/// A text-and-image model that describes what it sees.
///
/// Replies are returned as raw text; callers parse them.
pub trait Describer: Send + Sync {
    /// Describe a whole frame; the reply should follow [`SCENE_PROMPT`].
    fn describe_frame(&self, image: &[u8]) -> Result<String, CollabError>;

    /// Describe one cropped object the detector labelled `label`.
    fn describe_object(&self, crop: &[u8], label: &str) -> Result<String, CollabError> {
        let _ = label;
        self.describe_frame(crop)
    }

    /// Answer `query` from memory hits, best first; see [`ANSWER_PROMPT`].
    fn answer(&self, query: &str, hits: &[SearchHit]) -> Result<String, CollabError> {
        let _ = (query, hits);
        Err(CollabError::Unavailable(
            "this describer does not answer questions".to_string(),
        ))
    }

    /// Compare two object lists; the reply should follow [`DIFF_PROMPT`].
    fn compare(
        &self,
        before: &[SceneObject],
        after: &[SceneObject],
    ) -> Result<String, CollabError> {
        let _ = (before, after);
        Err(CollabError::Unavailable(
            "this describer does not compare snapshots".to_string(),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fenced JSON
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of reading a reply as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedJson {
    Parsed(Value),
    Malformed { raw: String, reason: String },
}

impl ParsedJson {
    pub fn ok(self) -> Option<Value> {
        match self {
            ParsedJson::Parsed(v) => Some(v),
            ParsedJson::Malformed { .. } => None,
        }
    }
}

const FENCE: &str = "```";

fn is_lang_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-')
}

/// The JSON body of `reply`, with an optional surrounding code fence removed.
fn fenced_body(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(after_open) = trimmed.strip_prefix(FENCE) else {
        return trimmed;
    };
    let lang_len = after_open
        .find(|c: char| !is_lang_char(c))
        .unwrap_or(after_open.len());
    let body = &after_open[lang_len..];
    let body = body.trim_end();
    body.strip_suffix(FENCE).unwrap_or(body).trim()
}

/// Read a service reply as JSON, accepting an optional code fence.
pub fn parse_fenced_json(reply: &str) -> ParsedJson {
    match serde_json::from_str::<Value>(fenced_body(reply)) {
        Ok(v) => ParsedJson::Parsed(v),
        Err(e) => ParsedJson::Malformed {
            raw: reply.to_string(),
            reason: e.to_string(),
        },
    }
}

fn parse_as<T: serde::de::DeserializeOwned>(reply: &str) -> Result<T, String> {
    match parse_fenced_json(reply) {
        ParsedJson::Parsed(v) => serde_json::from_value(v).map_err(|e| e.to_string()),
        ParsedJson::Malformed { reason, .. } => Err(reason),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene description
// ─────────────────────────────────────────────────────────────────────────────

/// One object as named by the description service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct SceneObject {
    pub name: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub details: String,
}

impl SceneObject {
    /// One-line text suitable for embedding.
    pub fn to_text(&self) -> String {
        let mut text = self.name.clone();
        if !self.details.is_empty() {
            text.push_str(", ");
            text.push_str(&self.details);
        }
        if !self.position.is_empty() {
            text.push_str(", ");
            text.push_str(&self.position);
        }
        text
    }
}

/// Structured reply to [`SCENE_PROMPT`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct SceneDescription {
    #[serde(default)]
    pub scene_summary: String,
    #[serde(default)]
    pub objects: Vec<SceneObject>,
}

impl SceneDescription {
    /// Parse a reply; on failure the whole reply becomes the summary.
    pub fn parse(reply: &str) -> Self {
        parse_as(reply).unwrap_or_else(|reason| {
            debug!(%reason, "scene reply is not structured; keeping raw text");
            Self {
                scene_summary: reply.trim().to_string(),
                objects: Vec::new(),
            }
        })
    }

    /// JSON Schema handed to services that support structured output.
    pub fn json_schema() -> Value {
        serde_json::to_value(schema_for!(SceneDescription)).unwrap_or(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Spatial diff
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Moved,
    Added,
    Removed,
    Modified,
    #[serde(other)]
    Other,
}

/// One change between two snapshots of a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialChange {
    pub object: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub details: String,
}

/// Structured reply to [`DIFF_PROMPT`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialDiff {
    #[serde(default)]
    pub changes: Vec<SpatialChange>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub change_count: usize,
}

impl SpatialDiff {
    /// Parse a reply; on failure the whole reply becomes the summary and no
    /// changes are reported.
    pub fn parse(reply: &str) -> Self {
        match parse_as::<Self>(reply) {
            Ok(mut diff) => {
                if diff.change_count == 0 {
                    diff.change_count = diff.changes.len();
                }
                diff
            }
            Err(reason) => {
                debug!(%reason, "diff reply is not structured; keeping raw text");
                Self {
                    changes: Vec::new(),
                    summary: reply.trim().to_string(),
                    change_count: 0,
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
