//! JSONL transcript parser.
//!
//! Transcripts live at `<root>/<project>/<session>.jsonl`, one JSON object per line.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Error;
use crate::fs::FileReader;

const TRANSCRIPT_EXTENSION: &str = ".jsonl";

/// Entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    System,
    Result,
}

impl EntryKind {
    /// Whether entries of this kind become messages.
    pub fn is_conversational(&self) -> bool {
        matches!(self, EntryKind::User | EntryKind::Assistant)
    }
}

/// Message payload within a log entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntryMessage {
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub model: Option<String>,
}

/// One validated transcript line.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub message: Option<EntryMessage>,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Zero-based physical line number.
    #[serde(skip)]
    pub line: usize,
    /// Line text as read from disk.
    #[serde(skip)]
    pub raw: String,
}

impl LogEntry {
    /// Identity of this line within its session, stable across re-reads.
    pub fn natural_key(&self) -> String {
        match &self.uuid {
            Some(uuid) if !uuid.is_empty() => uuid.clone(),
            _ => format!("sha256:{:x}", Sha256::digest(self.raw.as_bytes())),
        }
    }

    /// Role of the message, falling back to the entry type.
    pub fn role(&self) -> &str {
        match &self.message {
            Some(message) if !message.role.is_empty() => message.role.as_str(),
            _ => match self.kind {
                EntryKind::User => "user",
                EntryKind::Assistant => "assistant",
                EntryKind::System => "system",
                EntryKind::Result => "result",
            },
        }
    }
}

/// Outcome of parsing JSONL content.
#[derive(Debug, Clone, Default)]
pub struct ParsedLines {
    pub entries: Vec<LogEntry>,
    /// Lines that failed JSON parsing or validation.
    pub skipped: usize,
    /// Non-blank complete lines seen.
    pub non_blank: usize,
    /// Complete lines consumed. An unterminated, unparseable final line is not counted.
    pub line_count: usize,
}

/// A parsed transcript file.
#[derive(Debug, Clone)]
pub struct ParsedLogFile {
    pub file_path: PathBuf,
    pub project_name: String,
    pub session_id: String,
    pub entries: Vec<LogEntry>,
    pub skipped: usize,
    pub line_count: usize,
}

/// Parse and validate a single line.
pub fn parse_line(line: &str) -> Result<LogEntry, Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    validate(value)
}

fn validate(value: serde_json::Value) -> Result<LogEntry, Error> {
    let entry: LogEntry = serde_json::from_value(value)
        .map_err(|e| Error::parser(format!("schema mismatch: {e}")))?;

    if entry.kind.is_conversational() && entry.message.is_none() {
        return Err(Error::parser(format!(
            "{:?} entry without message",
            entry.kind
        )));
    }
    if entry.session_id.is_empty() {
        return Err(Error::parser("empty sessionId"));
    }
    Ok(entry)
}

/// Parse newline-delimited JSON content.
///
/// Invalid lines are counted and skipped; they never fail the whole call.
pub fn parse_json_lines(content: &str) -> ParsedLines {
    parse_json_bytes(content.as_bytes())
}

/// Parse newline-delimited JSON from raw bytes.
///
/// Each line is decoded on its own, so a line that is not UTF-8 is skipped
/// like any other malformed line.
pub fn parse_json_bytes(content: &[u8]) -> ParsedLines {
    let mut parsed = ParsedLines::default();

    for (idx, segment) in content.split_inclusive(|b| *b == b'\n').enumerate() {
        let terminated = segment.last() == Some(&b'\n');

        let text = match std::str::from_utf8(segment) {
            Ok(text) => text.trim_end_matches(['\n', '\r']),
            Err(e) if !terminated => {
                // May be a multi-byte character cut mid-write.
                debug!(line = idx + 1, error = %e, "Deferring incomplete trailing line");
                break;
            }
            Err(e) => {
                debug!(line = idx + 1, error = %e, "Skipping line that is not UTF-8");
                parsed.skipped += 1;
                parsed.non_blank += 1;
                parsed.line_count = idx + 1;
                continue;
            }
        };

        if text.trim().is_empty() {
            if terminated {
                parsed.line_count = idx + 1;
            }
            continue;
        }

        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => value,
            Err(e) if !terminated => {
                // Writer is mid-line; pick it up whole on the next pass.
                debug!(line = idx + 1, error = %e, "Deferring incomplete trailing line");
                break;
            }
            Err(e) => {
                debug!(line = idx + 1, error = %e, "Skipping malformed JSON line");
                parsed.skipped += 1;
                parsed.non_blank += 1;
                parsed.line_count = idx + 1;
                continue;
            }
        };

        parsed.non_blank += 1;
        parsed.line_count = idx + 1;

        match validate(value) {
            Ok(mut entry) => {
                entry.line = idx;
                entry.raw = text.to_string();
                parsed.entries.push(entry);
            }
            Err(e) => {
                debug!(line = idx + 1, error = %e, "Skipping invalid log entry");
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

/// Normal path segments as strings, or None when any is not UTF-8.
fn segments(path: &Path) -> Option<Vec<&str>> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_str()),
            _ => None,
        })
        .collect()
}

/// Split `<root>/<project>/<session>.jsonl` into `(project, session)`.
fn split_transcript_path(path: &Path) -> Option<(&str, &str)> {
    let segments = segments(path)?;
    if segments.len() < 3 {
        return None;
    }
    let file = segments[segments.len() - 1];
    let project = segments[segments.len() - 2];
    let session = file.strip_suffix(TRANSCRIPT_EXTENSION)?;

    if session.is_empty() || project.is_empty() {
        return None;
    }
    Some((project, session))
}

/// Project name from a transcript path, or None for a malformed path.
pub fn extract_project_name(path: &Path) -> Option<String> {
    split_transcript_path(path).map(|(project, _)| project.to_string())
}

/// Session id (file stem) from a transcript path, or None for a malformed path.
pub fn extract_session_id(path: &Path) -> Option<String> {
    split_transcript_path(path).map(|(_, session)| session.to_string())
}

/// Render message content as display text.
pub fn render_content(content: &serde_json::Value) -> String {
    if let Some(text) = content.as_str() {
        return text.trim().to_string();
    }

    if let Some(arr) = content.as_array() {
        let mut parts = Vec::new();

        for block in arr {
            if let Some(block_type) = block.get("type").and_then(|t| t.as_str()) {
                match block_type {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.trim().to_string());
                        }
                    }
                    "tool_use" => {
                        if let Some(name) = block.get("name").and_then(|n| n.as_str()) {
                            parts.push(format!("[tool: {}]", name));
                        }
                    }
                    "tool_result" => {
                        let is_error = block
                            .get("is_error")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(false);
                        if is_error {
                            parts.push("[tool_error]".to_string());
                        } else {
                            parts.push("[tool_result]".to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        return parts.join("\n");
    }

    if content.is_null() {
        return String::new();
    }
    content.to_string()
}

/// Transcript file parser.
#[derive(Clone)]
pub struct LogParser {
    reader: Arc<dyn FileReader>,
}

impl LogParser {
    pub fn new(reader: Arc<dyn FileReader>) -> Self {
        Self { reader }
    }

    /// Read and parse a whole transcript.
    pub fn parse_file(&self, path: &Path) -> Result<ParsedLogFile, Error> {
        let (project_name, session_id) = split_transcript_path(path).ok_or_else(|| {
            Error::parser(format!(
                "{} is not a <root>/<project>/<session>.jsonl path",
                path.display()
            ))
        })?;

        let content = self
            .reader
            .read_file(path)
            .map_err(|e| Error::ParserRead {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;

        let parsed = parse_json_bytes(&content);

        if parsed.skipped > 0 {
            warn!(
                path = %path.display(),
                skipped = parsed.skipped,
                valid = parsed.entries.len(),
                "Skipped invalid log lines"
            );
        }

        if parsed.non_blank > 0 && parsed.entries.is_empty() {
            return Err(Error::parser(format!(
                "{}: none of {} lines are valid entries",
                path.display(),
                parsed.non_blank
            )));
        }

        Ok(ParsedLogFile {
            file_path: path.to_path_buf(),
            project_name: project_name.to_string(),
            session_id: session_id.to_string(),
            entries: parsed.entries,
            skipped: parsed.skipped,
            line_count: parsed.line_count,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    /// A valid transcript line for tests.
    pub(crate) fn entry_line(kind: &str, uuid: &str, ts: &str) -> String {
        let message = match kind {
            "user" | "assistant" => {
                format!(r#","message":{{"role":"{kind}","content":"{kind} says {uuid}"}}"#)
            }
            _ => String::new(),
        };
        format!(
            r#"{{"type":"{kind}","uuid":"{uuid}","sessionId":"abc123","timestamp":"{ts}","cwd":"/home/dev/myproj"{message}}}"#
        )
    }

    #[test]
    fn test_parse_user_entry() {
        let line = r#"{"parentUuid":null,"isSidechain":false,"userType":"external","cwd":"/home/test","sessionId":"test-session","version":"2.0.71","gitBranch":"main","type":"user","message":{"role":"user","content":"hello world"},"uuid":"test-uuid","timestamp":"2026-01-06T17:07:10.675Z"}"#;

        let entry = parse_line(line).unwrap();
        assert_eq!(entry.kind, EntryKind::User);
        assert_eq!(entry.session_id, "test-session");
        assert_eq!(entry.git_branch.as_deref(), Some("main"));
        assert_eq!(entry.message.as_ref().unwrap().role, "user");
        assert_eq!(entry.natural_key(), "test-uuid");
        // Unknown fields are preserved
        assert_eq!(entry.extra.get("version").unwrap(), "2.0.71");
    }

    #[test]
    fn test_rejects_unknown_type_and_missing_message() {
        let summary = r#"{"type":"summary","sessionId":"s","timestamp":"2026-01-06T17:07:10Z"}"#;
        assert!(parse_line(summary).is_err());

        let bare_user = r#"{"type":"user","sessionId":"s","timestamp":"2026-01-06T17:07:10Z"}"#;
        assert!(parse_line(bare_user).is_err());

        let bad_ts = r#"{"type":"system","sessionId":"s","timestamp":"yesterday"}"#;
        assert!(parse_line(bad_ts).is_err());
    }

    #[test]
    fn test_nine_valid_one_malformed() {
        let mut content = String::new();
        for i in 0..9 {
            content.push_str(&entry_line(
                "user",
                &format!("u-{i}"),
                &format!("2026-01-06T17:07:1{i}Z"),
            ));
            content.push('\n');
            if i == 4 {
                content.push_str("{not json\n");
            }
        }

        let parsed = parse_json_lines(&content);
        assert_eq!(parsed.entries.len(), 9);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.line_count, 10);
        assert_eq!(parsed.entries[5].line, 6);
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let content = format!(
            "\n{}\n   \n",
            entry_line("system", "s-1", "2026-01-06T17:07:10Z")
        );
        let parsed = parse_json_lines(&content);

        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].line, 1);
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.line_count, 3);
    }

    #[test]
    fn test_incomplete_trailing_line_is_deferred() {
        let first = entry_line("user", "u-1", "2026-01-06T17:07:10Z");
        let second = entry_line("assistant", "a-1", "2026-01-06T17:07:11Z");
        let partial = format!("{first}\n{}", &second[..second.len() / 2]);

        let parsed = parse_json_lines(&partial);
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.line_count, 1);

        // A complete but unterminated last line is consumed.
        let whole = format!("{first}\n{second}");
        let parsed = parse_json_lines(&whole);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.line_count, 2);
    }

    #[test]
    fn test_natural_key_falls_back_to_checksum() {
        let line = r#"{"type":"result","sessionId":"s","timestamp":"2026-01-06T17:07:10Z"}"#;
        let parsed = parse_json_lines(line);
        let key = parsed.entries[0].natural_key();

        assert!(key.starts_with("sha256:"));
        assert_eq!(key, parse_json_lines(line).entries[0].natural_key());
    }

    #[test]
    fn test_path_derivation() {
        let path = Path::new("/root/myproj/abc123.jsonl");
        assert_eq!(extract_project_name(path).as_deref(), Some("myproj"));
        assert_eq!(extract_session_id(path).as_deref(), Some("abc123"));

        for bad in [
            "/root/myproj/abc123.json",
            "/root/myproj/",
            "/myproj/abc123.jsonl",
            "abc123.jsonl",
            "/root/myproj/.jsonl",
        ] {
            let bad = Path::new(bad);
            assert_eq!(extract_project_name(bad), None, "{}", bad.display());
            assert_eq!(extract_session_id(bad), None, "{}", bad.display());
        }
    }

    #[test]
    fn test_parse_file_rejects_bad_path() {
        let fs = Arc::new(MemoryFs::new());
        fs.write("/root/myproj/notes.txt", "hello\n");
        let parser = LogParser::new(fs);

        let err = parser
            .parse_file(Path::new("/root/myproj/notes.txt"))
            .unwrap_err();
        assert_eq!(err.code().as_str(), "PARSER_ERROR");
    }

    #[test]
    fn test_parse_file_read_failure_is_parser_error() {
        let parser = LogParser::new(Arc::new(MemoryFs::new()));
        let err = parser
            .parse_file(Path::new("/root/myproj/missing.jsonl"))
            .unwrap_err();
        assert_eq!(err.code().as_str(), "PARSER_ERROR");
        assert!(err.to_string().contains("cannot read"));

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("missing.jsonl"));
        let io = std::error::Error::source(source)
            .and_then(|e| e.downcast_ref::<std::io::Error>())
            .unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_non_utf8_line_is_skipped() {
        let first = entry_line("user", "u-1", "2026-01-06T17:07:10Z");
        let second = entry_line("assistant", "a-1", "2026-01-06T17:07:11Z");
        let mut content = format!("{first}\n").into_bytes();
        content.extend_from_slice(b"{\"type\":\"user\",\"text\":\"\xff\"}\n");
        content.extend_from_slice(format!("{second}\n").as_bytes());

        let parsed = parse_json_bytes(&content);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.line_count, 3);
        assert_eq!(parsed.entries[1].line, 2);

        // Half of a multi-byte character at the end waits for the rest.
        let mut cut = format!("{first}\n").into_bytes();
        cut.extend_from_slice(&"é".as_bytes()[..1]);
        let parsed = parse_json_bytes(&cut);
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.line_count, 1);
    }

    #[test]
    fn test_parse_local_file_with_invalid_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("myproj");
        std::fs::create_dir(&project).unwrap();
        let path = project.join("abc123.jsonl");
        let mut content = format!("{}\n", entry_line("user", "u-1", "2026-01-06T17:07:10Z"))
            .into_bytes();
        content.extend_from_slice(b"\xff\xfe garbage\n");
        content.extend_from_slice(
            format!("{}\n", entry_line("assistant", "a-1", "2026-01-06T17:07:11Z")).as_bytes(),
        );
        std::fs::write(&path, content).unwrap();

        let parsed = LogParser::new(Arc::new(crate::fs::LocalFs))
            .parse_file(&path)
            .unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.line_count, 3);
    }

    #[test]
    fn test_parse_file_all_invalid_fails() {
        let fs = Arc::new(MemoryFs::new());
        fs.write("/root/myproj/abc123.jsonl", "{bad\nnot json\n");
        let parser = LogParser::new(fs.clone());

        assert!(parser
            .parse_file(Path::new("/root/myproj/abc123.jsonl"))
            .is_err());

        fs.write("/root/myproj/empty.jsonl", "\n\n");
        let parsed = parser
            .parse_file(Path::new("/root/myproj/empty.jsonl"))
            .unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.session_id, "empty");
    }

    #[test]
    fn test_render_content_blocks() {
        let content = serde_json::json!([
            {"type": "text", "text": "Running tests "},
            {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
            {"type": "tool_result", "tool_use_id": "t1", "content": "boom", "is_error": true}
        ]);
        assert_eq!(
            render_content(&content),
            "Running tests\n[tool: Bash]\n[tool_error]"
        );
        assert_eq!(render_content(&serde_json::json!("hi ")), "hi");
    }
}
