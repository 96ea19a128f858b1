//! Streaming JSON extraction from agent stdout
//!
//! The agent interleaves prose with JSON objects that may be pretty-printed
//! across lines, concatenated on one line, or split across read boundaries.
//! The extractor keeps a buffer of unconsumed bytes and scans for balanced
//! top-level objects, tracking string and escape state so braces inside
//! string literals never confuse the balance.

use tracing::warn;

/// Buffer ceiling before the trim policy kicks in.
const BUFFER_LIMIT: usize = 50 * 1024;

/// One extraction result: either a parsed JSON object or raw interleaved
/// text to forward verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Json(serde_json::Value),
    Raw(String),
}

/// Incremental bracket-matching JSON extractor.
///
/// One instance per agent process; the buffer is never shared across
/// sessions.
#[derive(Debug, Default)]
pub struct JsonStreamParser {
    buf: String,
}

impl JsonStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout; returns everything extractable so far.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamChunk> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let Some(start) = self.buf.find('{') else {
                // No object start anywhere: whole buffer is prose.
                if !self.buf.is_empty() {
                    let text = std::mem::take(&mut self.buf);
                    push_raw(&mut out, text);
                }
                break;
            };

            match balanced_end(&self.buf[start..]) {
                Some(len) => {
                    if start > 0 {
                        push_raw(&mut out, self.buf[..start].to_string());
                    }
                    let candidate = self.buf[start..start + len].to_string();
                    self.buf.drain(..start + len);
                    match serde_json::from_str::<serde_json::Value>(&candidate) {
                        Ok(value) => out.push(StreamChunk::Json(value)),
                        Err(e) => {
                            // Balanced but unparseable; drop the slice and
                            // keep scanning.
                            warn!(error = %e, len = candidate.len(), "discarding unparseable JSON slice");
                        }
                    }
                }
                None => {
                    // Incomplete object: emit preceding prose, retain the
                    // suffix starting at `{` for the next read.
                    if start > 0 {
                        let text: String = self.buf.drain(..start).collect();
                        push_raw(&mut out, text);
                    }
                    self.enforce_limit();
                    break;
                }
            }
        }

        out
    }

    /// Flush any trailing prose at end of stream. An unterminated object is
    /// discarded with a warning.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let text = std::mem::take(&mut self.buf);
            if text.contains('{') {
                warn!(len = text.len(), "discarding unterminated JSON at end of stream");
            } else {
                push_raw(&mut out, text);
            }
        }
        out
    }

    fn enforce_limit(&mut self) {
        if self.buf.len() <= BUFFER_LIMIT {
            return;
        }
        // Trim to the last `{` so a fresh object can still complete.
        match self.buf.rfind('{') {
            Some(pos) if pos > 0 => {
                warn!(dropped = pos, "stream buffer over limit; trimming to last object start");
                self.buf.drain(..pos);
            }
            Some(_) => {
                // Buffer is one giant unterminated object.
                warn!(len = self.buf.len(), "stream buffer over limit with no restart point; clearing");
                self.buf.clear();
            }
            None => {
                warn!(len = self.buf.len(), "stream buffer over limit; clearing");
                self.buf.clear();
            }
        }
    }
}

fn push_raw(out: &mut Vec<StreamChunk>, text: String) {
    if !text.trim().is_empty() {
        out.push(StreamChunk::Raw(text));
    }
}

/// Length of the balanced `{...}` slice at the start of `s`, if complete.
fn balanced_end(s: &str) -> Option<usize> {
    debug_assert!(s.starts_with('{'));
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jsons(chunks: &[StreamChunk]) -> Vec<serde_json::Value> {
        chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Json(v) => Some(v.clone()),
                StreamChunk::Raw(_) => None,
            })
            .collect()
    }

    #[test]
    fn single_object_on_one_line() {
        let mut p = JsonStreamParser::new();
        let out = p.push("{\"type\":\"system\"}\n");
        assert_eq!(jsons(&out), vec![json!({"type": "system"})]);
    }

    #[test]
    fn prose_then_multiline_then_compact() {
        let mut p = JsonStreamParser::new();
        let out = p.push(
            "prose\n{\n  \"type\": \"system\",\n  \"session_id\": \"T-1\"\n}\n{\"type\":\"usage\",\"prompt\":10,\"completion\":5,\"total\":15}\n",
        );
        assert_eq!(out[0], StreamChunk::Raw("prose\n".into()));
        assert_eq!(
            jsons(&out),
            vec![
                json!({"type": "system", "session_id": "T-1"}),
                json!({"type": "usage", "prompt": 10, "completion": 5, "total": 15}),
            ]
        );
    }

    #[test]
    fn multiple_objects_concatenated_on_one_line() {
        let mut p = JsonStreamParser::new();
        let out = p.push(r#"{"a":1}{"b":2}{"c":3}"#);
        assert_eq!(jsons(&out), vec![json!({"a":1}), json!({"b":2}), json!({"c":3})]);
    }

    #[test]
    fn object_split_across_reads() {
        let mut p = JsonStreamParser::new();
        assert!(jsons(&p.push("{\"type\":\"assi")).is_empty());
        assert!(jsons(&p.push("stant\",\"text\":\"he")).is_empty());
        let out = p.push("llo\"}");
        assert_eq!(
            jsons(&out),
            vec![json!({"type": "assistant", "text": "hello"})]
        );
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_balance() {
        let mut p = JsonStreamParser::new();
        let out = p.push(r#"{"text":"a { b } c \" d"}"#);
        assert_eq!(jsons(&out), vec![json!({"text": "a { b } c \" d"})]);
    }

    #[test]
    fn escaped_backslash_before_quote() {
        let mut p = JsonStreamParser::new();
        let out = p.push(r#"{"path":"C:\\"}{"next":1}"#);
        assert_eq!(jsons(&out), vec![json!({"path": "C:\\"}), json!({"next": 1})]);
    }

    #[test]
    fn unparseable_balanced_slice_is_discarded() {
        let mut p = JsonStreamParser::new();
        let out = p.push("{not json}{\"ok\":true}");
        assert_eq!(jsons(&out), vec![json!({"ok": true})]);
    }

    #[test]
    fn interleaved_prose_is_forwarded_raw() {
        let mut p = JsonStreamParser::new();
        let out = p.push("warning: something\n{\"a\":1}\ntrailing log\n");
        let raws: Vec<&str> = out
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Raw(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(raws, vec!["warning: something\n", "\ntrailing log\n"]);
    }

    #[test]
    fn byte_at_a_time_feed() {
        let payload = r#"{"type":"tool_use","id":"t1","name":"edit_file","input":{"path":"x"}}"#;
        let mut p = JsonStreamParser::new();
        let mut got = Vec::new();
        for c in payload.chars() {
            got.extend(jsons(&p.push(&c.to_string())));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["name"], "edit_file");
    }

    #[test]
    fn oversized_garbage_is_trimmed_to_last_object_start() {
        let mut p = JsonStreamParser::new();
        // An unterminated object followed by mountains of padding, then a
        // fresh object start that eventually completes.
        let mut garbage = String::from("{\"unterminated\": \"");
        garbage.push_str(&"x".repeat(BUFFER_LIMIT));
        p.push(&garbage);
        // Close the string but never the object; then start a new object.
        let out = p.push("\", \"pad\": ");
        assert!(jsons(&out).is_empty());
        let out = p.push("{\"fresh\": true}");
        assert_eq!(jsons(&out), vec![json!({"fresh": true})]);
    }

    #[test]
    fn finish_flushes_trailing_prose() {
        let mut p = JsonStreamParser::new();
        p.push("{\"a\":1}\nbye");
        let out = p.finish();
        assert_eq!(out, vec![StreamChunk::Raw("bye".into())]);
    }
}
