//! Devplan markdown parsing (§4.2, §6).
//!
//! A task line matches `^[ ]*- \[ \] <text>$` (pending). Additional markers
//! observed in handoff files — `[✅]`/`[x]` (done), `[⏳]` (in_progress
//! externally), `[🔄]` (needs-review) — are recognised but, per the Open
//! Question in §9, ingestion only ever turns `Pending` lines into tasks.

use regex::Regex;
use std::sync::OnceLock;

use crate::store::types::ParsedTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMarker {
    Pending,
    Done,
    InProgressExternal,
    NeedsReview,
    Unknown,
}

impl TaskMarker {
    fn from_mark(mark: &str) -> Self {
        match mark {
            " " => TaskMarker::Pending,
            "x" | "X" | "✅" => TaskMarker::Done,
            "⏳" => TaskMarker::InProgressExternal,
            "🔄" => TaskMarker::NeedsReview,
            _ => TaskMarker::Unknown,
        }
    }
}

struct TaskLine {
    indent: usize,
    marker: TaskMarker,
    text: String,
    line_no: u32,
}

fn task_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<indent>\s*)-\s\[(?P<mark>.)\]\s(?P<text>.+)$").unwrap()
    })
}

fn parse_task_line(line: &str, line_no: u32) -> Option<TaskLine> {
    let re = task_line_regex();
    let caps = re.captures(line)?;
    let indent = caps.name("indent").map(|m| m.as_str().len()).unwrap_or(0);
    let mark = caps.name("mark").map(|m| m.as_str()).unwrap_or("");
    let text = caps.name("text").map(|m| m.as_str()).unwrap_or("").to_string();
    Some(TaskLine {
        indent,
        marker: TaskMarker::from_mark(mark),
        text,
        line_no,
    })
}

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

/// Parse a devplan's pending tasks, each with its sub-bullets folded into
/// `task_text` and `priority` defaulting to insertion order.
pub fn parse_pending_tasks(contents: &str) -> Vec<ParsedTask> {
    let lines: Vec<&str> = contents.lines().collect();
    let mut tasks = Vec::new();
    let mut priority = 0i64;
    let mut i = 0usize;

    while i < lines.len() {
        let line_no = (i + 1) as u32;
        if let Some(task_line) = parse_task_line(lines[i], line_no) {
            if task_line.marker == TaskMarker::Pending {
                let mut text = task_line.text.clone();
                let parent_indent = task_line.indent;
                let mut j = i + 1;
                while j < lines.len() {
                    let next = lines[j];
                    if next.trim().is_empty() {
                        j += 1;
                        continue;
                    }
                    let next_indent = indent_of(next);
                    if next_indent <= parent_indent {
                        break;
                    }
                    if parse_task_line(next, (j + 1) as u32).is_some() {
                        break;
                    }
                    text.push('\n');
                    text.push_str(next.trim());
                    j += 1;
                }
                tasks.push(ParsedTask {
                    text,
                    devplan_line: line_no,
                    priority,
                });
                priority += 1;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    tasks
}

/// Rewrite one line's checkbox marker in place, preserving indentation and
/// trailing content, and round-tripping the rest of the file byte-for-byte.
/// Used by the broader (out-of-scope) system's devplan annotation tooling;
/// the analyzer itself only ever reads pending lines.
pub fn set_marker(contents: &str, line_no: u32, new_mark: &str) -> Option<String> {
    let mut lines: Vec<String> = contents.lines().map(|s| s.to_string()).collect();
    let idx = line_no.checked_sub(1)? as usize;
    let target = lines.get(idx)?;
    let re = task_line_regex();
    let caps = re.captures(target)?;
    let indent = caps.name("indent")?.as_str();
    let text = caps.name("text")?.as_str();
    lines[idx] = format!("{indent}- [{new_mark}] {text}");

    let trailing_newline = contents.ends_with('\n');
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pending_task() {
        let tasks = parse_pending_tasks("# Plan\n- [ ] create README\n");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].text, "create README");
        assert_eq!(tasks[0].devplan_line, 2);
        assert_eq!(tasks[0].priority, 0);
    }

    #[test]
    fn ignores_non_pending_markers() {
        let tasks = parse_pending_tasks(
            "- [x] done already\n- [⏳] in progress elsewhere\n- [🔄] needs review\n- [ ] actually pending\n",
        );
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].text, "actually pending");
    }

    #[test]
    fn folds_sub_bullets_into_task_text() {
        let contents = "- [ ] parent task\n  - sub point one\n  - sub point two\n- [ ] next task\n";
        let tasks = parse_pending_tasks(contents);
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].text.contains("parent task"));
        assert!(tasks[0].text.contains("sub point one"));
        assert!(tasks[0].text.contains("sub point two"));
        assert_eq!(tasks[1].text, "next task");
    }

    #[test]
    fn priorities_are_insertion_order() {
        let tasks = parse_pending_tasks("- [ ] a\n- [ ] b\n- [ ] c\n");
        assert_eq!(tasks.iter().map(|t| t.priority).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn set_marker_round_trips_rest_of_file() {
        let contents = "# Plan\n- [ ] one\n- [ ] two\n";
        let updated = set_marker(contents, 2, "x").unwrap();
        assert_eq!(updated, "# Plan\n- [x] one\n- [ ] two\n");
    }

    #[test]
    fn set_marker_preserves_indentation() {
        let contents = "  - [ ] indented task\n";
        let updated = set_marker(contents, 1, "✅").unwrap();
        assert_eq!(updated, "  - [✅] indented task\n");
    }
}
