//! Agent stdout progress parsing.
//!
//! Agents report progress through well-known stdout markers. The mapping from
//! marker to (phase, percent) is a fixed table per agent kind; the parser is
//! line-based, strips ANSI control sequences, and tolerates stderr noise
//! interleaved with real markers.

use crate::types::{AgentKind, ExecutionProgress};

/// Maximum length of the message carried on a progress event.
pub const MAX_MESSAGE_CHARS: usize = 200;

/// One marker row: substring to look for, phase tag, percent.
struct Marker {
    token: &'static str,
    phase: &'static str,
    percent: u8,
}

const SPEC_MARKERS: &[Marker] = &[
    Marker { token: "CONTEXT GATHERING", phase: "context", percent: 25 },
    Marker { token: "PROJECT ANALYSIS", phase: "analysis", percent: 50 },
    Marker { token: "PROJECT INDEX", phase: "indexing", percent: 75 },
];

const IMPLEMENTATION_MARKERS: &[Marker] = &[
    Marker { token: "CONTEXT GATHERING", phase: "context", percent: 10 },
];

const QA_MARKERS: &[Marker] = &[
    Marker { token: "CONTEXT GATHERING", phase: "context", percent: 20 },
];

const ROADMAP_MARKERS: &[Marker] = &[
    Marker { token: "PROJECT INDEX", phase: "indexing", percent: 10 },
    Marker { token: "PROJECT ANALYSIS", phase: "analysis", percent: 30 },
    Marker { token: "CONTEXT GATHERING", phase: "context", percent: 50 },
    Marker { token: "FEATURE GENERATION", phase: "generation", percent: 75 },
    Marker { token: "ROADMAP GENERATED", phase: "complete", percent: 100 },
];

const IDEATION_MARKERS: &[Marker] = &[
    Marker { token: "PROJECT DISCOVERY", phase: "discovery", percent: 10 },
    Marker { token: "CONTEXT GATHERING", phase: "context", percent: 25 },
    Marker { token: "LOW_HANGING_FRUIT", phase: "low_hanging_fruit", percent: 40 },
    Marker { token: "UI_UX_IMPROVEMENTS", phase: "ui_ux", percent: 55 },
    Marker { token: "HIGH_VALUE_FEATURES", phase: "high_value", percent: 70 },
    Marker { token: "MERGING IDEAS", phase: "merging", percent: 85 },
    Marker { token: "FEATURE GENERATION", phase: "generation", percent: 90 },
    Marker { token: "IDEATION COMPLETE", phase: "complete", percent: 100 },
];

fn markers_for(kind: AgentKind) -> &'static [Marker] {
    match kind {
        AgentKind::SpecCreation => SPEC_MARKERS,
        AgentKind::Implementation => IMPLEMENTATION_MARKERS,
        AgentKind::Qa => QA_MARKERS,
        AgentKind::Roadmap => ROADMAP_MARKERS,
        AgentKind::Ideation => IDEATION_MARKERS,
        AgentKind::MergeResolver => &[],
    }
}

/// Parse one output line into a progress update, if it carries a marker.
pub fn parse_line(kind: AgentKind, line: &str) -> Option<ExecutionProgress> {
    let clean = strip_ansi(line);
    for marker in markers_for(kind) {
        if clean.contains(marker.token) {
            return Some(ExecutionProgress {
                phase: marker.phase.to_string(),
                percent: marker.percent,
                message: truncate_message(clean.trim()),
            });
        }
    }
    None
}

/// Progress from plan chunk completion: the coding phase spans the first half
/// of the task lifecycle, QA review the rest.
pub fn plan_progress(completed: usize, total: usize) -> ExecutionProgress {
    let percent = if total == 0 {
        0
    } else {
        ((completed * 50) / total) as u8
    };
    ExecutionProgress {
        phase: "coding".to_string(),
        percent,
        message: format!("{completed}/{total} chunks complete"),
    }
}

/// Remove ANSI escape sequences (CSI and OSC forms).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ ... final byte in @-~
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Two-character sequences (ESC c, ESC =, ...)
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roadmap_markers_map_to_percent() {
        let p = parse_line(AgentKind::Roadmap, "=== PROJECT ANALYSIS ===").unwrap();
        assert_eq!(p.phase, "analysis");
        assert_eq!(p.percent, 30);

        let p = parse_line(AgentKind::Roadmap, "ROADMAP GENERATED (14 features)").unwrap();
        assert_eq!(p.percent, 100);
    }

    #[test]
    fn ideation_walks_the_category_ladder() {
        let order = [
            ("PROJECT DISCOVERY", 10),
            ("LOW_HANGING_FRUIT", 40),
            ("UI_UX_IMPROVEMENTS", 55),
            ("HIGH_VALUE_FEATURES", 70),
            ("MERGING IDEAS", 85),
            ("IDEATION COMPLETE", 100),
        ];
        for (token, percent) in order {
            let p = parse_line(AgentKind::Ideation, token).unwrap();
            assert_eq!(p.percent, percent, "token {token}");
        }
    }

    #[test]
    fn unmarked_lines_yield_nothing() {
        assert!(parse_line(AgentKind::Roadmap, "reading files...").is_none());
        assert!(parse_line(AgentKind::MergeResolver, "PROJECT INDEX").is_none());
    }

    #[test]
    fn markers_survive_ansi_coloring() {
        let line = "\u{1b}[32mCONTEXT GATHERING\u{1b}[0m done";
        let p = parse_line(AgentKind::Ideation, line).unwrap();
        assert_eq!(p.phase, "context");
        assert_eq!(p.message, "CONTEXT GATHERING done");
    }

    #[test]
    fn strip_ansi_handles_osc_titles() {
        let line = "\u{1b}]0;window title\u{7}real output";
        assert_eq!(strip_ansi(line), "real output");
    }

    #[test]
    fn strip_ansi_passes_plain_text_through() {
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn messages_are_truncated_to_the_cap() {
        let long = format!("CONTEXT GATHERING {}", "x".repeat(400));
        let p = parse_line(AgentKind::Qa, &long).unwrap();
        assert_eq!(p.message.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn plan_progress_scales_to_half() {
        assert_eq!(plan_progress(0, 2).percent, 0);
        assert_eq!(plan_progress(1, 2).percent, 25);
        assert_eq!(plan_progress(1, 1).percent, 50);
        assert_eq!(plan_progress(1, 1).phase, "coding");
    }

    #[test]
    fn plan_progress_with_no_chunks_is_zero() {
        assert_eq!(plan_progress(0, 0).percent, 0);
    }
}
