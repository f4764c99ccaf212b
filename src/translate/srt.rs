//! Minimal SRT reader and writer.

use crate::store::CaptionCue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleEntry {
    pub index: usize,
    pub start: String,
    pub end: String,
    pub text: String,
}

enum ParseState {
    Index,
    Timecode,
    Text,
}

/// Parses SRT content. Malformed blocks are skipped, a missing index line is
/// tolerated, and entries without text are dropped.
pub fn parse(content: &str) -> Vec<SubtitleEntry> {
    let mut entries = Vec::new();
    let mut state = ParseState::Index;
    let mut index = 0;
    let mut start = String::new();
    let mut end = String::new();
    let mut text: Vec<&str> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        match state {
            ParseState::Index => {
                if line.is_empty() {
                    continue;
                }
                if let Ok(n) = line.parse::<usize>() {
                    index = n;
                    state = ParseState::Timecode;
                } else if let Some((s, e)) = split_timecode(line) {
                    index += 1;
                    start = s;
                    end = e;
                    state = ParseState::Text;
                }
            }
            ParseState::Timecode => match split_timecode(line) {
                Some((s, e)) => {
                    start = s;
                    end = e;
                    state = ParseState::Text;
                }
                None => state = ParseState::Index,
            },
            ParseState::Text => {
                if line.is_empty() {
                    flush(&mut entries, index, &start, &end, &mut text);
                    state = ParseState::Index;
                } else {
                    text.push(line);
                }
            }
        }
    }
    if matches!(state, ParseState::Text) {
        flush(&mut entries, index, &start, &end, &mut text);
    }
    entries
}

fn flush(
    entries: &mut Vec<SubtitleEntry>,
    index: usize,
    start: &str,
    end: &str,
    text: &mut Vec<&str>,
) {
    if !text.is_empty() {
        entries.push(SubtitleEntry {
            index,
            start: start.to_string(),
            end: end.to_string(),
            text: text.join("\n"),
        });
    }
    text.clear();
}

fn split_timecode(line: &str) -> Option<(String, String)> {
    let (start, end) = line.split_once("-->")?;
    Some((start.trim().to_string(), end.trim().to_string()))
}

/// Renders entries as SRT, renumbering from 1.
pub fn render(entries: &[SubtitleEntry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            entry.start,
            entry.end,
            entry.text
        ));
    }
    out
}

/// Seconds to `HH:MM:SS,mmm`. Negative input clamps to zero.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        ms
    )
}

/// Builds SRT entries from cues captured at submission. Blank cues are dropped.
pub fn entries_from_cues(cues: &[CaptionCue]) -> Vec<SubtitleEntry> {
    cues.iter()
        .filter(|cue| !cue.text.trim().is_empty())
        .enumerate()
        .map(|(i, cue)| SubtitleEntry {
            index: i + 1,
            start: format_timestamp(cue.offset),
            end: format_timestamp(cue.offset + cue.duration),
            text: cue.text.trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:02,500\nHello there\n\n2\n00:00:03,000 --> 00:00:05,000\nTwo\nlines\n\n3\n00:00:06,000 --> 00:00:07,000\nLast";

    #[test]
    fn parses_multiline_entries_and_trailing_block() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].start, "00:00:01,000");
        assert_eq!(entries[0].end, "00:00:02,500");
        assert_eq!(entries[1].text, "Two\nlines");
        assert_eq!(entries[2].text, "Last");
    }

    #[test]
    fn tolerates_crlf_and_missing_index() {
        let content = "\u{feff}00:00:01,000 --> 00:00:02,000\r\nNo index\r\n\r\n5\r\n00:00:03,000 --> 00:00:04,000\r\nFive\r\n";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].text, "No index");
        assert_eq!(entries[1].index, 5);
    }

    #[test]
    fn skips_block_with_bad_timecode() {
        let content = "1\nnot a timecode\nstray\n\n2\n00:00:01,000 --> 00:00:02,000\nKept\n";
        let entries = parse(content);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Kept");
    }

    #[test]
    fn render_renumbers_sequentially() {
        let mut entries = parse(SAMPLE);
        entries.remove(0);
        let out = render(&entries);
        assert!(out.starts_with("1\n00:00:03,000 --> 00:00:05,000\nTwo\nlines\n\n2\n"));
        assert_eq!(parse(&out).len(), 2);
    }

    #[test]
    fn formats_timestamps() {
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_timestamp(61.5), "00:01:01,500");
        assert_eq!(format_timestamp(3723.004), "01:02:03,004");
        assert_eq!(format_timestamp(-3.0), "00:00:00,000");
    }

    #[test]
    fn cues_become_entries() {
        let cues = vec![
            CaptionCue {
                text: " hi ".into(),
                offset: 1.0,
                duration: 1.5,
                lang: "en".into(),
            },
            CaptionCue {
                text: "   ".into(),
                offset: 3.0,
                duration: 1.0,
                lang: "en".into(),
            },
            CaptionCue {
                text: "bye".into(),
                offset: 4.0,
                duration: 0.25,
                lang: "en".into(),
            },
        ];
        let entries = entries_from_cues(&cues);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "hi");
        assert_eq!(entries[0].end, "00:00:02,500");
        assert_eq!(entries[1].index, 2);
        assert_eq!(entries[1].start, "00:00:04,000");
    }
}
