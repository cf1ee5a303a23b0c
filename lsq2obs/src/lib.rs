//! Logseq → Obsidian conversion library.
//! Conversion passes are pure text-to-text functions; block references are resolved
//! against a vault at read time and rendered by two front ends (static output and live editing).

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Block identifier in its canonical 36-char lowercase hyphenated shape.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockId(pub Uuid);

    impl BlockId {
        pub const LEN: usize = 36;

        /// Parse the canonical shape only; uppercase or braced forms are rejected.
        pub fn parse(s: &str) -> Result<Self, DomainError> {
            match crate::syntax::block_id(s) {
                Ok(("", id)) => Ok(id),
                _ => Err(DomainError::InvalidBlockId(s.to_string())),
            }
        }

        pub(crate) fn from_canonical(s: &str) -> Result<Self, uuid::Error> {
            Uuid::parse_str(s).map(Self)
        }

        /// `((<id>))`, the inline reference token for this block.
        pub fn token(&self) -> String {
            format!("(({}))", self)
        }
    }

    impl fmt::Display for BlockId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0.hyphenated())
        }
    }

    impl FromStr for BlockId {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::parse(s)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("`{0}` is not a canonical block id")]
        InvalidBlockId(String),
        #[error("`{0}` is not a HH:MM:SS duration")]
        MalformedDuration(String),
    }

}

pub mod syntax {
    //! Line- and token-level recognizers for the outliner dialect.
    //!
    //! Every function here is pure: it takes a line (or a text) and returns what it found,
    //! with no cursor state carried between calls.

    use crate::core::BlockId;
    use nom::{
        IResult,
        bytes::complete::{tag, take_until, take_while_m_n},
        character::complete::{char, space0},
        combinator::{map_res, recognize},
        error::VerboseError,
        sequence::{delimited, tuple},
    };
    use std::ops::Range;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Marker text of the property form (`id:: <id>`).
    pub const PROPERTY_MARKER: &str = "id::";

    /* ------------------------------ Identifiers ------------------------------ */

    fn is_lower_hex(c: char) -> bool {
        c.is_ascii_digit() || ('a'..='f').contains(&c)
    }

    fn hex_group<'a>(n: usize) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i| take_while_m_n(n, n, is_lower_hex)(i)
    }

    /// `8-4-4-4-12` lowercase hex digit groups.
    pub fn block_id(i: &str) -> PResult<'_, BlockId> {
        map_res(
            recognize(tuple((
                hex_group(8),
                char('-'),
                hex_group(4),
                char('-'),
                hex_group(4),
                char('-'),
                hex_group(4),
                char('-'),
                hex_group(12),
            ))),
            BlockId::from_canonical,
        )(i)
    }

    /// Property form: a line holding only `id:: <id>`.
    pub fn property_id(line: &str) -> Option<BlockId> {
        let rest = line.trim_start().strip_prefix(PROPERTY_MARKER)?;
        let (tail, id) = block_id(rest.trim_start()).ok()?;
        tail.trim().is_empty().then_some(id)
    }

    /// Anchor form: `<content> ^<id>` at the end of a line.
    ///
    /// Returns the content with trailing whitespace removed (possibly empty when the content
    /// was whitespace only) and the last identifier on the line.
    pub fn anchor(line: &str) -> Option<(&str, BlockId)> {
        let trimmed = line.trim_end();
        let split = trimmed.len().checked_sub(BlockId::LEN)?;
        let id = BlockId::parse(trimmed.get(split..)?).ok()?;
        let before = trimmed[..split].strip_suffix('^')?;
        if before.is_empty() {
            return None;
        }
        Some((before.trim_end(), id))
    }

    /* ---------------------------- Reference tokens ---------------------------- */

    /// One `((<id>))` occurrence; `range` is a byte range into the scanned text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RefToken {
        pub range: Range<usize>,
        pub id: BlockId,
    }

    fn reference_token(i: &str) -> PResult<'_, BlockId> {
        delimited(tag("(("), block_id, tag("))"))(i)
    }

    /// Find every reference token, leftmost first and without overlap.
    pub fn reference_tokens(text: &str) -> Vec<RefToken> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(offset) = text[pos..].find("((") {
            let start = pos + offset;
            match reference_token(&text[start..]) {
                Ok((rest, id)) => {
                    let end = text.len() - rest.len();
                    out.push(RefToken {
                        range: start..end,
                        id,
                    });
                    pos = end;
                }
                // `(((id)))` still matches one byte later.
                Err(_) => pos = start + 1,
            }
        }
        out
    }

    /* ------------------------------- Logbooks ------------------------------- */

    pub(crate) fn split_indent(line: &str) -> (&str, &str) {
        let body = line.trim_start_matches([' ', '\t']);
        (&line[..line.len() - body.len()], body)
    }

    /// `<indent>- DONE <text>`; returns the indentation and the raw task text.
    pub fn done_task(line: &str) -> Option<(&str, &str)> {
        let (indent, body) = split_indent(line);
        let text = body.strip_prefix("- DONE ")?;
        (!text.is_empty()).then_some((indent, text))
    }

    pub fn logbook_open(line: &str) -> bool {
        split_indent(line)
            .1
            .strip_prefix(":LOGBOOK:")
            .is_some_and(|rest| rest.trim().is_empty())
    }

    /// `:END:` line; returns whatever follows the marker on that line.
    pub fn logbook_close(line: &str) -> Option<&str> {
        split_indent(line).1.strip_prefix(":END:")
    }

    /// A parsed `CLOCK: [start]--[end] => HH:MM:SS` line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClockEntry {
        pub start: String,
        pub end: String,
        pub duration: String,
    }

    fn two_digits(i: &str) -> PResult<'_, &str> {
        take_while_m_n(2, 2, |c: char| c.is_ascii_digit())(i)
    }

    fn clock_duration(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            two_digits,
            char(':'),
            two_digits,
            char(':'),
            two_digits,
        )))(i)
    }

    fn parse_clock_line(i: &str) -> PResult<'_, ClockEntry> {
        let (i, _) = space0(i)?;
        let (i, _) = tag("CLOCK: [")(i)?;
        let (i, start) = take_until("]--[")(i)?;
        let (i, _) = tag("]--[")(i)?;
        let (i, end) = take_until("] =>")(i)?;
        let (i, _) = tag("] =>")(i)?;
        let (i, _) = space0(i)?;
        let (i, duration) = clock_duration(i)?;
        Ok((
            i,
            ClockEntry {
                start: start.to_string(),
                end: end.to_string(),
                duration: duration.to_string(),
            },
        ))
    }

    pub fn clock_line(line: &str) -> Option<ClockEntry> {
        match parse_clock_line(line) {
            Ok((rest, entry)) if rest.trim().is_empty() => Some(entry),
            _ => None,
        }
    }

}

pub mod duration {
    use crate::core::DomainError;

    /// `HH:MM:SS` → seconds. Malformed input is rejected rather than summed.
    pub fn time_to_seconds(text: &str) -> Result<u64, DomainError> {
        let malformed = || DomainError::MalformedDuration(text.to_string());
        let field = |f: &str| {
            if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            f.parse::<u64>().ok()
        };
        let fields: Vec<&str> = text.trim().split(':').collect();
        let [h, m, s] = fields.as_slice() else {
            return Err(malformed());
        };
        match (field(h), field(m), field(s)) {
            (Some(h), Some(m), Some(s)) => Ok(h * 3600 + m * 60 + s),
            _ => Err(malformed()),
        }
    }

    /// Coarse label for a duration: seconds below a minute, then whole minutes, then whole hours.
    pub fn format_duration(seconds: u64) -> String {
        if seconds < 60 {
            format!("{}秒", seconds)
        } else if seconds < 3600 {
            format!("{}分钟", seconds / 60)
        } else {
            format!("{}小时", seconds / 3600)
        }
    }

}

pub mod logbook {
    //! Collapses completed tasks that carry a clocked `:LOGBOOK:` drawer into a single line
    //! annotated with the total logged time.

    use crate::core::DomainError;
    use crate::duration::{format_duration, time_to_seconds};
    use crate::syntax::{self, ClockEntry};
    use log::{debug, warn};
    use std::ops::RangeInclusive;

    /// A `- DONE` line together with the drawer that follows it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LogbookBlock<'a> {
        pub indent: &'a str,
        pub task: &'a str,
        pub clocks: Vec<ClockEntry>,
        /// Text following `:END:` on its line.
        pub trailing: &'a str,
        /// Line indices covered by the task and its drawer.
        pub lines: RangeInclusive<usize>,
    }

    impl LogbookBlock<'_> {
        pub fn total_seconds(&self) -> Result<u64, DomainError> {
            self.clocks
                .iter()
                .map(|clock| time_to_seconds(&clock.duration))
                .sum()
        }

        pub fn collapsed(&self) -> Result<String, DomainError> {
            let total = self.total_seconds()?;
            Ok(format!(
                "{}- DONE {} {}{}",
                self.indent,
                self.task.trim(),
                format_duration(total),
                self.trailing
            ))
        }
    }

    fn next_content_line(lines: &[&str], from: usize) -> Option<usize> {
        (from..lines.len()).find(|&i| !lines[i].trim().is_empty())
    }

    /// Match a task + drawer starting at `start`. Blank lines may separate the parts.
    pub fn match_block<'a>(lines: &[&'a str], start: usize) -> Option<LogbookBlock<'a>> {
        let (indent, task) = syntax::done_task(lines.get(start)?)?;
        let mut i = next_content_line(lines, start + 1)?;
        if !syntax::logbook_open(lines[i]) {
            return None;
        }
        i = next_content_line(lines, i + 1)?;
        let mut clocks = Vec::new();
        while let Some(entry) = syntax::clock_line(lines[i]) {
            clocks.push(entry);
            i = next_content_line(lines, i + 1)?;
        }
        if clocks.is_empty() {
            return None;
        }
        let trailing = syntax::logbook_close(lines[i])?;
        Some(LogbookBlock {
            indent,
            task,
            clocks,
            trailing,
            lines: start..=i,
        })
    }

    pub fn collapse_logbooks(content: &str) -> String {
        let lines: Vec<&str> = content.split('\n').collect();
        let mut out: Vec<String> = Vec::with_capacity(lines.len());
        let mut i = 0;
        while i < lines.len() {
            if let Some(block) = match_block(&lines, i) {
                match block.collapsed() {
                    Ok(line) => {
                        debug!(
                            "collapsed logbook at line {} ({} clock entries)",
                            i + 1,
                            block.clocks.len()
                        );
                        out.push(line);
                        i = *block.lines.end() + 1;
                        continue;
                    }
                    Err(err) => warn!("leaving logbook at line {} untouched: {err}", i + 1),
                }
            }
            out.push(lines[i].to_string());
            i += 1;
        }
        out.join("\n")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn sums_clock_entries() {
            let input = "- DONE Task\n:LOGBOOK:\nCLOCK: [2024-01-01]--[2024-01-01] => 00:01:30\nCLOCK: [2024-01-01]--[2024-01-01] => 00:00:45\n:END:";
            assert_eq!(collapse_logbooks(input), "- DONE Task 2分钟");
        }

        #[test]
        fn keeps_task_indent_and_surrounding_lines() {
            let input = "# Log\n\t- DONE Write report   \n\t  :LOGBOOK:\n\t  CLOCK: [2024-01-01 Mon 09:00:00]--[2024-01-01 Mon 10:30:00] =>  01:30:00\n\t  :END:\n- next";
            assert_eq!(
                collapse_logbooks(input),
                "# Log\n\t- DONE Write report 1小时\n- next"
            );
        }

        #[test]
        fn tolerates_blank_lines_inside_the_drawer() {
            let input = "- DONE A\n\n  :LOGBOOK:\n  CLOCK: [a]--[b] =>  00:00:20\n\n  CLOCK: [c]--[d] =>  00:00:15\n  :END:";
            assert_eq!(collapse_logbooks(input), "- DONE A 35秒");
        }

        #[test]
        fn drawer_without_clocks_is_left_alone() {
            let input = "- DONE Task\n:LOGBOOK:\n:END:";
            assert_eq!(collapse_logbooks(input), input);
        }

        #[test]
        fn malformed_durations_do_not_match() {
            let input = "- DONE Task\n:LOGBOOK:\nCLOCK: [a]--[b] => 00:xx:30\n:END:";
            assert_eq!(collapse_logbooks(input), input);
        }

        #[test]
        fn open_tasks_are_not_collapsed() {
            let input = "- TODO Task\n:LOGBOOK:\nCLOCK: [a]--[b] => 00:01:00\n:END:";
            assert_eq!(collapse_logbooks(input), input);
        }

        #[test]
        fn each_task_collapses_independently() {
            let input = "- DONE A\n:LOGBOOK:\nCLOCK: [a]--[b] => 00:00:10\n:END:\n- DONE B\n:LOGBOOK:\nCLOCK: [a]--[b] => 02:00:00\n:END:\n";
            assert_eq!(collapse_logbooks(input), "- DONE A 10秒\n- DONE B 2小时\n");
        }

        #[test]
        fn text_after_end_marker_is_kept() {
            let input = "- DONE A\n:LOGBOOK:\nCLOCK: [a]--[b] => 00:00:10\n:END: tail";
            assert_eq!(collapse_logbooks(input), "- DONE A 10秒 tail");
        }
    }
}

pub mod tasks {
    //! Task keywords → checkboxes (`TODO`/`DOING` → `[ ]`, `DONE` → `[x]`).

    use crate::settings::Settings;
    use crate::syntax::split_indent;

    const MARKERS: [(&str, &str); 3] = [
        ("- TODO", "- [ ]"),
        ("- DOING", "- [ ]"),
        ("- DONE", "- [x]"),
    ];

    /// No-op unless `convert_todo_to_checkbox` is set.
    pub fn translate_task_markers(content: &str, settings: &Settings) -> String {
        if !settings.convert_todo_to_checkbox {
            return content.to_string();
        }
        content
            .split('\n')
            .map(translate_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Everything after the keyword is kept, including a collapsed logbook's duration label.
    pub fn translate_line(line: &str) -> String {
        let (indent, body) = split_indent(line);
        for (marker, checkbox) in MARKERS {
            if let Some(rest) = body.strip_prefix(marker) {
                if ends_word(rest) {
                    return format!("{indent}{checkbox}{rest}");
                }
            }
        }
        line.to_string()
    }

    fn ends_word(rest: &str) -> bool {
        !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const ON: Settings = Settings {
            convert_todo_to_checkbox: true,
        };

        #[test]
        fn disabled_flag_is_a_no_op() {
            let input = "- TODO x\n- DONE y";
            assert_eq!(translate_task_markers(input, &Settings::default()), input);
        }

        #[test]
        fn keywords_become_checkboxes() {
            let input = "- TODO a\n  - DOING b\n\t- DONE c 2分钟\n- TODOX d\n- DONE\ntext - TODO e";
            assert_eq!(
                translate_task_markers(input, &ON),
                "- [ ] a\n  - [ ] b\n\t- [x] c 2分钟\n- TODOX d\n- [x]\ntext - TODO e"
            );
        }

        #[test]
        fn done_suffix_survives() {
            assert_eq!(translate_line("- DONE Task 2分钟"), "- [x] Task 2分钟");
            assert_eq!(translate_line("- DONE: shipped"), "- [x]: shipped");
        }
    }
}

pub mod normalize {
    //! Migrates `id::` property lines into `^id` anchors on their owning lines and keeps every
    //! anchored line separated from the next content by blank lines.
    //!
    //! Migration is planned against the original line indices first, then applied in a single
    //! pass that builds the new line list.

    use crate::core::BlockId;
    use crate::syntax::{self, PROPERTY_MARKER};
    use log::{debug, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Anchor {
        id: BlockId,
        /// Two blank lines follow the owner when any content follows the property line.
        spaced: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct LineEdit {
        trim_leading: bool,
        anchors: Vec<Anchor>,
        remove: bool,
    }

    fn is_blank(line: &str) -> bool {
        line.trim().is_empty()
    }

    fn plan(lines: &[&str]) -> Vec<LineEdit> {
        let mut edits = vec![LineEdit::default(); lines.len()];
        for (i, line) in lines.iter().enumerate() {
            let Some(id) = syntax::property_id(line) else {
                continue;
            };
            let owner = (0..i)
                .rev()
                .find(|&j| !is_blank(lines[j]) && !lines[j].contains(PROPERTY_MARKER));
            let Some(owner) = owner else {
                warn!("no owning line for id {} at line {}; left in place", id, i + 1);
                continue;
            };
            let follower = (i + 1..lines.len()).find(|&k| !is_blank(lines[k]));
            if let Some(k) = follower {
                edits[k].trim_leading = true;
            }
            debug!("anchoring id {} from line {} onto line {}", id, i + 1, owner + 1);
            edits[owner].anchors.push(Anchor {
                id,
                spaced: follower.is_some(),
            });
            edits[i].remove = true;
        }
        edits
    }

    /// The `\r` left on a line split from CRLF text, or nothing.
    fn line_end(line: &str) -> &'static str {
        if line.ends_with('\r') {
            "\r"
        } else {
            ""
        }
    }

    fn with_anchor(line: &str, id: BlockId) -> String {
        let content = line.trim_start();
        let indent = &line[..line.len() - content.len()];
        format!("{indent}{} ^{id}{}", content.trim(), line_end(line))
    }

    fn apply(lines: &[&str], edits: Vec<LineEdit>) -> Vec<String> {
        let mut out = Vec::with_capacity(lines.len());
        for (line, edit) in lines.iter().zip(edits) {
            if edit.remove {
                continue;
            }
            let mut text = if edit.trim_leading {
                line.trim_start().to_string()
            } else {
                line.to_string()
            };
            for anchor in &edit.anchors {
                text = with_anchor(&text, anchor.id);
            }
            let eol = line_end(&text);
            let padding = edit.anchors.iter().filter(|a| a.spaced).count() * 2;
            out.push(text);
            out.extend(std::iter::repeat_n(eol.to_string(), padding));
        }
        out
    }

    /// Property form → anchor form.
    pub fn migrate_block_ids(lines: &[&str]) -> Vec<String> {
        apply(lines, plan(lines))
    }

    /// Insert two blank lines after every anchored line that is directly followed by content.
    pub fn space_anchored_blocks(lines: Vec<String>) -> Vec<String> {
        let mut out = Vec::with_capacity(lines.len());
        let mut iter = lines.into_iter().peekable();
        while let Some(line) = iter.next() {
            let pad = syntax::anchor(&line).is_some()
                && iter.peek().is_some_and(|next| !is_blank(next));
            let eol = line_end(&line).to_string();
            out.push(line);
            if pad {
                out.push(eol.clone());
                out.push(eol);
            }
        }
        out
    }

    pub fn normalize_block_ids(content: &str) -> String {
        let lines: Vec<&str> = content.split('\n').collect();
        space_anchored_blocks(migrate_block_ids(&lines)).join("\n")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const ID: &str = "123e4567-e89b-12d3-a456-426614174000";
        const ID2: &str = "00000000-0000-4000-8000-000000000002";

        #[test]
        fn property_becomes_anchor() {
            let input = format!("- Some content\n  id:: {ID}\n- Next");
            assert_eq!(
                normalize_block_ids(&input),
                format!("- Some content ^{ID}\n\n\n- Next")
            );
        }

        #[test]
        fn nested_owner_keeps_indent_and_follower_is_left_trimmed() {
            let input = format!("- Parent\n  - Child  \n    id:: {ID}\n    - Grandchild");
            assert_eq!(
                normalize_block_ids(&input),
                format!("- Parent\n  - Child ^{ID}\n\n\n- Grandchild")
            );
        }

        #[test]
        fn property_at_end_of_document_gets_no_spacing() {
            let input = format!("- Last\n  id:: {ID}");
            assert_eq!(normalize_block_ids(&input), format!("- Last ^{ID}"));
        }

        #[test]
        fn owner_search_skips_blank_lines() {
            let input = format!("- Owner\n\n  id:: {ID}\n");
            assert_eq!(normalize_block_ids(&input), format!("- Owner ^{ID}\n\n"));
        }

        #[test]
        fn orphan_property_survives() {
            let input = format!("\n  id:: {ID}\n- Next");
            assert_eq!(normalize_block_ids(&input), input);
        }

        #[test]
        fn consecutive_properties_share_an_owner() {
            let input = format!("- A\n  id:: {ID}\n  id:: {ID2}\n- B");
            assert_eq!(
                normalize_block_ids(&input),
                format!("- A ^{ID} ^{ID2}\n\n\n\n\n- B")
            );
        }

        #[test]
        fn several_blocks_in_one_document() {
            let input = format!("- A\n  id:: {ID}\n  - B\n    id:: {ID2}\n- C");
            assert_eq!(
                normalize_block_ids(&input),
                format!("- A ^{ID}\n\n\n- B ^{ID2}\n\n\n- C")
            );
        }

        #[test]
        fn existing_anchors_get_spacing() {
            let input = format!("- Anchored ^{ID}\n- Next\n- Other ^{ID2}\n\n- Spaced");
            assert_eq!(
                normalize_block_ids(&input),
                format!("- Anchored ^{ID}\n\n\n- Next\n- Other ^{ID2}\n\n- Spaced")
            );
        }

        #[test]
        fn crlf_line_endings_are_kept() {
            let input = format!("- Some content\r\n  id:: {ID}\r\n- Next\r\n");
            let once = normalize_block_ids(&input);
            assert_eq!(once, format!("- Some content ^{ID}\r\n\r\n\r\n- Next\r\n"));
            assert_eq!(normalize_block_ids(&once), once);

            let anchored = format!("- Anchored ^{ID}\r\n- Next");
            assert_eq!(
                normalize_block_ids(&anchored),
                format!("- Anchored ^{ID}\r\n\r\n\r\n- Next")
            );
        }

        #[test]
        fn normalization_is_idempotent() {
            let inputs = [
                format!("- A\n  id:: {ID}\n  - B\n    id:: {ID2}\n- C"),
                format!("- A\n  id:: {ID}\n  id:: {ID2}\n- B"),
                format!("\n  id:: {ID}\n- Next ^{ID2}\n- Tail"),
                "plain text\nwithout ids".to_string(),
            ];
            for input in inputs {
                let once = normalize_block_ids(&input);
                assert_eq!(normalize_block_ids(&once), once, "input: {input:?}");
            }
        }
    }
}

pub mod convert {
    //! The conversion pipeline run when a document is opened.

    use crate::settings::Settings;
    use crate::vault::{DocumentRef, Vault};
    use crate::{logbook, normalize, tasks};
    use anyhow::{Context, Result};
    use log::{debug, info};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Conversion {
        Unchanged,
        Rewritten,
    }

    /// Block ids first, then logbooks, then task markers (the `DONE` rewrite keeps the
    /// duration label added by the logbook pass).
    pub fn convert_content(content: &str, settings: &Settings) -> String {
        let normalized = normalize::normalize_block_ids(content);
        let collapsed = logbook::collapse_logbooks(&normalized);
        tasks::translate_task_markers(&collapsed, settings)
    }

    /// Convert a stored document, writing back only when the text actually changed.
    pub async fn convert_document(
        vault: &dyn Vault,
        doc: &DocumentRef,
        settings: &Settings,
    ) -> Result<Conversion> {
        let content = vault.read(doc).await?;
        let converted = convert_content(&content, settings);
        if converted == content {
            debug!("{} already converted", doc.path);
            return Ok(Conversion::Unchanged);
        }
        vault
            .modify(doc, &converted)
            .await
            .with_context(|| format!("writing converted {}", doc.path))?;
        info!("converted {}", doc.path);
        Ok(Conversion::Rewritten)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::vault::MemoryVault;

        const ID: &str = "123e4567-e89b-12d3-a456-426614174000";

        #[test]
        fn full_pipeline() {
            let input = format!(
                "- DONE Task\n  :LOGBOOK:\n  CLOCK: [2024-01-01]--[2024-01-01] =>  00:01:30\n  CLOCK: [2024-01-01]--[2024-01-01] =>  00:00:45\n  :END:\n  id:: {ID}\n- TODO Next"
            );
            let on = Settings {
                convert_todo_to_checkbox: true,
            };
            // The drawer's last line owns the id; text after `:END:` rides along onto the
            // collapsed task line.
            assert_eq!(
                convert_content(&input, &on),
                format!("- [x] Task 2分钟 ^{ID}\n\n\n- [ ] Next")
            );

            let input = format!(
                "- DONE Task\n  :LOGBOOK:\n  CLOCK: [2024-01-01]--[2024-01-01] =>  00:01:30\n  :END:\n- Ref\n  id:: {ID}\n- TODO Next"
            );
            assert_eq!(
                convert_content(&input, &on),
                format!("- [x] Task 1分钟\n- Ref ^{ID}\n\n\n- [ ] Next")
            );
            assert_eq!(
                convert_content(&input, &Settings::default()),
                format!("- DONE Task 1分钟\n- Ref ^{ID}\n\n\n- TODO Next")
            );
        }

        #[tokio::test]
        async fn unchanged_documents_are_not_written() {
            let vault = MemoryVault::new();
            vault.insert("pages/todo.md", "- TODO x");
            let doc = DocumentRef::new("pages/todo.md");

            let outcome = convert_document(&vault, &doc, &Settings::default())
                .await
                .expect("convert");
            assert_eq!(outcome, Conversion::Unchanged);
            assert_eq!(vault.write_count(), 0);

            let on = Settings {
                convert_todo_to_checkbox: true,
            };
            let outcome = convert_document(&vault, &doc, &on).await.expect("convert");
            assert_eq!(outcome, Conversion::Rewritten);
            assert_eq!(vault.write_count(), 1);
            assert_eq!(vault.get("pages/todo.md").as_deref(), Some("- [ ] x"));
        }
    }
}

pub mod settings {
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const PLUGIN_ID: &str = "logseq-to-obsidian";

    /// Persisted plugin settings. Keys missing from stored data keep their defaults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        /// Rewrite `TODO`/`DOING`/`DONE` markers as checkboxes.
        pub convert_todo_to_checkbox: bool,
    }

    /// Opaque per-plugin persistence supplied by the host.
    pub trait SettingsStore: Send + Sync {
        fn load_data(&self) -> Result<Option<Value>>;
        fn save_data(&self, value: &Value) -> Result<()>;
    }

    impl Settings {
        pub fn load(store: &dyn SettingsStore) -> Result<Self> {
            match store.load_data()? {
                None | Some(Value::Null) => Ok(Self::default()),
                Some(value) => serde_json::from_value(value).context("decoding plugin settings"),
            }
        }

        pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
            store.save_data(&serde_json::to_value(self)?)
        }
    }

    /// `data.json` under the vault's plugin directory.
    #[derive(Debug, Clone)]
    pub struct JsonFileStore {
        path: PathBuf,
    }

    impl JsonFileStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn for_vault(root: &Path) -> Self {
            Self::new(
                root.join(".obsidian")
                    .join("plugins")
                    .join(PLUGIN_ID)
                    .join("data.json"),
            )
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SettingsStore for JsonFileStore {
        fn load_data(&self) -> Result<Option<Value>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let text = fs::read_to_string(&self.path)
                .with_context(|| format!("reading {:?}", self.path))?;
            if text.trim().is_empty() {
                return Ok(None);
            }
            let value =
                serde_json::from_str(&text).with_context(|| format!("parsing {:?}", self.path))?;
            Ok(Some(value))
        }

        fn save_data(&self, value: &Value) -> Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            fs::write(&self.path, serde_json::to_string_pretty(value)?)
                .with_context(|| format!("writing {:?}", self.path))
        }
    }

}

pub mod vault {
    //! Host document store: a tree of containers and documents addressed by vault-relative
    //! POSIX paths.
    //!
    //! - `FsVault` snapshots a directory on disk (dot-directories are skipped, children sorted
    //!   by name) and reads/writes documents through `tokio::fs`.
    //! - `MemoryVault` keeps documents in insertion order; handy for tests and embedding.

    use anyhow::{Context, Result, anyhow, bail};
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use log::debug;
    use serde::{Deserialize, Serialize};
    use std::{
        fmt, fs,
        path::{Path, PathBuf},
        sync::{
            PoisonError, RwLock,
            atomic::{AtomicUsize, Ordering},
        },
    };

    pub const MARKDOWN_EXTENSION: &str = "md";

    /* ---------------------------- Value Objects ---------------------------- */

    /// A POSIX-like relative path from the vault root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct VaultPath(pub String);

    impl VaultPath {
        pub fn root() -> Self {
            Self(String::new())
        }

        pub fn new(path: &str) -> Self {
            Self(path.trim_matches('/').to_string())
        }

        pub fn join(&self, segment: &str) -> Self {
            if self.0.is_empty() {
                Self(segment.to_string())
            } else {
                Self(format!("{}/{}", self.0, segment))
            }
        }

        pub fn parent(&self) -> Option<Self> {
            if self.0.is_empty() {
                return None;
            }
            Some(match self.0.rsplit_once('/') {
                Some((parent, _)) => Self(parent.to_string()),
                None => Self::root(),
            })
        }

        pub fn file_name(&self) -> Option<&str> {
            if self.0.is_empty() {
                None
            } else {
                self.0.rsplit('/').next()
            }
        }

        pub fn extension(&self) -> Option<&str> {
            match self.file_name()?.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => Some(ext),
                _ => None,
            }
        }

        /// True for `dir` itself and anything below it (component-wise, so `pages-old`
        /// is not within `pages`).
        pub fn is_within(&self, dir: &str) -> bool {
            let dir = dir.trim_matches('/');
            match self.0.strip_prefix(dir) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        }

        pub fn segments(&self) -> impl Iterator<Item = &str> {
            self.0.split('/').filter(|s| !s.is_empty())
        }
    }

    impl fmt::Display for VaultPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for VaultPath {
        fn from(s: &str) -> Self {
            Self::new(s)
        }
    }

    /* ------------------------------- Entries ------------------------------- */

    /// A document in the vault.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DocumentRef {
        pub path: VaultPath,
    }

    impl DocumentRef {
        pub fn new(path: &str) -> Self {
            Self {
                path: VaultPath::new(path),
            }
        }

        pub fn extension(&self) -> Option<&str> {
            self.path.extension()
        }

        pub fn is_markdown(&self) -> bool {
            self.extension() == Some(MARKDOWN_EXTENSION)
        }

        /// File name without its extension.
        pub fn basename(&self) -> &str {
            let name = self.path.file_name().unwrap_or_default();
            match self.extension() {
                Some(ext) => &name[..name.len() - ext.len() - 1],
                None => name,
            }
        }
    }

    /// A folder holding documents and nested containers, in enumeration order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Container {
        pub path: VaultPath,
        pub children: Vec<Entry>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Entry {
        Document(DocumentRef),
        Container(Container),
    }

    impl Entry {
        pub fn path(&self) -> &VaultPath {
            match self {
                Entry::Document(doc) => &doc.path,
                Entry::Container(dir) => &dir.path,
            }
        }
    }

    impl Container {
        pub fn new(path: VaultPath) -> Self {
            Self {
                path,
                children: vec![],
            }
        }

        /// Build a tree from document paths; containers appear in first-seen order.
        pub fn from_documents<'a>(paths: impl IntoIterator<Item = &'a VaultPath>) -> Self {
            let mut root = Self::new(VaultPath::root());
            for path in paths {
                root.insert_document(path);
            }
            root
        }

        fn insert_document(&mut self, path: &VaultPath) {
            let segments: Vec<&str> = path.segments().collect();
            let Some((_, dirs)) = segments.split_last() else {
                return;
            };
            let mut node = self;
            let mut current = VaultPath::root();
            for dir in dirs {
                current = current.join(dir);
                let existing = node
                    .children
                    .iter()
                    .position(|e| matches!(e, Entry::Container(c) if c.path == current));
                let idx = match existing {
                    Some(idx) => idx,
                    None => {
                        node.children
                            .push(Entry::Container(Container::new(current.clone())));
                        node.children.len() - 1
                    }
                };
                node = match &mut node.children[idx] {
                    Entry::Container(c) => c,
                    Entry::Document(_) => return,
                };
            }
            node.children.push(Entry::Document(DocumentRef {
                path: path.clone(),
            }));
        }

        /// Find the entry at `path` below (or at) this container.
        pub fn entry(&self, path: &VaultPath) -> Option<Entry> {
            if &self.path == path {
                return Some(Entry::Container(self.clone()));
            }
            for child in &self.children {
                match child {
                    Entry::Document(doc) if &doc.path == path => return Some(child.clone()),
                    Entry::Container(dir) if path.is_within(&dir.path.0) => {
                        return dir.entry(path);
                    }
                    _ => {}
                }
            }
            None
        }

        /// Collect all documents recursively, depth-first.
        pub fn collect_documents(&self, out: &mut Vec<DocumentRef>) {
            for child in &self.children {
                match child {
                    Entry::Document(doc) => out.push(doc.clone()),
                    Entry::Container(dir) => dir.collect_documents(out),
                }
            }
        }

        pub fn markdown_documents(&self) -> Vec<DocumentRef> {
            let mut out = Vec::new();
            self.collect_documents(&mut out);
            out.retain(DocumentRef::is_markdown);
            out
        }
    }

    /* -------------------------------- Store -------------------------------- */

    /// What the conversion pipeline and the resolver need from the host's storage.
    #[async_trait]
    pub trait Vault: Send + Sync {
        async fn read(&self, doc: &DocumentRef) -> Result<String>;

        async fn modify(&self, doc: &DocumentRef, content: &str) -> Result<()>;

        /// Every markdown document, in enumeration order.
        fn markdown_files(&self) -> Vec<DocumentRef>;

        /// The document or container at `path`, if any.
        fn entry(&self, path: &VaultPath) -> Option<Entry>;
    }

    /// A vault rooted at a directory on disk.
    #[derive(Debug)]
    pub struct FsVault {
        root: PathBuf,
        tree: RwLock<Container>,
    }

    impl FsVault {
        pub fn open(root: impl AsRef<Path>) -> Result<Self> {
            let root = fs::canonicalize(root.as_ref())
                .with_context(|| format!("resolving vault root {:?}", root.as_ref()))?;
            if !root.is_dir() {
                bail!("vault root {:?} is not a directory", root);
            }
            let tree = scan_dir(&root, &VaultPath::root())?;
            Ok(Self {
                root,
                tree: RwLock::new(tree),
            })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        /// Re-scan the directory tree.
        pub fn refresh(&self) -> Result<()> {
            let tree = scan_dir(&self.root, &VaultPath::root())?;
            *self.tree.write().unwrap_or_else(PoisonError::into_inner) = tree;
            Ok(())
        }

        pub fn abs_path(&self, rel: &VaultPath) -> PathBuf {
            rel.segments().fold(self.root.clone(), |acc, s| acc.join(s))
        }

        /// Map a path on disk to the document it names inside this vault.
        pub fn document_for(&self, path: &Path) -> Result<DocumentRef> {
            let canonical =
                fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
            let rel = canonical
                .strip_prefix(&self.root)
                .map_err(|_| anyhow!("{:?} is outside the vault {:?}", canonical, self.root))?;
            let segments: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Ok(DocumentRef {
                path: VaultPath(segments.join("/")),
            })
        }
    }

    fn scan_dir(abs: &Path, rel: &VaultPath) -> Result<Container> {
        let mut entries = fs::read_dir(abs)
            .with_context(|| format!("reading directory {:?}", abs))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut container = Container::new(rel.clone());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            let child = rel.join(&name);
            if file_type.is_dir() {
                container
                    .children
                    .push(Entry::Container(scan_dir(&entry.path(), &child)?));
            } else if file_type.is_file() {
                container
                    .children
                    .push(Entry::Document(DocumentRef { path: child }));
            }
        }
        debug!("scanned {:?} ({} entries)", abs, container.children.len());
        Ok(container)
    }

    #[async_trait]
    impl Vault for FsVault {
        async fn read(&self, doc: &DocumentRef) -> Result<String> {
            let path = self.abs_path(&doc.path);
            tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {:?}", path))
        }

        async fn modify(&self, doc: &DocumentRef, content: &str) -> Result<()> {
            let path = self.abs_path(&doc.path);
            tokio::fs::write(&path, content.as_bytes())
                .await
                .with_context(|| format!("writing {:?}", path))
        }

        fn markdown_files(&self) -> Vec<DocumentRef> {
            self.tree
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .markdown_documents()
        }

        fn entry(&self, path: &VaultPath) -> Option<Entry> {
            self.tree
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(path)
        }
    }

    /// In-memory vault; enumeration follows insertion order.
    #[derive(Debug, Default)]
    pub struct MemoryVault {
        docs: RwLock<IndexMap<VaultPath, String>>,
        writes: AtomicUsize,
    }

    impl MemoryVault {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, path: &str, content: &str) {
            self.docs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(VaultPath::new(path), content.to_string());
        }

        pub fn get(&self, path: &str) -> Option<String> {
            self.docs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&VaultPath::new(path))
                .cloned()
        }

        /// Number of successful `modify` calls.
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn tree(&self) -> Container {
            let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
            Container::from_documents(docs.keys())
        }
    }

    #[async_trait]
    impl Vault for MemoryVault {
        async fn read(&self, doc: &DocumentRef) -> Result<String> {
            self.get(&doc.path.0)
                .ok_or_else(|| anyhow!("no document at {}", doc.path))
        }

        async fn modify(&self, doc: &DocumentRef, content: &str) -> Result<()> {
            let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
            let slot = docs
                .get_mut(&doc.path)
                .ok_or_else(|| anyhow!("no document at {}", doc.path))?;
            *slot = content.to_string();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn markdown_files(&self) -> Vec<DocumentRef> {
            self.tree().markdown_documents()
        }

        fn entry(&self, path: &VaultPath) -> Option<Entry> {
            self.tree().entry(path)
        }
    }

}

pub mod resolve {
    //! Finds the block that owns an identifier anywhere in the vault.
    //!
    //! Search order: `journals/` then `pages/` (depth-first, enumeration order), then every
    //! other markdown document. The first hit wins; duplicate ids are not reconciled.

    use crate::core::BlockId;
    use crate::syntax;
    use crate::vault::{Container, DocumentRef, Entry, Vault, VaultPath};
    use anyhow::Result;
    use log::debug;
    use serde::Serialize;
    use std::sync::Arc;

    pub const SEARCH_ROOTS: [&str; 2] = ["journals", "pages"];

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ResolvedBlock {
        pub content: String,
        pub source: DocumentRef,
    }

    /// Content of the block owning `id` in a single document.
    ///
    /// A property line yields the nearest non-blank line above it; an anchored line yields
    /// its own content. Empty content counts as not found.
    pub fn extract_block_content(text: &str, id: BlockId) -> Option<String> {
        let lines: Vec<&str> = text.split('\n').collect();
        for (i, line) in lines.iter().enumerate() {
            if syntax::property_id(line) == Some(id) {
                let owner = lines[..i]
                    .iter()
                    .rev()
                    .map(|l| l.trim())
                    .find(|l| !l.is_empty());
                if let Some(owner) = owner {
                    return Some(owner.to_string());
                }
            }
            if let Some((content, anchored)) = syntax::anchor(line) {
                if anchored == id {
                    let content = content.trim();
                    return (!content.is_empty()).then(|| content.to_string());
                }
            }
        }
        None
    }

    #[derive(Clone)]
    pub struct BlockResolver {
        vault: Arc<dyn Vault>,
    }

    impl BlockResolver {
        pub fn new(vault: Arc<dyn Vault>) -> Self {
            Self { vault }
        }

        /// Host read failures are returned as errors; a missing block is `Ok(None)`.
        pub async fn resolve(&self, id: BlockId) -> Result<Option<ResolvedBlock>> {
            for root in SEARCH_ROOTS {
                if let Some(Entry::Container(dir)) = self.vault.entry(&VaultPath::new(root)) {
                    if let Some(hit) = self.search_container(&dir, id).await? {
                        return Ok(Some(hit));
                    }
                }
            }

            for doc in self.vault.markdown_files() {
                if SEARCH_ROOTS.iter().any(|root| doc.path.is_within(root)) {
                    continue;
                }
                if let Some(hit) = self.search_document(&doc, id).await? {
                    return Ok(Some(hit));
                }
            }

            debug!("block {} not found", id);
            Ok(None)
        }

        async fn search_container(
            &self,
            dir: &Container,
            id: BlockId,
        ) -> Result<Option<ResolvedBlock>> {
            let mut stack: Vec<&Entry> = dir.children.iter().rev().collect();
            while let Some(entry) = stack.pop() {
                match entry {
                    Entry::Document(doc) if doc.is_markdown() => {
                        if let Some(hit) = self.search_document(doc, id).await? {
                            return Ok(Some(hit));
                        }
                    }
                    Entry::Document(_) => {}
                    Entry::Container(sub) => stack.extend(sub.children.iter().rev()),
                }
            }
            Ok(None)
        }

        async fn search_document(
            &self,
            doc: &DocumentRef,
            id: BlockId,
        ) -> Result<Option<ResolvedBlock>> {
            let text = self.vault.read(doc).await?;
            Ok(extract_block_content(&text, id).map(|content| {
                debug!("block {} found in {}", id, doc.path);
                ResolvedBlock {
                    content,
                    source: doc.clone(),
                }
            }))
        }
    }

}

pub mod render {
    //! Block-reference presentation shared by the static and live front ends.
    //!
    //! Every token first shows a loading placeholder; `RefContext::settle` later turns it
    //! into resolved content or an error view. Completions arrive unordered.

    use crate::core::BlockId;
    use crate::resolve::{BlockResolver, ResolvedBlock};
    use crate::vault::DocumentRef;
    use anyhow::Result;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use log::{debug, error, info};
    use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
    use std::sync::Arc;
    use tokio::{sync::mpsc, task::JoinHandle};

    pub const BLOCK_REF_CLASS: &str = "logseq-block-ref";
    pub const LOADING_TEXT: &str = "加载中...";
    pub const REF_ICON: &str = "↗ ";
    pub const ERROR_STYLE: &str = "color: var(--text-error)";
    pub const NOT_FOUND_TOOLTIP: &str = "未找到块内容";
    const WRAPPER_STYLE: &str = "display: inline;";
    const ICON_STYLE: &str = "opacity: 0.5; font-size: 0.9em;";
    const VOID_TAGS: [&str; 4] = ["br", "hr", "img", "input"];

    /* ------------------------------ Output Tree ----------------------------- */

    #[derive(Debug, Clone, PartialEq)]
    pub enum Node {
        Text(String),
        Element(Element),
        BlockRef(BlockRefView),
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Element {
        pub tag: String,
        pub classes: Vec<String>,
        pub attrs: IndexMap<String, String>,
        pub children: Vec<Node>,
    }

    impl Element {
        pub fn new(tag: &str) -> Self {
            Self {
                tag: tag.to_string(),
                ..Self::default()
            }
        }

        pub fn with_class(mut self, class: &str) -> Self {
            self.classes.push(class.to_string());
            self
        }

        pub fn with_attr(mut self, name: &str, value: &str) -> Self {
            self.attrs.insert(name.to_string(), value.to_string());
            self
        }

        pub fn with_text(mut self, text: &str) -> Self {
            self.children.push(Node::Text(text.to_string()));
            self
        }

        pub fn with_child(mut self, child: Node) -> Self {
            self.children.push(child);
            self
        }

        pub fn has_class(&self, class: &str) -> bool {
            self.classes.iter().any(|c| c == class)
        }

        pub fn text_content(&self) -> String {
            let mut out = String::new();
            for child in &self.children {
                child.write_text(&mut out);
            }
            out
        }

        pub fn to_html(&self) -> String {
            let mut out = String::new();
            self.write_html(&mut out);
            out
        }

        fn write_html(&self, out: &mut String) {
            out.push('<');
            out.push_str(&self.tag);
            if !self.classes.is_empty() {
                out.push_str(" class=\"");
                out.push_str(&escape(&self.classes.join(" "), true));
                out.push('"');
            }
            for (name, value) in &self.attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape(value, true));
                out.push('"');
            }
            out.push('>');
            if VOID_TAGS.contains(&self.tag.as_str()) {
                return;
            }
            for child in &self.children {
                child.write_html(out);
            }
            out.push_str("</");
            out.push_str(&self.tag);
            out.push('>');
        }
    }

    impl Node {
        pub fn to_html(&self) -> String {
            let mut out = String::new();
            self.write_html(&mut out);
            out
        }

        fn write_html(&self, out: &mut String) {
            match self {
                Node::Text(text) => out.push_str(&escape(text, false)),
                Node::Element(el) => el.write_html(out),
                Node::BlockRef(view) => view.to_element().write_html(out),
            }
        }

        fn write_text(&self, out: &mut String) {
            match self {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => out.push_str(&el.text_content()),
                Node::BlockRef(view) => out.push_str(&view.to_element().text_content()),
            }
        }
    }

    fn escape(text: &str, attr: bool) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' if attr => out.push_str("&quot;"),
                c => out.push(c),
            }
        }
        out
    }

    /* ---------------------------- Reference Views --------------------------- */

    /// Where a completion lands: the render pass (generation) and the token's position in it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RefSlot {
        pub generation: u64,
        pub index: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Unresolved {
        NotFound,
        Failed(String),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RefState {
        Loading,
        Resolved {
            content: Vec<Node>,
            source: DocumentRef,
        },
        Unresolved(Unresolved),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct BlockRefView {
        pub id: BlockId,
        pub slot: RefSlot,
        pub state: RefState,
    }

    impl BlockRefView {
        pub fn loading(id: BlockId, slot: RefSlot) -> Self {
            Self {
                id,
                slot,
                state: RefState::Loading,
            }
        }

        pub fn tooltip(&self) -> Option<String> {
            match &self.state {
                RefState::Loading => None,
                RefState::Resolved { .. } => Some(format!("块引用: {}", self.id)),
                RefState::Unresolved(Unresolved::NotFound) => Some(NOT_FOUND_TOOLTIP.to_string()),
                RefState::Unresolved(Unresolved::Failed(err)) => {
                    Some(format!("加载块内容失败: {}", err))
                }
            }
        }

        pub fn to_element(&self) -> Element {
            let icon = Element::new("span")
                .with_attr("style", ICON_STYLE)
                .with_text(REF_ICON);
            let content = match &self.state {
                RefState::Loading => Element::new("span").with_text(LOADING_TEXT),
                RefState::Resolved { content, .. } => Element {
                    children: content.clone(),
                    ..Element::new("span")
                },
                RefState::Unresolved(_) => Element::new("span")
                    .with_attr("style", ERROR_STYLE)
                    .with_text(&self.id.token()),
            };

            let mut wrapper = Element::new("span")
                .with_class(BLOCK_REF_CLASS)
                .with_attr("style", WRAPPER_STYLE)
                .with_attr("data-block-id", &self.id.to_string());
            if let Some(tooltip) = self.tooltip() {
                wrapper = wrapper.with_attr("title", &tooltip);
            }
            wrapper.with_child(Node::Element(icon)).with_child(Node::Element(content))
        }
    }

    /* ------------------------------- Renderers ------------------------------ */

    /// Host hook that renders dialect markdown into output nodes.
    #[async_trait]
    pub trait MarkdownRenderer: Send + Sync {
        async fn render(&self, markdown: &str, source_path: &str) -> Result<Vec<Node>>;
    }

    /// CommonMark renderer with tables, strikethrough and task lists enabled.
    #[derive(Debug, Clone, Copy)]
    pub struct CmarkRenderer {
        options: Options,
    }

    impl Default for CmarkRenderer {
        fn default() -> Self {
            Self {
                options: Options::ENABLE_TABLES
                    | Options::ENABLE_STRIKETHROUGH
                    | Options::ENABLE_TASKLISTS,
            }
        }
    }

    impl CmarkRenderer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn render_nodes(&self, markdown: &str) -> Vec<Node> {
            let mut stack = vec![Element::new("div")];
            for event in Parser::new_ext(markdown, self.options) {
                match event {
                    Event::Start(tag) => {
                        let is_code = matches!(tag, Tag::CodeBlock(_));
                        stack.push(open_tag(&tag));
                        if is_code {
                            stack.push(Element::new("code"));
                        }
                    }
                    Event::End(end) => {
                        if matches!(end, TagEnd::CodeBlock) {
                            close_top(&mut stack);
                        }
                        close_top(&mut stack);
                    }
                    Event::Text(text) => push_text(&mut stack, &text),
                    Event::Code(code) => {
                        push_node(&mut stack, Node::Element(Element::new("code").with_text(&code)))
                    }
                    Event::Html(html) | Event::InlineHtml(html) => push_text(&mut stack, &html),
                    Event::SoftBreak => push_text(&mut stack, "\n"),
                    Event::HardBreak => push_node(&mut stack, Node::Element(Element::new("br"))),
                    Event::Rule => push_node(&mut stack, Node::Element(Element::new("hr"))),
                    Event::TaskListMarker(checked) => {
                        let mut input = Element::new("input")
                            .with_attr("type", "checkbox")
                            .with_attr("disabled", "");
                        if checked {
                            input = input.with_attr("checked", "");
                        }
                        push_node(&mut stack, Node::Element(input));
                    }
                    Event::FootnoteReference(label) => {
                        push_node(&mut stack, Node::Element(Element::new("sup").with_text(&label)))
                    }
                }
            }
            while stack.len() > 1 {
                close_top(&mut stack);
            }
            stack.pop().map(|root| root.children).unwrap_or_default()
        }
    }

    fn open_tag(tag: &Tag) -> Element {
        match tag {
            Tag::Paragraph => Element::new("p"),
            Tag::Heading { level, .. } => Element::new(&format!("h{}", *level as usize)),
            Tag::BlockQuote { .. } => Element::new("blockquote"),
            Tag::CodeBlock(CodeBlockKind::Fenced(lang)) if !lang.is_empty() => {
                Element::new("pre").with_attr("data-lang", lang)
            }
            Tag::CodeBlock(_) => Element::new("pre"),
            Tag::List(Some(start)) if *start != 1 => {
                Element::new("ol").with_attr("start", &start.to_string())
            }
            Tag::List(Some(_)) => Element::new("ol"),
            Tag::List(None) => Element::new("ul"),
            Tag::Item => Element::new("li"),
            Tag::Emphasis => Element::new("em"),
            Tag::Strong => Element::new("strong"),
            Tag::Strikethrough => Element::new("del"),
            Tag::Link {
                dest_url, title, ..
            } => {
                let mut link = Element::new("a").with_attr("href", dest_url);
                if !title.is_empty() {
                    link = link.with_attr("title", title);
                }
                link
            }
            Tag::Image { dest_url, .. } => Element::new("img").with_attr("src", dest_url),
            Tag::Table(_) => Element::new("table"),
            Tag::TableHead => Element::new("thead"),
            Tag::TableRow => Element::new("tr"),
            Tag::TableCell => Element::new("td"),
            _ => Element::new("div"),
        }
    }

    fn close_top(stack: &mut Vec<Element>) {
        if stack.len() < 2 {
            return;
        }
        let Some(mut el) = stack.pop() else {
            return;
        };
        if el.tag == "img" {
            let alt = el.text_content();
            el.children.clear();
            el.attrs.insert("alt".to_string(), alt);
        }
        push_node(stack, Node::Element(el));
    }

    fn push_node(stack: &mut [Element], node: Node) {
        if let Some(top) = stack.last_mut() {
            top.children.push(node);
        }
    }

    fn push_text(stack: &mut [Element], text: &str) {
        let Some(top) = stack.last_mut() else {
            return;
        };
        match top.children.last_mut() {
            Some(Node::Text(prev)) => prev.push_str(text),
            _ => top.children.push(Node::Text(text.to_string())),
        }
    }

    #[async_trait]
    impl MarkdownRenderer for CmarkRenderer {
        async fn render(&self, markdown: &str, _source_path: &str) -> Result<Vec<Node>> {
            Ok(self.render_nodes(markdown))
        }
    }

    /* ---------------------------- Resolution Tasks --------------------------- */

    /// A placeholder waiting for its block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingRef {
        pub id: BlockId,
        pub slot: RefSlot,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct RefCompletion {
        pub id: BlockId,
        pub slot: RefSlot,
        pub state: RefState,
    }

    /// Everything a resolution task needs: the resolver, the host renderer and the path of
    /// the document being displayed.
    #[derive(Clone)]
    pub struct RefContext {
        resolver: BlockResolver,
        renderer: Arc<dyn MarkdownRenderer>,
        source_path: String,
    }

    impl RefContext {
        pub fn new(
            resolver: BlockResolver,
            renderer: Arc<dyn MarkdownRenderer>,
            source_path: impl Into<String>,
        ) -> Self {
            Self {
                resolver,
                renderer,
                source_path: source_path.into(),
            }
        }

        pub fn source_path(&self) -> &str {
            &self.source_path
        }

        /// Resolve and render one token. Never fails; errors become `Unresolved` states.
        pub async fn settle(&self, id: BlockId) -> RefState {
            match self.resolver.resolve(id).await {
                Ok(Some(ResolvedBlock { content, source })) => {
                    match self.renderer.render(&content, &self.source_path).await {
                        Ok(nodes) => {
                            info!("rendered block {} from {}", id, source.path);
                            RefState::Resolved {
                                content: nodes,
                                source,
                            }
                        }
                        Err(err) => {
                            error!("failed to render block {}: {:#}", id, err);
                            RefState::Unresolved(Unresolved::Failed(format!("{:#}", err)))
                        }
                    }
                }
                Ok(None) => {
                    info!("block {} not found", id);
                    RefState::Unresolved(Unresolved::NotFound)
                }
                Err(err) => {
                    error!("failed to load block {}: {:#}", id, err);
                    RefState::Unresolved(Unresolved::Failed(format!("{:#}", err)))
                }
            }
        }

        /// Settle `pending` on its own task and report through `tx`.
        pub fn spawn(
            &self,
            pending: PendingRef,
            tx: mpsc::UnboundedSender<RefCompletion>,
        ) -> JoinHandle<()> {
            let ctx = self.clone();
            tokio::spawn(async move {
                let state = ctx.settle(pending.id).await;
                let completion = RefCompletion {
                    id: pending.id,
                    slot: pending.slot,
                    state,
                };
                if tx.send(completion).is_err() {
                    debug!("completion for block {} dropped", pending.id);
                }
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::vault::{Entry, MemoryVault, Vault, VaultPath};

        const ID: &str = "123e4567-e89b-12d3-a456-426614174000";

        fn id() -> BlockId {
            BlockId::parse(ID).expect("id")
        }

        fn slot() -> RefSlot {
            RefSlot {
                generation: 0,
                index: 0,
            }
        }

        fn context(vault: MemoryVault, renderer: Arc<dyn MarkdownRenderer>) -> RefContext {
            RefContext::new(BlockResolver::new(Arc::new(vault)), renderer, "pages/current.md")
        }

        struct FailingRenderer;

        #[async_trait]
        impl MarkdownRenderer for FailingRenderer {
            async fn render(&self, _markdown: &str, _source_path: &str) -> Result<Vec<Node>> {
                anyhow::bail!("renderer offline")
            }
        }

        struct UnreadableVault;

        #[async_trait]
        impl Vault for UnreadableVault {
            async fn read(&self, doc: &DocumentRef) -> Result<String> {
                anyhow::bail!("permission denied reading {}", doc.path)
            }

            async fn modify(&self, _doc: &DocumentRef, _content: &str) -> Result<()> {
                anyhow::bail!("read-only")
            }

            fn markdown_files(&self) -> Vec<DocumentRef> {
                vec![DocumentRef::new("notes/locked.md")]
            }

            fn entry(&self, _path: &VaultPath) -> Option<Entry> {
                None
            }
        }

        #[test]
        fn cmark_renders_inline_markup() {
            let nodes = CmarkRenderer::new().render_nodes("**bold** & `code`");
            let html: String = nodes.iter().map(Node::to_html).collect();
            assert_eq!(html, "<p><strong>bold</strong> &amp; <code>code</code></p>");

            let nodes = CmarkRenderer::new().render_nodes("- [x] done");
            let html: String = nodes.iter().map(Node::to_html).collect();
            assert!(html.starts_with("<ul><li><input type=\"checkbox\""));
            assert!(html.contains("checked"));
        }

        #[test]
        fn loading_view_shape() {
            let view = BlockRefView::loading(id(), slot());
            assert_eq!(view.tooltip(), None);
            let el = view.to_element();
            assert!(el.has_class(BLOCK_REF_CLASS));
            assert_eq!(el.text_content(), format!("{REF_ICON}{LOADING_TEXT}"));
        }

        #[test]
        fn unresolved_view_shows_token_with_error_style() {
            let view = BlockRefView {
                state: RefState::Unresolved(Unresolved::NotFound),
                ..BlockRefView::loading(id(), slot())
            };
            let html = view.to_element().to_html();
            assert!(html.contains(&format!("(({ID}))")));
            assert!(html.contains(ERROR_STYLE));
            assert!(html.contains("title=\"未找到块内容\""));

            let failed = BlockRefView {
                state: RefState::Unresolved(Unresolved::Failed("disk gone".into())),
                ..BlockRefView::loading(id(), slot())
            };
            assert_eq!(failed.tooltip().as_deref(), Some("加载块内容失败: disk gone"));
        }

        #[tokio::test]
        async fn settle_renders_resolved_content() {
            let vault = MemoryVault::new();
            vault.insert("pages/a.md", &format!("- Some *content* ^{ID}"));
            let ctx = context(vault, Arc::new(CmarkRenderer::new()));

            match ctx.settle(id()).await {
                RefState::Resolved { content, source } => {
                    assert_eq!(source, DocumentRef::new("pages/a.md"));
                    let html: String = content.iter().map(Node::to_html).collect();
                    assert_eq!(html, "<ul><li>Some <em>content</em></li></ul>");
                }
                other => panic!("unexpected state {:?}", other),
            }
        }

        #[tokio::test]
        async fn settle_reports_missing_and_failed_blocks() {
            let ctx = context(MemoryVault::new(), Arc::new(CmarkRenderer::new()));
            assert_eq!(
                ctx.settle(id()).await,
                RefState::Unresolved(Unresolved::NotFound)
            );

            let vault = MemoryVault::new();
            vault.insert("pages/a.md", &format!("- content ^{ID}"));
            let ctx = context(vault, Arc::new(FailingRenderer));
            assert!(matches!(
                ctx.settle(id()).await,
                RefState::Unresolved(Unresolved::Failed(msg)) if msg.contains("renderer offline")
            ));
        }

        #[tokio::test]
        async fn read_failures_become_error_views() {
            let ctx = RefContext::new(
                BlockResolver::new(Arc::new(UnreadableVault)),
                Arc::new(CmarkRenderer::new()),
                "pages/current.md",
            );

            let state = ctx.settle(id()).await;
            let RefState::Unresolved(Unresolved::Failed(msg)) = &state else {
                panic!("unexpected state {:?}", state);
            };
            assert!(msg.contains("permission denied reading notes/locked.md"));

            let view = BlockRefView {
                state,
                ..BlockRefView::loading(id(), slot())
            };
            let html = view.to_element().to_html();
            assert!(html.contains(&format!("(({ID}))")));
            assert!(html.contains(ERROR_STYLE));
            assert!(html.contains("加载块内容失败: "));
        }

        #[tokio::test]
        async fn spawn_reports_one_completion() {
            let ctx = context(MemoryVault::new(), Arc::new(CmarkRenderer::new()));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let handle = ctx.spawn(PendingRef { id: id(), slot: slot() }, tx);
            handle.await.expect("join");

            let completion = rx.recv().await.expect("completion");
            assert_eq!(completion.slot, slot());
            assert_eq!(completion.state, RefState::Unresolved(Unresolved::NotFound));
            assert!(rx.recv().await.is_none());
        }
    }
}

pub mod static_render {
    //! Reference expansion over an already rendered output tree.

    use crate::render::{
        BLOCK_REF_CLASS, BlockRefView, Element, Node, PendingRef, RefCompletion, RefContext,
        RefSlot,
    };
    use crate::syntax;
    use log::debug;
    use tokio::sync::mpsc;

    const SKIPPED_TAGS: [&str; 2] = ["code", "pre"];

    /// Split text nodes around reference tokens, inserting a loading view per token.
    ///
    /// `code`/`pre` subtrees and existing block-ref output are left alone. Returns the
    /// placeholders in document order.
    pub fn render_block_references(root: &mut Element) -> Vec<PendingRef> {
        let mut pending = Vec::new();
        expand(root, &mut pending);
        pending
    }

    fn expand(el: &mut Element, pending: &mut Vec<PendingRef>) {
        if SKIPPED_TAGS.contains(&el.tag.as_str()) || el.has_class(BLOCK_REF_CLASS) {
            return;
        }
        for child in std::mem::take(&mut el.children) {
            match child {
                Node::Text(text) => split_text(&text, &mut el.children, pending),
                Node::Element(mut inner) => {
                    expand(&mut inner, pending);
                    el.children.push(Node::Element(inner));
                }
                view @ Node::BlockRef(_) => el.children.push(view),
            }
        }
    }

    fn split_text(text: &str, out: &mut Vec<Node>, pending: &mut Vec<PendingRef>) {
        let tokens = syntax::reference_tokens(text);
        if tokens.is_empty() {
            out.push(Node::Text(text.to_string()));
            return;
        }
        let mut last = 0;
        for token in tokens {
            if token.range.start > last {
                out.push(Node::Text(text[last..token.range.start].to_string()));
            }
            let slot = RefSlot {
                generation: 0,
                index: pending.len(),
            };
            debug!("found block reference {}", token.id);
            out.push(Node::BlockRef(BlockRefView::loading(token.id, slot)));
            pending.push(PendingRef { id: token.id, slot });
            last = token.range.end;
        }
        if last < text.len() {
            out.push(Node::Text(text[last..].to_string()));
        }
    }

    /// Install a settled state into the matching placeholder.
    pub fn apply_completion(root: &mut Element, completion: RefCompletion) -> bool {
        match find_view(root, completion.slot) {
            Some(view) if view.id == completion.id => {
                view.state = completion.state;
                true
            }
            _ => false,
        }
    }

    fn find_view(el: &mut Element, slot: RefSlot) -> Option<&mut BlockRefView> {
        for child in el.children.iter_mut() {
            let found = match child {
                Node::BlockRef(view) if view.slot == slot => Some(view),
                Node::Element(inner) => find_view(inner, slot),
                _ => None,
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Expand references in `root` and wait for every resolution. Returns the number of
    /// settled placeholders.
    pub async fn post_process(root: &mut Element, ctx: &RefContext) -> usize {
        let pending = render_block_references(root);
        if pending.is_empty() {
            return 0;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        for p in &pending {
            ctx.spawn(*p, tx.clone());
        }
        drop(tx);

        let mut settled = 0;
        while let Some(completion) = rx.recv().await {
            if apply_completion(root, completion) {
                settled += 1;
            }
        }
        debug!(
            "settled {}/{} block references in {}",
            settled,
            pending.len(),
            ctx.source_path()
        );
        settled
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::BlockId;
        use crate::render::{CmarkRenderer, RefState, Unresolved};
        use crate::resolve::BlockResolver;
        use crate::vault::MemoryVault;
        use std::sync::Arc;

        const ID: &str = "123e4567-e89b-12d3-a456-426614174000";
        const OTHER: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

        fn paragraph(text: &str) -> Element {
            Element::new("div").with_child(Node::Element(Element::new("p").with_text(text)))
        }

        #[test]
        fn splits_text_around_tokens() {
            let mut root = paragraph(&format!("see (({ID})) and (({OTHER})) now"));
            let pending = render_block_references(&mut root);
            assert_eq!(pending.len(), 2);
            assert_eq!(pending[1].slot.index, 1);

            let Node::Element(p) = &root.children[0] else {
                panic!("expected paragraph");
            };
            assert_eq!(p.children.len(), 5);
            assert_eq!(p.children[0], Node::Text("see ".into()));
            assert!(matches!(&p.children[1], Node::BlockRef(v) if v.state == RefState::Loading));
            assert_eq!(p.children[2], Node::Text(" and ".into()));
            assert_eq!(p.children[4], Node::Text(" now".into()));
        }

        #[test]
        fn skips_code_and_existing_views() {
            let token = format!("(({ID}))");
            let mut root = Element::new("div")
                .with_child(Node::Element(Element::new("code").with_text(&token)))
                .with_child(Node::Element(
                    Element::new("pre").with_child(Node::Element(Element::new("span").with_text(&token))),
                ))
                .with_child(Node::Element(
                    Element::new("span").with_class(BLOCK_REF_CLASS).with_text(&token),
                ));
            let before = root.clone();
            assert!(render_block_references(&mut root).is_empty());
            assert_eq!(root, before);
        }

        #[test]
        fn text_without_tokens_is_untouched() {
            let mut root = paragraph("plain ((not-an-id)) text");
            let before = root.clone();
            assert!(render_block_references(&mut root).is_empty());
            assert_eq!(root, before);
        }

        #[tokio::test]
        async fn post_process_settles_every_token() {
            let vault = MemoryVault::new();
            vault.insert("journals/2024_01_01.md", &format!("- Found it ^{ID}"));
            let ctx = RefContext::new(
                BlockResolver::new(Arc::new(vault)),
                Arc::new(CmarkRenderer::new()),
                "pages/current.md",
            );

            let mut root = paragraph(&format!("(({ID})) vs (({OTHER}))"));
            assert_eq!(post_process(&mut root, &ctx).await, 2);

            let html = root.to_html();
            assert!(html.contains("Found it"));
            assert!(html.contains(&format!("title=\"块引用: {ID}\"")));
            assert!(html.contains(&format!("(({OTHER}))")));
            assert!(!html.contains("加载中..."));

            let mut views = Vec::new();
            if let Node::Element(p) = &root.children[0] {
                for child in &p.children {
                    if let Node::BlockRef(view) = child {
                        views.push(view.clone());
                    }
                }
            }
            assert_eq!(views.len(), 2);
            assert_eq!(views[0].id, BlockId::parse(ID).expect("id"));
            assert_eq!(views[1].state, RefState::Unresolved(Unresolved::NotFound));
        }

        #[test]
        fn stale_completion_is_ignored() {
            let mut root = paragraph(&format!("(({ID}))"));
            let pending = render_block_references(&mut root);
            let wrong = RefCompletion {
                id: BlockId::parse(OTHER).expect("id"),
                slot: pending[0].slot,
                state: RefState::Unresolved(Unresolved::NotFound),
            };
            assert!(!apply_completion(&mut root, wrong));
        }
    }
}

pub mod live {
    //! Reference widgets over the visible ranges of an editable document.

    use crate::render::{
        BlockRefView, Element, PendingRef, RefCompletion, RefContext, RefSlot,
    };
    use crate::syntax;
    use log::{debug, warn};
    use std::ops::Range;
    use tokio::{sync::mpsc, task::JoinHandle};

    /// Document text plus the byte ranges currently on screen.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EditorView {
        pub doc: String,
        pub visible_ranges: Vec<Range<usize>>,
    }

    impl EditorView {
        /// Whole document visible.
        pub fn new(doc: impl Into<String>) -> Self {
            let doc = doc.into();
            let visible_ranges = vec![0..doc.len()];
            Self {
                doc,
                visible_ranges,
            }
        }

        pub fn with_visible_ranges(doc: impl Into<String>, ranges: Vec<Range<usize>>) -> Self {
            Self {
                doc: doc.into(),
                visible_ranges: ranges,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ViewUpdate {
        pub view: EditorView,
        pub doc_changed: bool,
        pub viewport_changed: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct BlockRefWidget {
        pub view: BlockRefView,
    }

    impl BlockRefWidget {
        /// Editor events inside the widget are handled by the editor.
        pub fn ignore_event(&self) -> bool {
            false
        }

        pub fn to_element(&self) -> Element {
            self.view.to_element()
        }
    }

    /// Replaces exactly `range` (a token's bytes in the document) with `widget`.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Decoration {
        pub range: Range<usize>,
        pub widget: BlockRefWidget,
    }

    pub fn build_decorations(view: &EditorView, generation: u64) -> Vec<Decoration> {
        let mut out = Vec::new();
        for range in &view.visible_ranges {
            let Some(text) = view.doc.get(range.clone()) else {
                warn!("visible range {:?} is outside the document", range);
                continue;
            };
            for token in syntax::reference_tokens(text) {
                debug!("live preview found block reference {}", token.id);
                let slot = RefSlot {
                    generation,
                    index: out.len(),
                };
                out.push(Decoration {
                    range: range.start + token.range.start..range.start + token.range.end,
                    widget: BlockRefWidget {
                        view: BlockRefView::loading(token.id, slot),
                    },
                });
            }
        }
        out
    }

    #[derive(Debug)]
    pub struct LivePreview {
        view: EditorView,
        generation: u64,
        decorations: Vec<Decoration>,
    }

    impl LivePreview {
        pub fn new(view: EditorView) -> Self {
            let decorations = build_decorations(&view, 0);
            Self {
                view,
                generation: 0,
                decorations,
            }
        }

        /// Rebuild the widget set when the document or viewport changed.
        pub fn update(&mut self, update: ViewUpdate) -> bool {
            if !(update.doc_changed || update.viewport_changed) {
                return false;
            }
            self.view = update.view;
            self.generation += 1;
            self.decorations = build_decorations(&self.view, self.generation);
            true
        }

        pub fn view(&self) -> &EditorView {
            &self.view
        }

        pub fn generation(&self) -> u64 {
            self.generation
        }

        pub fn decorations(&self) -> &[Decoration] {
            &self.decorations
        }

        pub fn spawn_resolutions(
            &self,
            ctx: &RefContext,
            tx: &mpsc::UnboundedSender<RefCompletion>,
        ) -> Vec<JoinHandle<()>> {
            self.decorations
                .iter()
                .map(|d| {
                    let pending = PendingRef {
                        id: d.widget.view.id,
                        slot: d.widget.view.slot,
                    };
                    ctx.spawn(pending, tx.clone())
                })
                .collect()
        }

        /// Install a completion; those from earlier generations are dropped.
        pub fn apply(&mut self, completion: RefCompletion) -> bool {
            if completion.slot.generation != self.generation {
                debug!(
                    "dropping completion from generation {} (now {})",
                    completion.slot.generation, self.generation
                );
                return false;
            }
            match self.decorations.get_mut(completion.slot.index) {
                Some(d) if d.widget.view.id == completion.id => {
                    d.widget.view.state = completion.state;
                    true
                }
                _ => false,
            }
        }

        /// Document text with every widget's text in place of its token.
        pub fn splice(&self) -> String {
            let mut ordered: Vec<&Decoration> = self.decorations.iter().collect();
            ordered.sort_by_key(|d| d.range.start);

            let mut out = String::with_capacity(self.view.doc.len());
            let mut last = 0;
            for d in ordered {
                if d.range.start < last {
                    continue;
                }
                out.push_str(&self.view.doc[last..d.range.start]);
                out.push_str(&d.widget.to_element().text_content());
                last = d.range.end;
            }
            out.push_str(&self.view.doc[last..]);
            out
        }
    }

}

pub mod plugin {
    //! Host-facing entry point: settings, the open-document hook and both render front ends.

    use crate::convert::{Conversion, convert_document};
    use crate::live::{EditorView, LivePreview};
    use crate::render::{Element, MarkdownRenderer, RefContext};
    use crate::resolve::BlockResolver;
    use crate::settings::{Settings, SettingsStore};
    use crate::static_render;
    use crate::vault::{DocumentRef, Vault};
    use anyhow::Result;
    use log::info;
    use std::sync::Arc;

    pub struct LogseqToObsidian {
        vault: Arc<dyn Vault>,
        store: Box<dyn SettingsStore>,
        renderer: Arc<dyn MarkdownRenderer>,
        resolver: BlockResolver,
        settings: Settings,
    }

    impl LogseqToObsidian {
        pub fn load(
            vault: Arc<dyn Vault>,
            store: Box<dyn SettingsStore>,
            renderer: Arc<dyn MarkdownRenderer>,
        ) -> Result<Self> {
            let settings = Settings::load(store.as_ref())?;
            info!("plugin loaded ({:?})", settings);
            Ok(Self {
                resolver: BlockResolver::new(vault.clone()),
                vault,
                store,
                renderer,
                settings,
            })
        }

        pub fn settings(&self) -> Settings {
            self.settings
        }

        pub fn set_convert_todo_to_checkbox(&mut self, value: bool) -> Result<()> {
            self.settings.convert_todo_to_checkbox = value;
            self.settings.save(self.store.as_ref())
        }

        /// React to a document being opened. Non-markdown or absent files are skipped.
        pub async fn on_file_open(&self, file: Option<&DocumentRef>) -> Result<Option<Conversion>> {
            match file {
                Some(doc) if doc.is_markdown() => {
                    let conversion =
                        convert_document(self.vault.as_ref(), doc, &self.settings).await?;
                    Ok(Some(conversion))
                }
                Some(doc) => {
                    info!("skipping non-markdown file {}", doc.path);
                    Ok(None)
                }
                None => {
                    info!("skipping open event without a file");
                    Ok(None)
                }
            }
        }

        pub fn resolver(&self) -> &BlockResolver {
            &self.resolver
        }

        pub fn ref_context(&self, source_path: &str) -> RefContext {
            RefContext::new(self.resolver.clone(), self.renderer.clone(), source_path)
        }

        /// Static front end over rendered output for the document at `source_path`.
        pub async fn post_process(&self, root: &mut Element, source_path: &str) -> usize {
            static_render::post_process(root, &self.ref_context(source_path)).await
        }

        /// Live front end; resolutions render without a source path.
        pub fn live_preview(&self, view: EditorView) -> (LivePreview, RefContext) {
            (LivePreview::new(view), self.ref_context(""))
        }
    }

}
