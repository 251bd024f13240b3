//! Lossless reader/writer for org-mode documents.
//!
//! A document is read line by line into a tree of headlines. Every body line
//! (keywords, drawers, properties, lists, tables, block delimiters, text) is
//! kept with its source line number, and serialization walks those records back
//! in line order. An untouched tree reproduces its source byte for byte, while
//! edits through the query API stay local to the lines they touch.

pub use crate::core::{
    CodeSnippet, Document, Headline, Keyword, Link, ListItem, LoadOptions, OrgError, OrgResult,
    Property, PropertyValue, Section, TableRow, Text, Token,
};
pub use crate::format::serialize;
pub use crate::query::LinkHost;
pub use crate::reader::{parse, parse_with};
pub use crate::storage::{parse_file, parse_file_with};
pub use crate::time::{OrgTime, TimeRange, TimeValue, Timestamp};

pub mod core {
    use crate::time::{OrgTime, TimeRange, TimeValue};
    use serde::Serialize;
    use std::{fmt, path::Path, path::PathBuf};

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        /// Headline bookkeeping no longer matches the star counts that were read.
        #[error("structural error at line {line}: {message}")]
        Structural { line: usize, message: String },
        #[error("document does not round-trip:\n{diff}")]
        RoundTripMismatch { diff: String },
        #[error("malformed time range {0:?}")]
        MalformedTimeRange(String),
        #[error("no projection for {node} at line {line}")]
        UnknownNodeInProjection { node: &'static str, line: usize },
        #[error("link has no source range to rewrite")]
        DetachedLink,
        #[error("reading {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    pub type OrgResult<T> = Result<T, OrgError>;

    /* ---------------------------- Configuration ---------------------------- */

    /// Reader settings.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LoadOptions {
        /// Re-serialize right after reading and fail when the output differs from the input.
        pub extra_cautious: bool,
        /// Lines of context around each hunk of a round-trip diff.
        pub diff_context: usize,
        /// Not-done states used when the document declares no `#+TODO:` line.
        pub todo_keywords: Vec<String>,
        /// Done states used when the document declares no `#+TODO:` line.
        pub done_keywords: Vec<String>,
    }

    impl Default for LoadOptions {
        fn default() -> Self {
            Self {
                extra_cautious: false,
                diff_context: 10,
                todo_keywords: vec!["TODO".to_string()],
                done_keywords: vec!["DONE".to_string()],
            }
        }
    }

    impl LoadOptions {
        pub fn cautious() -> Self {
            Self {
                extra_cautious: true,
                ..Self::default()
            }
        }
    }

    /* ------------------------------ Inline tokens ------------------------------ */

    /// Emphasis kinds, one per marker glyph.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Marker {
        Bold,
        Italic,
        Underline,
        Strike,
        Code,
        Verbatim,
    }

    impl Marker {
        pub fn from_glyph(c: char) -> Option<Self> {
            Some(match c {
                '*' => Marker::Bold,
                '/' => Marker::Italic,
                '_' => Marker::Underline,
                '+' => Marker::Strike,
                '~' => Marker::Code,
                '=' => Marker::Verbatim,
                _ => return None,
            })
        }

        pub fn glyph(self) -> char {
            match self {
                Marker::Bold => '*',
                Marker::Italic => '/',
                Marker::Underline => '_',
                Marker::Strike => '+',
                Marker::Code => '~',
                Marker::Verbatim => '=',
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", content = "value", rename_all = "snake_case")]
    pub enum Token {
        Text(String),
        Open(Marker),
        Close(Marker),
        /// `[[`
        LinkOpen,
        /// `][`
        LinkDescription,
        /// `]]`
        LinkClose,
    }

    impl Token {
        pub fn text(s: impl Into<String>) -> Self {
            Token::Text(s.into())
        }

        pub(crate) fn write_raw(&self, out: &mut String) {
            match self {
                Token::Text(s) => out.push_str(s),
                Token::Open(m) | Token::Close(m) => out.push(m.glyph()),
                Token::LinkOpen => out.push_str("[["),
                Token::LinkDescription => out.push_str("]["),
                Token::LinkClose => out.push_str("]]"),
            }
        }
    }

    /// Handle of a token inside its owning [`Text`]. Ids are never reused, so
    /// they stay valid while other tokens of the same text are replaced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TokenId(u32);

    /// A contiguous run of source lines, tokenized. `line` is the first line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Text {
        pub line: usize,
        slots: Vec<(TokenId, Token)>,
        next_id: u32,
    }

    impl Text {
        pub fn new(line: usize, tokens: Vec<Token>) -> Self {
            let mut text = Self {
                line,
                slots: Vec::with_capacity(tokens.len()),
                next_id: 0,
            };
            text.extend(tokens);
            text
        }

        /// Tokenize `source` (lines already joined with `\n`).
        pub fn parse(line: usize, source: &str) -> Self {
            Self::new(line, crate::inline::tokenize(source))
        }

        pub fn tokens(&self) -> impl Iterator<Item = &Token> + '_ {
            self.slots.iter().map(|(_, token)| token)
        }

        pub(crate) fn slots(&self) -> &[(TokenId, Token)] {
            &self.slots
        }

        pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) {
            for token in tokens {
                let id = self.fresh_id();
                self.slots.push((id, token));
            }
        }

        fn fresh_id(&mut self) -> TokenId {
            let id = TokenId(self.next_id);
            self.next_id += 1;
            id
        }

        /// Exact source text of the run.
        pub fn raw(&self) -> String {
            let mut out = String::new();
            for (_, token) in &self.slots {
                token.write_raw(&mut out);
            }
            out
        }

        /// Text with markers dropped and links shown by description (or target).
        pub fn plain_text(&self) -> String {
            let mut out = String::new();
            let mut link: Option<(String, Option<String>)> = None;
            for token in self.tokens() {
                match token {
                    Token::LinkOpen => link = Some((String::new(), None)),
                    Token::LinkDescription => {
                        if let Some((_, description)) = link.as_mut() {
                            *description = Some(String::new());
                        }
                    }
                    Token::LinkClose => {
                        if let Some((value, description)) = link.take() {
                            match description {
                                Some(d) if !d.is_empty() => out.push_str(&d),
                                _ => out.push_str(&value),
                            }
                        }
                    }
                    Token::Text(s) => match link.as_mut() {
                        Some((value, description)) => {
                            description.as_mut().unwrap_or(value).push_str(s)
                        }
                        None => out.push_str(s),
                    },
                    Token::Open(_) | Token::Close(_) => {}
                }
            }
            out
        }

        pub fn line_count(&self) -> usize {
            self.raw().matches('\n').count() + 1
        }

        pub fn is_blank(&self) -> bool {
            self.raw().trim().is_empty()
        }

        /// Replace everything strictly between the tokens `open` and `close`.
        pub(crate) fn splice_between(
            &mut self,
            open: TokenId,
            close: TokenId,
            tokens: Vec<Token>,
        ) -> bool {
            let Some(start) = self.slots.iter().position(|(id, _)| *id == open) else {
                return false;
            };
            let Some(end) = self.slots[start..]
                .iter()
                .position(|(id, _)| *id == close)
                .map(|offset| start + offset)
            else {
                return false;
            };
            let fresh: Vec<(TokenId, Token)> = tokens
                .into_iter()
                .map(|token| (self.fresh_id(), token))
                .collect();
            self.slots.splice(start + 1..end, fresh);
            true
        }
    }

    /* -------------------------------- Links -------------------------------- */

    /// Which text of a headline (or of the document preamble) a link lives in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TextSlot {
        Title,
        Content(usize),
        ListItemTag(usize),
        ListItemContent(usize),
    }

    /// Child indices from the host down to the owning headline, then the slot.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TextLocation {
        pub path: Vec<usize>,
        pub slot: TextSlot,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct LinkRange {
        pub(crate) location: TextLocation,
        pub(crate) open: TokenId,
        pub(crate) close: TokenId,
    }

    /// A link found in some text. Bracket links remember the tokens that
    /// delimit them so their target and description can be rewritten in place.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Link {
        pub(crate) value: String,
        pub(crate) description: Option<String>,
        #[serde(skip)]
        pub(crate) range: Option<LinkRange>,
    }

    /* ------------------------------ Line records ------------------------------ */

    /// `#+KEY[options]: value`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Keyword {
        pub line: usize,
        pub indentation: String,
        pub key: String,
        /// Bracketed options, brackets included.
        pub options: Option<String>,
        pub spacing: String,
        pub value: String,
    }

    impl Keyword {
        pub fn to_raw(&self) -> String {
            format!(
                "{}#+{}{}:{}{}",
                self.indentation,
                self.key,
                self.options.as_deref().unwrap_or(""),
                self.spacing,
                self.value
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", content = "value", rename_all = "snake_case")]
    pub enum PropertyValue {
        Text(String),
        Time(OrgTime),
        Range(TimeRange),
    }

    impl PropertyValue {
        /// Type a raw property value: time ranges, then timestamps, then plain text.
        pub fn parse(raw: &str) -> OrgResult<Self> {
            Ok(match TimeValue::parse(raw)? {
                Some(TimeValue::Time(time)) => PropertyValue::Time(time),
                Some(TimeValue::Range(range)) => PropertyValue::Range(range),
                None => PropertyValue::Text(raw.trim().to_string()),
            })
        }

        pub fn as_str(&self) -> Option<&str> {
            match self {
                PropertyValue::Text(s) => Some(s),
                _ => None,
            }
        }

        pub fn to_raw(&self) -> String {
            match self {
                PropertyValue::Text(s) => s.clone(),
                PropertyValue::Time(time) => time.to_raw(),
                PropertyValue::Range(range) => range.to_raw(),
            }
        }
    }

    impl fmt::Display for PropertyValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_raw())
        }
    }

    impl From<&str> for PropertyValue {
        fn from(s: &str) -> Self {
            PropertyValue::Text(s.to_string())
        }
    }

    impl From<String> for PropertyValue {
        fn from(s: String) -> Self {
            PropertyValue::Text(s)
        }
    }

    impl From<OrgTime> for PropertyValue {
        fn from(time: OrgTime) -> Self {
            PropertyValue::Time(time)
        }
    }

    impl From<TimeRange> for PropertyValue {
        fn from(range: TimeRange) -> Self {
            PropertyValue::Range(range)
        }
    }

    impl From<TimeValue> for PropertyValue {
        fn from(value: TimeValue) -> Self {
            match value {
                TimeValue::Time(time) => PropertyValue::Time(time),
                TimeValue::Range(range) => PropertyValue::Range(range),
            }
        }
    }

    /// `:KEY: value` inside a property drawer. `plus` marks `:KEY+:` accumulators.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Property {
        pub line: usize,
        pub indentation: String,
        pub key: String,
        pub plus: bool,
        pub spacing: String,
        pub value: PropertyValue,
        /// Source text of the value and what it parsed to; reused while `value` is unchanged.
        source: Option<(String, PropertyValue)>,
    }

    impl Property {
        pub fn new(line: usize, key: impl Into<String>, value: PropertyValue) -> Self {
            Self {
                line,
                indentation: String::new(),
                key: key.into(),
                plus: false,
                spacing: " ".to_string(),
                value,
                source: None,
            }
        }

        pub(crate) fn from_source(
            line: usize,
            indentation: &str,
            key: &str,
            plus: bool,
            spacing: &str,
            raw_value: &str,
        ) -> OrgResult<Self> {
            let value = PropertyValue::parse(raw_value)?;
            Ok(Self {
                line,
                indentation: indentation.to_string(),
                key: key.to_string(),
                plus,
                spacing: spacing.to_string(),
                source: Some((raw_value.to_string(), value.clone())),
                value,
            })
        }

        pub fn to_raw(&self) -> String {
            let value = match &self.source {
                Some((raw, parsed)) if *parsed == self.value => raw.clone(),
                _ => self.value.to_raw(),
            };
            format!(
                "{}:{}{}:{}{}",
                self.indentation,
                self.key,
                if self.plus { "+" } else { "" },
                self.spacing,
                value
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Bullet {
        Symbol(char),
        Counter { value: String, separator: char },
    }

    impl Bullet {
        pub fn is_ordered(&self) -> bool {
            matches!(self, Bullet::Counter { .. })
        }

        fn write(&self, out: &mut String) {
            match self {
                Bullet::Symbol(c) => out.push(*c),
                Bullet::Counter { value, separator } => {
                    out.push_str(value);
                    out.push(*separator);
                }
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Checkbox {
        pub indentation: String,
        /// One of ` `, `X`, `x`, `-`.
        pub mark: char,
    }

    impl Checkbox {
        pub fn is_checked(&self) -> bool {
            matches!(self.mark, 'X' | 'x')
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListItem {
        pub line: usize,
        pub indentation: String,
        pub bullet: Bullet,
        pub checkbox: Option<Checkbox>,
        pub tag_indentation: String,
        /// Term of a description item (`- term :: content`).
        pub tag: Option<Text>,
        pub content: Text,
    }

    impl ListItem {
        /// Merge a continuation line into the item's content.
        pub fn append_line(&mut self, line: &str) {
            self.content
                .extend(crate::inline::tokenize(&format!("\n{line}")));
        }

        /// Last source line covered by the item, continuation lines included.
        pub fn last_line(&self) -> usize {
            self.line + self.content.line_count() - 1
        }

        pub fn to_raw(&self) -> String {
            let mut out = self.indentation.clone();
            self.bullet.write(&mut out);
            out.push(' ');
            if let Some(checkbox) = &self.checkbox {
                out.push_str(&checkbox.indentation);
                out.push('[');
                out.push(checkbox.mark);
                out.push(']');
            }
            if let Some(tag) = &self.tag {
                out.push_str(&self.tag_indentation);
                out.push_str(&tag.raw());
                out.push_str("::");
            }
            out.push_str(&self.content.raw());
            out
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TableRow {
        pub line: usize,
        pub indentation: String,
        pub cells: Vec<String>,
        /// Whether the row ends with `|`.
        pub closed: bool,
        /// Whatever follows the closing `|`.
        pub suffix: String,
    }

    impl TableRow {
        pub fn is_separator(&self) -> bool {
            self.cells
                .first()
                .is_some_and(|cell| cell.trim_start().starts_with('-'))
        }

        pub fn to_raw(&self) -> String {
            let mut out = self.indentation.clone();
            out.push('|');
            out.push_str(&self.cells.join("|"));
            if self.closed {
                out.push('|');
            }
            out.push_str(&self.suffix);
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DelimiterKind {
        Begin,
        End,
    }

    /// `#+BEGIN_<subtype> arguments` / `#+END_<subtype>`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Delimiter {
        pub line: usize,
        pub kind: DelimiterKind,
        pub subtype: String,
        pub arguments: String,
        pub raw: String,
    }

    /// Drawer boundary line, kept verbatim.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StructuralLine {
        pub line: usize,
        pub text: String,
    }

    impl StructuralLine {
        pub fn is_drawer_end(&self) -> bool {
            self.text.trim().eq_ignore_ascii_case(":END:")
        }

        /// Upper-cased drawer name of an opening line.
        pub fn drawer_name(&self) -> Option<String> {
            if self.is_drawer_end() {
                return None;
            }
            let name = self.text.trim().strip_prefix(':')?.strip_suffix(':')?;
            (!name.is_empty()).then(|| name.to_ascii_uppercase())
        }
    }

    /* ------------------------------- Sections ------------------------------- */

    /// Body lines of a headline, or of the document before its first headline.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Section {
        pub keywords: Vec<Keyword>,
        pub properties: Vec<Property>,
        pub structural: Vec<StructuralLine>,
        pub contents: Vec<Text>,
        pub list_items: Vec<ListItem>,
        pub table_rows: Vec<TableRow>,
        pub delimiters: Vec<Delimiter>,
    }

    /// One emittable record of a section.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum SectionItem<'a> {
        Keyword(&'a Keyword),
        Property(&'a Property),
        Content(&'a Text),
        ListItem(&'a ListItem),
        TableRow(&'a TableRow),
        Structural(&'a StructuralLine),
        Delimiter(&'a Delimiter),
    }

    impl SectionItem<'_> {
        pub(crate) fn line(&self) -> usize {
            match self {
                SectionItem::Keyword(k) => k.line,
                SectionItem::Property(p) => p.line,
                SectionItem::Content(t) => t.line,
                SectionItem::ListItem(li) => li.line,
                SectionItem::TableRow(row) => row.line,
                SectionItem::Structural(s) => s.line,
                SectionItem::Delimiter(d) => d.line,
            }
        }

        pub(crate) fn to_raw(&self) -> String {
            match self {
                SectionItem::Keyword(k) => k.to_raw(),
                SectionItem::Property(p) => p.to_raw(),
                SectionItem::Content(t) => t.raw(),
                SectionItem::ListItem(li) => li.to_raw(),
                SectionItem::TableRow(row) => row.to_raw(),
                SectionItem::Structural(s) => s.text.clone(),
                SectionItem::Delimiter(d) => d.raw.clone(),
            }
        }
    }

    impl Section {
        /// All records, stable-sorted by source line.
        pub(crate) fn items(&self) -> Vec<SectionItem<'_>> {
            let mut items: Vec<SectionItem<'_>> = Vec::new();
            items.extend(self.keywords.iter().map(SectionItem::Keyword));
            items.extend(self.contents.iter().map(SectionItem::Content));
            items.extend(self.list_items.iter().map(SectionItem::ListItem));
            items.extend(self.table_rows.iter().map(SectionItem::TableRow));
            items.extend(self.structural.iter().map(SectionItem::Structural));
            items.extend(self.properties.iter().map(SectionItem::Property));
            items.extend(self.delimiters.iter().map(SectionItem::Delimiter));
            items.sort_by_key(SectionItem::line);
            items
        }

        /// First property with this key (case-insensitive).
        pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
            self.properties
                .iter()
                .find(|p| p.key.eq_ignore_ascii_case(key))
                .map(|p| &p.value)
        }

        /// Update the first property with this key, or append a new one after
        /// the existing properties. Without a drawer the new property sorts at
        /// `anchor_line` and its drawer lines are synthesized on output.
        pub(crate) fn set_property(&mut self, key: &str, value: PropertyValue, anchor_line: usize) {
            if let Some(existing) = self
                .properties
                .iter_mut()
                .find(|p| p.key.eq_ignore_ascii_case(key))
            {
                existing.value = value;
                return;
            }
            let drawer_start = self
                .structural
                .iter()
                .find(|s| s.drawer_name().as_deref() == Some("PROPERTIES"))
                .map(|s| s.line);
            let line = self
                .properties
                .last()
                .map(|p| p.line)
                .or(drawer_start)
                .unwrap_or(anchor_line);
            self.properties.push(Property::new(line, key, value));
        }

        pub fn get_keyword(&self, key: &str) -> Option<&str> {
            self.keywords
                .iter()
                .find(|k| k.key.eq_ignore_ascii_case(key))
                .map(|k| k.value.as_str())
        }

        pub(crate) fn text_mut(&mut self, slot: TextSlot) -> Option<&mut Text> {
            match slot {
                TextSlot::Title => None,
                TextSlot::Content(i) => self.contents.get_mut(i),
                TextSlot::ListItemTag(i) => self.list_items.get_mut(i)?.tag.as_mut(),
                TextSlot::ListItemContent(i) => self.list_items.get_mut(i).map(|li| &mut li.content),
            }
        }
    }

    /* ------------------------------- Planning ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum PlanningKeyword {
        Scheduled,
        Closed,
        Deadline,
    }

    impl PlanningKeyword {
        pub const ALL: [PlanningKeyword; 3] = [
            PlanningKeyword::Scheduled,
            PlanningKeyword::Closed,
            PlanningKeyword::Deadline,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                PlanningKeyword::Scheduled => "SCHEDULED",
                PlanningKeyword::Closed => "CLOSED",
                PlanningKeyword::Deadline => "DEADLINE",
            }
        }
    }

    /// One `KEYWORD: <time>` assignment as it appeared on the planning line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct PlanningEntry {
        pub(crate) keyword: PlanningKeyword,
        pub(crate) gap: String,
        pub(crate) raw: String,
        pub(crate) trailing: String,
        pub(crate) parsed: TimeValue,
    }

    /// SCHEDULED / CLOSED / DEADLINE of a headline.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Planning {
        pub scheduled: Option<TimeValue>,
        pub closed: Option<TimeValue>,
        pub deadline: Option<TimeValue>,
        pub(crate) indentation: String,
        /// Source order of the entries.
        pub(crate) entries: Vec<PlanningEntry>,
    }

    impl Planning {
        pub fn get(&self, keyword: PlanningKeyword) -> Option<&TimeValue> {
            match keyword {
                PlanningKeyword::Scheduled => self.scheduled.as_ref(),
                PlanningKeyword::Closed => self.closed.as_ref(),
                PlanningKeyword::Deadline => self.deadline.as_ref(),
            }
        }

        pub fn slot_mut(&mut self, keyword: PlanningKeyword) -> &mut Option<TimeValue> {
            match keyword {
                PlanningKeyword::Scheduled => &mut self.scheduled,
                PlanningKeyword::Closed => &mut self.closed,
                PlanningKeyword::Deadline => &mut self.deadline,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.scheduled.is_none() && self.closed.is_none() && self.deadline.is_none()
        }

        /// Planning line in source order; keywords set after reading go last.
        pub(crate) fn to_raw(&self) -> Option<String> {
            if self.is_empty() {
                return None;
            }
            let mut out = self.indentation.clone();
            let mut edited = false;
            for entry in &self.entries {
                let Some(value) = self.get(entry.keyword) else {
                    edited = true;
                    continue;
                };
                out.push_str(entry.keyword.as_str());
                out.push(':');
                out.push_str(&entry.gap);
                if *value == entry.parsed {
                    out.push_str(&entry.raw);
                } else {
                    out.push_str(&value.to_raw());
                }
                out.push_str(&entry.trailing);
            }
            for keyword in PlanningKeyword::ALL {
                if self.entries.iter().any(|e| e.keyword == keyword) {
                    continue;
                }
                if let Some(value) = self.get(keyword) {
                    edited = true;
                    if out.len() > self.indentation.len() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    out.push_str(keyword.as_str());
                    out.push_str(": ");
                    out.push_str(&value.to_raw());
                }
            }
            if edited {
                out.truncate(out.trim_end().len());
            }
            Some(out)
        }
    }

    /* ------------------------------- Headlines ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TodoState {
        pub keyword: String,
        pub done: bool,
        #[serde(skip)]
        pub(crate) separator: String,
    }

    impl TodoState {
        pub fn new(keyword: impl Into<String>, done: bool) -> Self {
            Self {
                keyword: keyword.into(),
                done,
                separator: " ".to_string(),
            }
        }
    }

    /// `[#A]` cookie.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Priority {
        pub value: char,
        pub(crate) spacing: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Headline {
        pub start_line: usize,
        pub depth: usize,
        pub(crate) spacing: String,
        pub state: Option<TodoState>,
        pub priority: Option<Priority>,
        pub title: Text,
        pub(crate) shallow_tags: Vec<String>,
        /// Effective tags of the parent, nearest ancestor first.
        pub(crate) parent_tags: Vec<String>,
        pub(crate) tags_padding: String,
        pub(crate) tags_trailing: String,
        pub planning: Planning,
        pub section: Section,
        pub children: Vec<Headline>,
    }

    impl Headline {
        /// Own tags followed by every ancestor's own tags, nearest first.
        pub fn tags(&self) -> Vec<String> {
            self.shallow_tags
                .iter()
                .chain(&self.parent_tags)
                .cloned()
                .collect()
        }

        pub fn shallow_tags(&self) -> &[String] {
            &self.shallow_tags
        }

        pub fn title_text(&self) -> String {
            self.title.plain_text()
        }

        pub fn is_todo(&self) -> bool {
            self.state.as_ref().is_some_and(|s| !s.done)
        }

        pub fn is_done(&self) -> bool {
            self.state.as_ref().is_some_and(|s| s.done)
        }

        pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
            self.section.get_property(key)
        }

        pub fn set_property(&mut self, key: &str, value: impl Into<PropertyValue>) {
            self.section
                .set_property(key, value.into(), self.start_line);
        }

        pub fn id(&self) -> Option<&str> {
            self.get_property("ID").and_then(PropertyValue::as_str)
        }

        pub fn set_id(&mut self, id: impl Into<String>) {
            self.set_property("ID", PropertyValue::Text(id.into()));
        }

        /// The `ID` property, assigning a random one first when missing.
        pub fn ensure_id(&mut self) -> String {
            if let Some(id) = self.id() {
                return id.to_string();
            }
            let id = uuid::Uuid::new_v4().to_string();
            self.set_id(id.clone());
            id
        }

        pub fn scheduled(&self) -> Option<&TimeValue> {
            self.planning.scheduled.as_ref()
        }

        pub fn closed(&self) -> Option<&TimeValue> {
            self.planning.closed.as_ref()
        }

        pub fn deadline(&self) -> Option<&TimeValue> {
            self.planning.deadline.as_ref()
        }

        pub fn scheduled_mut(&mut self) -> Option<&mut TimeValue> {
            self.planning.scheduled.as_mut()
        }

        pub fn closed_mut(&mut self) -> Option<&mut TimeValue> {
            self.planning.closed.as_mut()
        }

        pub fn deadline_mut(&mut self) -> Option<&mut TimeValue> {
            self.planning.deadline.as_mut()
        }

        pub fn set_scheduled(&mut self, value: Option<TimeValue>) {
            self.planning.scheduled = value;
        }

        pub fn set_closed(&mut self, value: Option<TimeValue>) {
            self.planning.closed = value;
        }

        pub fn set_deadline(&mut self, value: Option<TimeValue>) {
            self.planning.deadline = value;
        }

        /// Append an empty child one level deeper and hand it back for editing.
        pub fn create_headline_at_end(&mut self) -> &mut Headline {
            self.children.push(Headline {
                start_line: self.start_line,
                depth: self.depth + 1,
                spacing: " ".to_string(),
                state: None,
                priority: None,
                title: Text::new(self.start_line, Vec::new()),
                shallow_tags: Vec::new(),
                parent_tags: self.tags(),
                tags_padding: String::new(),
                tags_trailing: String::new(),
                planning: Planning::default(),
                section: Section::default(),
                children: Vec::new(),
            });
            let last = self.children.len() - 1;
            &mut self.children[last]
        }

        pub(crate) fn text_slot_mut(&mut self, slot: TextSlot) -> Option<&mut Text> {
            match slot {
                TextSlot::Title => Some(&mut self.title),
                other => self.section.text_mut(other),
            }
        }
    }

    /* ------------------------------- Document ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Document {
        pub(crate) path: Option<PathBuf>,
        pub(crate) todo_keywords: Vec<String>,
        pub(crate) done_keywords: Vec<String>,
        /// Lines before the first headline.
        pub section: Section,
        pub headlines: Vec<Headline>,
    }

    impl Document {
        /// Absolute path of the file this document was read from.
        pub fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }

        pub fn todo_keywords(&self) -> &[String] {
            &self.todo_keywords
        }

        pub fn done_keywords(&self) -> &[String] {
            &self.done_keywords
        }

        pub fn keywords(&self) -> &[Keyword] {
            &self.section.keywords
        }

        pub fn get_keyword(&self, key: &str) -> Option<&str> {
            self.section.get_keyword(key)
        }

        pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
            self.section.get_property(key)
        }

        pub fn set_property(&mut self, key: &str, value: impl Into<PropertyValue>) {
            self.section.set_property(key, value.into(), 0);
        }

        pub fn id(&self) -> Option<&str> {
            self.get_property("ID").and_then(PropertyValue::as_str)
        }

        pub fn top_headlines(&self) -> &[Headline] {
            &self.headlines
        }

        pub fn top_headlines_mut(&mut self) -> &mut [Headline] {
            &mut self.headlines
        }

        /// Every headline, pre-order.
        pub fn all_headlines(&self) -> AllHeadlines<'_> {
            AllHeadlines {
                stack: self.headlines.iter().rev().collect(),
            }
        }

        /// Headline reached by following child indices from the top level.
        pub fn headline_mut(&mut self, path: &[usize]) -> Option<&mut Headline> {
            let (&first, rest) = path.split_first()?;
            let mut node = self.headlines.get_mut(first)?;
            for &index in rest {
                node = node.children.get_mut(index)?;
            }
            Some(node)
        }
    }

    pub struct AllHeadlines<'a> {
        stack: Vec<&'a Headline>,
    }

    impl<'a> Iterator for AllHeadlines<'a> {
        type Item = &'a Headline;

        fn next(&mut self) -> Option<Self::Item> {
            let next = self.stack.pop()?;
            self.stack.extend(next.children.iter().rev());
            Some(next)
        }
    }

    /// A `#+BEGIN_SRC` block and its evaluation result, if one was recorded.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CodeSnippet {
        pub name: Option<String>,
        pub content: String,
        pub result: Option<String>,
        pub arguments: Option<String>,
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::inline::tokenize;

        #[test]
        fn splice_keeps_neighbouring_tokens() {
            let mut text = Text::new(1, tokenize("see [[a][b]] and [[c]]"));
            let ids: Vec<TokenId> = text.slots().iter().map(|(id, _)| *id).collect();
            // see, [[, a, ][, b, ]], " and ", [[, c, ]]
            assert!(text.splice_between(ids[1], ids[5], vec![Token::text("longer-target")]));
            assert_eq!(text.raw(), "see [[longer-target]] and [[c]]");
            assert!(text.splice_between(ids[7], ids[9], vec![Token::text("d")]));
            assert_eq!(text.raw(), "see [[longer-target]] and [[d]]");
        }

        #[test]
        fn plain_text_prefers_descriptions() {
            let text = Text::parse(1, "a *b* [[url][desc]] [[bare]]");
            assert_eq!(text.plain_text(), "a b desc bare");
        }

        #[test]
        fn table_row_renders_suffix_and_separator() {
            let row = TableRow {
                line: 1,
                indentation: "  ".into(),
                cells: vec!["---+---".into()],
                closed: true,
                suffix: " ".into(),
            };
            assert!(row.is_separator());
            assert_eq!(row.to_raw(), "  |---+---| ");
        }

        #[test]
        fn planning_keeps_order_and_appends_new_keywords() {
            let mut planning = crate::time::parse_planning("DEADLINE: <2020-12-14>  SCHEDULED: <2020-12-12>")
                .expect("planning");
            assert_eq!(
                planning.to_raw().as_deref(),
                Some("DEADLINE: <2020-12-14>  SCHEDULED: <2020-12-12>")
            );
            planning.closed = crate::time::TimeValue::parse("[2020-12-13]").expect("time");
            assert_eq!(
                planning.to_raw().as_deref(),
                Some("DEADLINE: <2020-12-14>  SCHEDULED: <2020-12-12> CLOSED: [2020-12-13]")
            );
        }

        #[test]
        fn structural_line_names() {
            let open = StructuralLine { line: 1, text: "  :logbook:".into() };
            let end = StructuralLine { line: 2, text: ":end: ".into() };
            assert_eq!(open.drawer_name().as_deref(), Some("LOGBOOK"));
            assert!(end.is_drawer_end());
            assert_eq!(end.drawer_name(), None);
        }
    }
}

pub mod time {
    //! Timestamps, time ranges and the planning line, with the nom grammar that reads them.

    use crate::core::{OrgError, OrgResult, Planning, PlanningEntry, PlanningKeyword};
    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use log::debug;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{all_consuming, opt, recognize, verify},
        error::{VerboseError, VerboseErrorKind},
        multi::many0,
        sequence::{pair, preceded, tuple},
    };
    use serde::Serialize;
    use std::cmp::Ordering;

    /* ------------------------------- Values ------------------------------- */

    /// A single org timestamp. The day-of-week label is kept as written and
    /// dropped whenever the date changes.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Timestamp {
        active: bool,
        year: i32,
        month: u32,
        day: u32,
        dow: Option<String>,
        hour: Option<u32>,
        minute: Option<u32>,
        repetition: Option<String>,
    }

    /// Chronological order. A missing time of day sorts as midnight; the
    /// remaining fields only break ties.
    impl Ord for Timestamp {
        fn cmp(&self, other: &Self) -> Ordering {
            self.instant()
                .cmp(&other.instant())
                .then_with(|| (self.hour, self.minute).cmp(&(other.hour, other.minute)))
                .then_with(|| self.active.cmp(&other.active))
                .then_with(|| self.dow.cmp(&other.dow))
                .then_with(|| self.repetition.cmp(&other.repetition))
        }
    }

    impl PartialOrd for Timestamp {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Timestamp {
        pub fn new(active: bool, year: i32, month: u32, day: u32) -> Self {
            Self {
                active,
                year,
                month,
                day,
                dow: None,
                hour: None,
                minute: None,
                repetition: None,
            }
        }

        pub fn with_dow(mut self, dow: impl Into<String>) -> Self {
            self.dow = Some(dow.into());
            self
        }

        pub fn with_time(mut self, hour: u32, minute: u32) -> Self {
            self.hour = Some(hour);
            self.minute = Some(minute);
            self
        }

        pub fn with_repetition(mut self, repetition: impl Into<String>) -> Self {
            self.repetition = Some(repetition.into());
            self
        }

        pub fn active(&self) -> bool {
            self.active
        }

        pub fn year(&self) -> i32 {
            self.year
        }

        pub fn month(&self) -> u32 {
            self.month
        }

        pub fn day(&self) -> u32 {
            self.day
        }

        pub fn dow(&self) -> Option<&str> {
            self.dow.as_deref()
        }

        pub fn hour(&self) -> Option<u32> {
            self.hour
        }

        pub fn minute(&self) -> Option<u32> {
            self.minute
        }

        pub fn repetition(&self) -> Option<&str> {
            self.repetition.as_deref()
        }

        pub fn set_active(&mut self, active: bool) {
            self.active = active;
        }

        pub fn set_year(&mut self, year: i32) {
            self.year = year;
            self.dow = None;
        }

        pub fn set_month(&mut self, month: u32) {
            self.month = month;
            self.dow = None;
        }

        pub fn set_day(&mut self, day: u32) {
            self.day = day;
            self.dow = None;
        }

        pub fn set_time(&mut self, time: Option<(u32, u32)>) {
            self.hour = time.map(|(h, _)| h);
            self.minute = time.map(|(_, m)| m);
        }

        pub fn set_repetition(&mut self, repetition: Option<String>) {
            self.repetition = repetition;
        }

        fn instant(&self) -> (i32, u32, u32, u32, u32) {
            (
                self.year,
                self.month,
                self.day,
                self.hour.unwrap_or(0),
                self.minute.unwrap_or(0),
            )
        }

        /// Midnight when the timestamp carries no time of day.
        pub fn to_datetime(&self) -> Option<NaiveDateTime> {
            let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day)?;
            let time = NaiveTime::from_hms_opt(self.hour.unwrap_or(0), self.minute.unwrap_or(0), 0)?;
            Some(date.and_time(time))
        }

        /// Shifted copy. The day-of-week label is dropped and a time of day is
        /// kept when there was one or the shift lands off midnight.
        pub fn checked_add(&self, delta: Duration) -> Option<Self> {
            let shifted = self.to_datetime()?.checked_add_signed(delta)?;
            let keep_time =
                self.hour.is_some() || shifted.hour() != 0 || shifted.minute() != 0;
            Some(Self {
                active: self.active,
                year: shifted.year(),
                month: shifted.month(),
                day: shifted.day(),
                dow: None,
                hour: keep_time.then(|| shifted.hour()),
                minute: keep_time.then(|| shifted.minute()),
                repetition: self.repetition.clone(),
            })
        }

        fn render(&self, end: Option<&Timestamp>) -> String {
            let mut body = format!("{}-{:02}-{:02}", self.year, self.month, self.day);
            if let Some(dow) = &self.dow {
                body.push(' ');
                body.push_str(dow);
            }
            if let Some(hour) = self.hour {
                body.push_str(&format!(" {:02}:{:02}", hour, self.minute.unwrap_or(0)));
                if let Some(end) = end {
                    body.push_str(&format!(
                        "-{:02}:{:02}",
                        end.hour.unwrap_or(0),
                        end.minute.unwrap_or(0)
                    ));
                }
            }
            if let Some(repetition) = &self.repetition {
                body.push(' ');
                body.push_str(repetition);
            }
            if self.active {
                format!("<{body}>")
            } else {
                format!("[{body}]")
            }
        }

        pub fn to_raw(&self) -> String {
            self.render(None)
        }
    }

    /// A timestamp, possibly with a same-day end time (`<2020-12-15 10:00-11:30>`).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct OrgTime {
        pub time: Timestamp,
        pub end_time: Option<Timestamp>,
    }

    impl OrgTime {
        pub fn new(time: Timestamp) -> Self {
            Self { time, end_time: None }
        }

        /// Parse a whole value (surrounding whitespace allowed) as one timestamp.
        pub fn parse(value: &str) -> Option<Self> {
            all_consuming(org_time)(value.trim()).ok().map(|(_, t)| t)
        }

        pub fn to_raw(&self) -> String {
            self.time.render(self.end_time.as_ref())
        }

        pub fn duration(&self) -> Duration {
            match (&self.end_time, self.time.to_datetime()) {
                (Some(end), Some(start)) => end
                    .to_datetime()
                    .map_or_else(Duration::zero, |end| end - start),
                _ => Duration::zero(),
            }
        }
    }

    /// `<start>--<end>`
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TimeRange {
        pub start: OrgTime,
        pub end: OrgTime,
    }

    impl TimeRange {
        pub fn to_raw(&self) -> String {
            format!("{}--{}", self.start.to_raw(), self.end.to_raw())
        }

        pub fn duration(&self) -> Option<Duration> {
            Some(self.end.time.to_datetime()? - self.start.time.to_datetime()?)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum TimeValue {
        Time(OrgTime),
        Range(TimeRange),
    }

    impl TimeValue {
        /// Detect a time range or a single timestamp. A value shaped like a
        /// range whose halves do not parse is an error; anything else that is
        /// not a timestamp yields `None`.
        pub fn parse(value: &str) -> OrgResult<Option<Self>> {
            let trimmed = value.trim();
            let delimiters = trimmed.matches(">--<").count() + trimmed.matches("]--[").count();
            if delimiters == 1 {
                // Clock lines append `=> H:MM`.
                let body = trimmed.split('=').next().unwrap_or(trimmed).trim_end();
                let Some((start, end)) = body.split_once("--") else {
                    return Err(OrgError::MalformedTimeRange(value.to_string()));
                };
                return match (OrgTime::parse(start), OrgTime::parse(end)) {
                    (Some(start), Some(end)) => Ok(Some(TimeValue::Range(TimeRange { start, end }))),
                    _ => Err(OrgError::MalformedTimeRange(value.to_string())),
                };
            }
            Ok(OrgTime::parse(trimmed).map(TimeValue::Time))
        }

        pub fn to_raw(&self) -> String {
            match self {
                TimeValue::Time(time) => time.to_raw(),
                TimeValue::Range(range) => range.to_raw(),
            }
        }

        /// The single timestamp, or the start of a range.
        pub fn as_time(&self) -> &OrgTime {
            match self {
                TimeValue::Time(time) => time,
                TimeValue::Range(range) => &range.start,
            }
        }

        pub fn as_time_mut(&mut self) -> &mut OrgTime {
            match self {
                TimeValue::Time(time) => time,
                TimeValue::Range(range) => &mut range.start,
            }
        }
    }

    impl From<OrgTime> for TimeValue {
        fn from(time: OrgTime) -> Self {
            TimeValue::Time(time)
        }
    }

    impl From<TimeRange> for TimeValue {
        fn from(range: TimeRange) -> Self {
            TimeValue::Range(range)
        }
    }

    /* ------------------------------- Grammar ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn org_time(i: &str) -> PResult<'_, OrgTime> {
        let (i, open) = one_of("<[")(i)?;
        let (i, (year, _, month, _, day)) =
            tuple((int::<i32>(4, 4), char('-'), int::<u32>(2, 2), char('-'), int::<u32>(2, 2)))(i)?;
        let (i, dow) = opt(preceded(space1, day_name))(i)?;
        let (i, clock) = opt(preceded(
            space1,
            pair(clock, opt(preceded(take_while1(|c: char| c == '-'), clock))),
        ))(i)?;
        let (i, repetition) = opt(preceded(space1, repetition))(i)?;
        let (i, _) = char(if open == '<' { '>' } else { ']' })(i)?;

        let mut time = Timestamp::new(open == '<', year, month, day);
        time.dow = dow.map(str::to_string);
        time.repetition = repetition.map(str::to_string);
        let mut end_time = None;
        if let Some(((hour, minute), end)) = clock {
            time = time.with_time(hour, minute);
            if let Some((end_hour, end_minute)) = end {
                let mut end = time.clone().with_time(end_hour, end_minute);
                end.repetition = None;
                end_time = Some(end);
            }
        }
        Ok((i, OrgTime { time, end_time }))
    }

    fn day_name(i: &str) -> PResult<'_, &str> {
        verify(
            take_till1(|c: char| c.is_whitespace() || c == '>' || c == ']'),
            |s: &str| !s.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | '.')),
        )(i)
    }

    fn clock(i: &str) -> PResult<'_, (u32, u32)> {
        let (i, (hour, _, minute)) = tuple((int::<u32>(1, 2), char(':'), int::<u32>(1, 2)))(i)?;
        Ok((i, (hour, minute)))
    }

    /// Repeater and warning-delay cookies: `+1w`, `++2d`, `.+1m`, `-3d`, `--1y`.
    fn repetition(i: &str) -> PResult<'_, &str> {
        fn cookie(i: &str) -> PResult<'_, &str> {
            recognize(tuple((
                alt((tag("++"), tag(".+"), tag("+"), tag("--"), tag("-"))),
                digit1,
                one_of("hdwmy"),
            )))(i)
        }
        recognize(pair(cookie, many0(preceded(space1, cookie))))(i)
    }

    fn int<T: std::str::FromStr>(m: usize, n: usize) -> impl Fn(&str) -> PResult<'_, T> {
        move |i: &str| {
            let (rest, digits) = take_while_m_n(m, n, char_is_digit)(i)?;
            match digits.parse::<T>() {
                Ok(value) => Ok((rest, value)),
                Err(_) => Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("int"))],
                })),
            }
        }
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    /* ----------------------------- Planning line ----------------------------- */

    fn planning_keyword(i: &str) -> PResult<'_, PlanningKeyword> {
        let (i, keyword) = alt((tag("SCHEDULED:"), tag("CLOSED:"), tag("DEADLINE:")))(i)?;
        let keyword = match keyword {
            "SCHEDULED:" => PlanningKeyword::Scheduled,
            "CLOSED:" => PlanningKeyword::Closed,
            _ => PlanningKeyword::Deadline,
        };
        Ok((i, keyword))
    }

    fn planning_entry(i: &str) -> PResult<'_, (PlanningKeyword, &str, &str, &str)> {
        let (i, keyword) = planning_keyword(i)?;
        let (i, gap) = space0(i)?;
        let (i, raw) = recognize(pair(org_time, opt(preceded(tag("--"), org_time))))(i)?;
        let (i, trailing) = space0(i)?;
        Ok((i, (keyword, gap, raw, trailing)))
    }

    /// Read a line made only of `SCHEDULED:`/`CLOSED:`/`DEADLINE:` entries.
    /// Spacing and entry order are kept so the line reproduces unchanged.
    pub fn parse_planning(line: &str) -> Option<Planning> {
        let (mut rest, indentation) = space0::<_, VerboseError<&str>>(line).ok()?;
        let mut planning = Planning {
            indentation: indentation.to_string(),
            ..Planning::default()
        };
        while !rest.is_empty() {
            let (next, (keyword, gap, raw, trailing)) = planning_entry(rest).ok()?;
            if planning.get(keyword).is_some() {
                debug!("repeated {} on planning line, reading it as text", keyword.as_str());
                return None;
            }
            let parsed = TimeValue::parse(raw).ok()??;
            *planning.slot_mut(keyword) = Some(parsed.clone());
            planning.entries.push(PlanningEntry {
                keyword,
                gap: gap.to_string(),
                raw: raw.to_string(),
                trailing: trailing.to_string(),
                parsed,
            });
            rest = next;
        }
        (!planning.entries.is_empty()).then_some(planning)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_dow_and_keeps_it_on_output() {
            let t = OrgTime::parse("<2020-12-12 Sáb>").expect("time");
            assert_eq!(t.time, Timestamp::new(true, 2020, 12, 12).with_dow("Sáb"));
            assert_eq!(t.to_raw(), "<2020-12-12 Sáb>");
        }

        #[test]
        fn date_change_drops_dow() {
            let mut t = OrgTime::parse("[2020-12-13 Dom 10:00]").expect("time");
            t.time.set_day(16);
            assert_eq!(t.to_raw(), "[2020-12-16 10:00]");
        }

        #[test]
        fn month_and_year_changes_drop_dow() {
            let mut t = OrgTime::parse("<2020-12-12 Sáb 09:30>").expect("time");
            t.time.set_month(11);
            assert_eq!(t.to_raw(), "<2020-11-12 09:30>");

            let mut t = OrgTime::parse("<2020-12-12 Sáb +1m>").expect("time");
            t.time.set_year(2021);
            assert_eq!(t.time.dow(), None);
            assert_eq!(t.to_raw(), "<2021-12-12 +1m>");
        }

        #[test]
        fn timestamps_sort_chronologically() {
            let morning = Timestamp::new(true, 2020, 12, 12).with_time(9, 0);
            let labelled = Timestamp::new(false, 2020, 12, 12).with_dow("Sáb");
            let next_month = Timestamp::new(true, 2021, 1, 1);
            assert!(labelled < morning);
            assert!(morning < next_month);
            assert!(next_month > labelled);

            let mut sorted = vec![next_month.clone(), morning.clone(), labelled.clone()];
            sorted.sort();
            assert_eq!(sorted, [labelled, morning, next_month]);

            let bare = Timestamp::new(true, 2020, 12, 12);
            let midnight = Timestamp::new(true, 2020, 12, 12).with_time(0, 0);
            assert!(bare < midnight);
            assert_eq!(bare.cmp(&bare.clone()), Ordering::Equal);
        }

        #[test]
        fn same_day_end_time_and_repetition() {
            let t = OrgTime::parse("<2020-12-15 Mar 00:05-00:10 ++1w>").expect("time");
            assert_eq!(t.time.hour(), Some(0));
            assert_eq!(t.time.repetition(), Some("++1w"));
            let end = t.end_time.as_ref().expect("end");
            assert_eq!((end.hour(), end.minute()), (Some(0), Some(10)));
            assert_eq!(t.duration(), Duration::minutes(5));
            assert_eq!(t.to_raw(), "<2020-12-15 Mar 00:05-00:10 ++1w>");
        }

        #[test]
        fn ranges_and_malformed_ranges() {
            let v = TimeValue::parse("[2020-01-01 10:00]--[2020-01-01 11:30] =>  1:30")
                .expect("parse")
                .expect("range");
            let TimeValue::Range(range) = &v else {
                panic!("expected range, got {v:?}");
            };
            assert_eq!(range.duration(), Some(Duration::minutes(90)));
            assert!(matches!(
                TimeValue::parse("<2020-01-01>--<nope>"),
                Err(OrgError::MalformedTimeRange(_))
            ));
            assert_eq!(TimeValue::parse("just text").expect("parse"), None);
        }

        #[test]
        fn checked_add_drops_dow_and_midnight() {
            let t = Timestamp::new(true, 2020, 12, 31).with_dow("Thu");
            let next = t.checked_add(Duration::days(1)).expect("add");
            assert_eq!(next.to_raw(), "<2021-01-01>");
            let later = t.checked_add(Duration::hours(3)).expect("add");
            assert_eq!(later.to_raw(), "<2020-12-31 03:00>");
        }

        #[test]
        fn planning_requires_only_entries() {
            let p = parse_planning("  CLOSED: [2020-12-13]   SCHEDULED: <2020-12-12 Sáb> ")
                .expect("planning");
            assert_eq!(p.indentation, "  ");
            assert_eq!(
                p.entries.iter().map(|e| e.keyword).collect::<Vec<_>>(),
                vec![PlanningKeyword::Closed, PlanningKeyword::Scheduled]
            );
            assert!(parse_planning("SCHEDULED: <2020-12-12> and more").is_none());
            assert!(parse_planning("Some text").is_none());
            assert!(parse_planning("").is_none());
        }
    }
}

pub mod inline {
    //! Inline tokenizer: emphasis markers and bracket links over a run of lines.

    use crate::core::{Marker, Token};
    use std::collections::HashMap;

    fn is_pre(c: Option<char>) -> bool {
        match c {
            None => true,
            Some(c) => c.is_whitespace() || matches!(c, '-' | '(' | '{' | '\'' | '"'),
        }
    }

    fn is_border(c: char) -> bool {
        !c.is_whitespace()
    }

    struct LinkSpan {
        target: String,
        description: Option<String>,
        end: usize,
    }

    /// `[[target]]` or `[[target][description]]` starting at `i`. A `]` inside
    /// the target that is not followed by `]` or `[` means this is not a link.
    fn scan_link(chars: &[char], i: usize) -> Option<LinkSpan> {
        if chars.get(i) != Some(&'[') || chars.get(i + 1) != Some(&'[') {
            return None;
        }
        if matches!(chars.get(i + 2), None | Some('[')) {
            return None;
        }
        let start = i + 2;
        let close = start + chars[start..].iter().position(|c| *c == ']')?;
        if close == start {
            return None;
        }
        let target: String = chars[start..close].iter().collect();
        match chars.get(close + 1) {
            Some(']') => Some(LinkSpan {
                target,
                description: None,
                end: close + 2,
            }),
            Some('[') => {
                let from = close + 2;
                let rel = chars[from..].windows(2).position(|w| w == [']', ']'])?;
                Some(LinkSpan {
                    target,
                    description: Some(chars[from..from + rel].iter().collect()),
                    end: from + rel + 2,
                })
            }
            _ => None,
        }
    }

    /// Position of the marker closing the one opened at `open`, on the same
    /// line. Bracket links are skipped whole; a claimed position is never reused.
    fn find_close(chars: &[char], open: usize, closes: &HashMap<usize, Marker>) -> Option<usize> {
        let glyph = chars[open];
        let mut j = open + 1;
        while j + 1 < chars.len() {
            if chars[j] == '\n' {
                return None;
            }
            if let Some(link) = scan_link(chars, j) {
                j = link.end;
                if chars.get(j) == Some(&glyph)
                    && !closes.contains_key(&j)
                    && chars[j - 1] == ']'
                {
                    return Some(j);
                }
                continue;
            }
            if is_border(chars[j]) && chars[j + 1] == glyph && !closes.contains_key(&(j + 1)) {
                return Some(j + 1);
            }
            j += 1;
        }
        None
    }

    pub fn tokenize(source: &str) -> Vec<Token> {
        let chars: Vec<char> = source.chars().collect();
        let mut out = Vec::new();
        let mut text = String::new();
        let mut closes: HashMap<usize, Marker> = HashMap::new();

        fn flush(text: &mut String, out: &mut Vec<Token>) {
            if !text.is_empty() {
                out.push(Token::Text(std::mem::take(text)));
            }
        }

        let mut i = 0;
        while i < chars.len() {
            if let Some(marker) = closes.remove(&i) {
                flush(&mut text, &mut out);
                out.push(Token::Close(marker));
                i += 1;
                continue;
            }
            if let Some(link) = scan_link(&chars, i) {
                flush(&mut text, &mut out);
                out.push(Token::LinkOpen);
                out.push(Token::Text(link.target));
                if let Some(description) = link.description {
                    out.push(Token::LinkDescription);
                    if !description.is_empty() {
                        out.push(Token::Text(description));
                    }
                }
                out.push(Token::LinkClose);
                i = link.end;
                continue;
            }
            let c = chars[i];
            if let Some(marker) = Marker::from_glyph(c) {
                let prev = i.checked_sub(1).map(|p| chars[p]);
                let next_is_border = chars.get(i + 1).is_some_and(|n| is_border(*n));
                if is_pre(prev) && next_is_border {
                    if let Some(close) = find_close(&chars, i, &closes) {
                        closes.insert(close, marker);
                        flush(&mut text, &mut out);
                        out.push(Token::Open(marker));
                        i += 1;
                        continue;
                    }
                }
            }
            text.push(c);
            i += 1;
        }
        flush(&mut text, &mut out);
        out
    }

    /// Bare `http:`/`https:` URLs in plain text, trimmed to end on an alphanumeric.
    pub fn implicit_links(text: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut rest = text;
        while let Some(at) = rest.find("http") {
            let candidate = &rest[at..];
            let scheme = if candidate.starts_with("https:") {
                6
            } else if candidate.starts_with("http:") {
                5
            } else {
                rest = &candidate[4..];
                continue;
            };
            let len = candidate
                .find(|c: char| c.is_whitespace() || c == '<' || c == '>')
                .unwrap_or(candidate.len());
            let url = candidate[..len].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
            if url.len() > scheme {
                found.push(url.to_string());
            }
            rest = &candidate[len.max(scheme)..];
        }
        found
    }

}

pub mod classify {
    //! Line classifier. Patterns are tried in a fixed priority order and the
    //! first match wins; a line that matches nothing is raw text.

    use crate::core::Bullet;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, tag_no_case, take_till1, take_until, take_while, take_while1},
        character::complete::{char, digit1, one_of, satisfy},
        combinator::{map, opt, recognize, rest},
        error::VerboseError,
        sequence::{delimited, pair, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DrawerState {
        Properties,
        Other,
    }

    /// What the classifier needs to know about the lines before this one.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ClassifierState {
        /// Subtype of the open `#+BEGIN_` block.
        pub block: Option<String>,
        pub drawer: Option<DrawerState>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListItemParts<'a> {
        pub indentation: &'a str,
        pub bullet: Bullet,
        /// Whitespace before the box and the mark inside it.
        pub checkbox: Option<(&'a str, char)>,
        /// Whitespace before the term and the term itself.
        pub tag: Option<(&'a str, &'a str)>,
        pub content: &'a str,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineKind<'a> {
        BlockBody,
        Headline {
            stars: &'a str,
            spacing: &'a str,
            title: &'a str,
        },
        ListItem(ListItemParts<'a>),
        BlockBegin {
            subtype: &'a str,
            arguments: &'a str,
        },
        BlockEnd {
            subtype: &'a str,
        },
        Keyword {
            indentation: &'a str,
            key: &'a str,
            options: Option<&'a str>,
            spacing: &'a str,
            value: &'a str,
        },
        DrawerStart {
            name: &'a str,
        },
        DrawerEnd,
        Property {
            indentation: &'a str,
            key: &'a str,
            plus: bool,
            spacing: &'a str,
            value: &'a str,
        },
        /// Property-shaped line with no `:PROPERTIES:` drawer open.
        StrayProperty,
        TableRow,
        Raw,
    }

    pub fn classify<'a>(line: &'a str, state: &ClassifierState) -> LineKind<'a> {
        if let Some(open) = &state.block {
            return match block_end(line) {
                Ok((_, subtype)) if subtype.eq_ignore_ascii_case(open) => LineKind::BlockEnd { subtype },
                _ => LineKind::BlockBody,
            };
        }
        if let Ok((_, (stars, spacing, title))) = headline(line) {
            return LineKind::Headline { stars, spacing, title };
        }
        if let Ok((_, parts)) = list_item(line) {
            return LineKind::ListItem(parts);
        }
        if is_plain(line) {
            return LineKind::Raw;
        }
        if let Ok((_, (subtype, arguments))) = block_begin(line) {
            return LineKind::BlockBegin { subtype, arguments };
        }
        if let Ok((_, subtype)) = block_end(line) {
            return LineKind::BlockEnd { subtype };
        }
        if let Ok((_, kind)) = keyword(line) {
            return kind;
        }
        if drawer_end(line).is_ok() {
            return LineKind::DrawerEnd;
        }
        if state.drawer.is_none() {
            if let Ok((_, name)) = drawer_start(line) {
                return LineKind::DrawerStart { name };
            }
        }
        if let Ok((_, kind)) = property(line) {
            return match state.drawer {
                Some(DrawerState::Properties) => kind,
                Some(DrawerState::Other) => LineKind::Raw,
                None => LineKind::StrayProperty,
            };
        }
        if line.trim_start().starts_with('|') {
            return LineKind::TableRow;
        }
        LineKind::Raw
    }

    /// Blank, or starting with something none of the markup patterns can.
    fn is_plain(line: &str) -> bool {
        !line
            .trim_start()
            .starts_with(|c: char| matches!(c, '#' | ':' | '*' | '|'))
    }

    fn ws(i: &str) -> PResult<'_, &str> {
        take_while(char::is_whitespace)(i)
    }

    fn only_ws(i: &str) -> PResult<'_, &str> {
        let (i, trailing) = ws(i)?;
        if i.is_empty() {
            Ok((i, trailing))
        } else {
            Err(nom::Err::Error(VerboseError {
                errors: vec![(i, nom::error::VerboseErrorKind::Context("trailing text"))],
            }))
        }
    }

    fn headline(i: &str) -> PResult<'_, (&str, &str, &str)> {
        tuple((take_while1(|c: char| c == '*'), take_while1(char::is_whitespace), rest))(i)
    }

    fn bullet(i: &str) -> PResult<'_, Bullet> {
        alt((
            map(one_of("*-+"), Bullet::Symbol),
            map(
                pair(
                    alt((digit1, recognize(satisfy(|c: char| c.is_ascii_alphabetic())))),
                    one_of(".)"),
                ),
                |(value, separator): (&str, char)| Bullet::Counter {
                    value: value.to_string(),
                    separator,
                },
            ),
        ))(i)
    }

    fn list_item(i: &str) -> PResult<'_, ListItemParts<'_>> {
        let (i, indentation) = ws(i)?;
        let (i, bullet) = bullet(i)?;
        let (i, _) = char(' ')(i)?;
        let (i, checkbox) = opt(pair(ws, delimited(char('['), one_of(" Xx-"), char(']'))))(i)?;
        let (i, tag) = opt(pair(ws, list_tag))(i)?;
        Ok((
            "",
            ListItemParts {
                indentation,
                bullet,
                checkbox,
                tag,
                content: i,
            },
        ))
    }

    /// Description-list term, up to the first `::`.
    fn list_tag(i: &str) -> PResult<'_, &str> {
        let (i, term) = take_until("::")(i)?;
        let (i, _) = tag("::")(i)?;
        Ok((i, term))
    }

    fn block_begin(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = ws(i)?;
        let (i, _) = tag_no_case("#+begin_")(i)?;
        let (i, subtype) = take_till1(char::is_whitespace)(i)?;
        Ok(("", (subtype, i)))
    }

    fn block_end(i: &str) -> PResult<'_, &str> {
        let (i, _) = ws(i)?;
        let (i, _) = tag_no_case("#+end_")(i)?;
        let (i, subtype) = take_till1(char::is_whitespace)(i)?;
        let (i, _) = only_ws(i)?;
        Ok((i, subtype))
    }

    fn keyword(i: &str) -> PResult<'_, LineKind<'_>> {
        let (i, indentation) = ws(i)?;
        let (i, _) = tag("#+")(i)?;
        let (i, key) = is_not(":[")(i)?;
        let (i, options) = opt(recognize(delimited(char('['), opt(is_not("]")), char(']'))))(i)?;
        let (i, _) = char(':')(i)?;
        let (value, spacing) = ws(i)?;
        Ok((
            "",
            LineKind::Keyword {
                indentation,
                key,
                options,
                spacing,
                value,
            },
        ))
    }

    fn drawer_end(i: &str) -> PResult<'_, &str> {
        let (i, _) = ws(i)?;
        let (i, _) = tag_no_case(":END:")(i)?;
        only_ws(i)
    }

    fn drawer_start(i: &str) -> PResult<'_, &str> {
        let (i, _) = ws(i)?;
        let (i, name) = delimited(char(':'), is_not(":"), char(':'))(i)?;
        let (i, _) = only_ws(i)?;
        Ok((i, name))
    }

    fn property(i: &str) -> PResult<'_, LineKind<'_>> {
        let (i, indentation) = ws(i)?;
        let (i, _) = char(':')(i)?;
        let (i, key) = is_not(" ()+:")(i)?;
        let (i, plus) = opt(char('+'))(i)?;
        let (i, _) = char(':')(i)?;
        if i.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, nom::error::VerboseErrorKind::Context("property value"))],
            }));
        }
        let (value, spacing) = ws(i)?;
        Ok((
            "",
            LineKind::Property {
                indentation,
                key,
                plus: plus.is_some(),
                spacing,
                value,
            },
        ))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn plain(line: &str) -> LineKind<'_> {
            classify(line, &ClassifierState::default())
        }

        #[test]
        fn headlines_need_whitespace_after_stars() {
            assert_eq!(
                plain("** TODO Title :tag:"),
                LineKind::Headline {
                    stars: "**",
                    spacing: " ",
                    title: "TODO Title :tag:"
                }
            );
            assert_eq!(plain("*bold* start"), LineKind::Raw);
        }

        #[test]
        fn list_items_with_checkbox_and_tag() {
            let LineKind::ListItem(parts) = plain("  1) [X] term :: body") else {
                panic!("expected list item");
            };
            assert_eq!(parts.indentation, "  ");
            assert_eq!(
                parts.bullet,
                Bullet::Counter {
                    value: "1".into(),
                    separator: ')'
                }
            );
            assert_eq!(parts.checkbox, Some(("", 'X')));
            assert_eq!(parts.tag, Some((" ", "term ")));
            assert_eq!(parts.content, " body");
            assert_eq!(plain("-----"), LineKind::Raw);
        }

        #[test]
        fn blocks_keywords_and_tables() {
            assert_eq!(
                plain("#+begin_src shell :results output"),
                LineKind::BlockBegin {
                    subtype: "src",
                    arguments: " shell :results output"
                }
            );
            assert_eq!(plain("#+END_SRC  "), LineKind::BlockEnd { subtype: "SRC" });
            assert_eq!(
                plain("#+RESULTS[ab12]: out"),
                LineKind::Keyword {
                    indentation: "",
                    key: "RESULTS",
                    options: Some("[ab12]"),
                    spacing: " ",
                    value: "out"
                }
            );
            assert_eq!(plain("  | a | b |"), LineKind::TableRow);
            assert_eq!(plain("# a comment"), LineKind::Raw);
        }

        #[test]
        fn block_bodies_are_opaque_until_matching_end() {
            let state = ClassifierState {
                block: Some("SRC".into()),
                drawer: None,
            };
            assert_eq!(classify("* not a headline", &state), LineKind::BlockBody);
            assert_eq!(classify("#+END_QUOTE", &state), LineKind::BlockBody);
            assert_eq!(classify("#+end_src", &state), LineKind::BlockEnd { subtype: "src" });
        }

        #[test]
        fn properties_depend_on_drawer() {
            assert_eq!(plain(":PROPERTIES:"), LineKind::DrawerStart { name: "PROPERTIES" });
            assert_eq!(plain(":end:"), LineKind::DrawerEnd);
            assert_eq!(plain(":ID: abc"), LineKind::StrayProperty);

            let mut state = ClassifierState::default();
            state.drawer = Some(DrawerState::Properties);
            assert_eq!(
                classify(":Effort+:  1:00", &state),
                LineKind::Property {
                    indentation: "",
                    key: "Effort",
                    plus: true,
                    spacing: "  ",
                    value: "1:00"
                }
            );
            assert_eq!(classify(":LOGBOOK:", &state), LineKind::Raw);

            state.drawer = Some(DrawerState::Other);
            assert_eq!(classify(":ID: abc", &state), LineKind::Raw);
        }
    }
}

pub mod reader {
    //! Structural reader.
    //!
    //! Pass one walks the lines once, classifying each and filing it into the
    //! section of the innermost open headline (or of the document). Pass two
    //! turns the staged headlines into [`Headline`] values parent-first: tags,
    //! TODO state and priority are split off the title, and the planning line
    //! is lifted out of the first content block.

    use crate::classify::{ClassifierState, DrawerState, LineKind, ListItemParts, classify};
    use crate::core::*;
    use crate::format::check_round_trip;
    use crate::time::parse_planning;
    use log::{debug, warn};

    /// Read `text`, optionally verifying that it serializes back unchanged.
    pub fn parse(text: &str, cautious: bool) -> OrgResult<Document> {
        let options = LoadOptions {
            extra_cautious: cautious,
            ..LoadOptions::default()
        };
        parse_with(text, &options)
    }

    pub fn parse_with(text: &str, options: &LoadOptions) -> OrgResult<Document> {
        let doc = read(text, options)?;
        if options.extra_cautious {
            check_round_trip(text, &doc, options.diff_context)?;
        }
        Ok(doc)
    }

    pub(crate) fn read(text: &str, options: &LoadOptions) -> OrgResult<Document> {
        let mut reader = Reader::default();
        for (idx, line) in text.split('\n').enumerate() {
            reader.feed(idx + 1, line)?;
        }
        reader.finish(options)
    }

    /* ------------------------------ Pass one ------------------------------ */

    struct RawLine {
        line: usize,
        text: String,
        /// Block body lines are kept as-is, without inline tokenizing.
        verbatim: bool,
    }

    #[derive(Default)]
    struct SectionBuilder {
        keywords: Vec<Keyword>,
        properties: Vec<Property>,
        structural: Vec<StructuralLine>,
        list_items: Vec<ListItem>,
        table_rows: Vec<TableRow>,
        delimiters: Vec<Delimiter>,
        raw_lines: Vec<RawLine>,
    }

    impl SectionBuilder {
        /// Group directly consecutive raw lines into text runs.
        fn finish(self) -> Section {
            let mut contents = Vec::new();
            let mut run: Vec<RawLine> = Vec::new();
            for raw in self.raw_lines {
                let continues = run
                    .last()
                    .is_some_and(|last| last.line + 1 == raw.line && last.verbatim == raw.verbatim);
                if !continues {
                    flush_run(&mut run, &mut contents);
                }
                run.push(raw);
            }
            flush_run(&mut run, &mut contents);
            Section {
                keywords: self.keywords,
                properties: self.properties,
                structural: self.structural,
                contents,
                list_items: self.list_items,
                table_rows: self.table_rows,
                delimiters: self.delimiters,
            }
        }
    }

    fn flush_run(run: &mut Vec<RawLine>, contents: &mut Vec<Text>) {
        let Some(first) = run.first() else {
            return;
        };
        let line = first.line;
        let verbatim = first.verbatim;
        let joined = run
            .drain(..)
            .map(|raw| raw.text)
            .collect::<Vec<_>>()
            .join("\n");
        contents.push(if verbatim {
            let tokens = if joined.is_empty() { vec![] } else { vec![Token::Text(joined)] };
            Text::new(line, tokens)
        } else {
            Text::parse(line, &joined)
        });
    }

    /// Headline staged during pass one.
    struct HeadlineBuilder {
        start_line: usize,
        depth: usize,
        spacing: String,
        title: String,
        section: SectionBuilder,
        children: Vec<usize>,
    }

    /// Line-to-line state of the scan.
    #[derive(Default)]
    pub(crate) struct ReaderState {
        classifier: ClassifierState,
        /// Index of the list item that may absorb continuation lines.
        list_item: Option<usize>,
        /// Open headline per depth; `None` where a depth was skipped.
        hierarchy: Vec<Option<usize>>,
    }

    #[derive(Default)]
    struct Reader {
        state: ReaderState,
        root: SectionBuilder,
        top: Vec<usize>,
        builders: Vec<HeadlineBuilder>,
    }

    impl Reader {
        fn section(&mut self) -> &mut SectionBuilder {
            match self.state.hierarchy.last().copied().flatten() {
                Some(idx) => &mut self.builders[idx].section,
                None => &mut self.root,
            }
        }

        fn feed(&mut self, line_no: usize, line: &str) -> OrgResult<()> {
            let kind = classify(line, &self.state.classifier);
            if !matches!(kind, LineKind::Raw | LineKind::StrayProperty) {
                self.state.list_item = None;
            }
            match kind {
                LineKind::BlockBody => self.section().raw_lines.push(RawLine {
                    line: line_no,
                    text: line.to_string(),
                    verbatim: true,
                }),
                LineKind::Headline { stars, spacing, title } => {
                    self.add_headline(line_no, stars.len(), spacing, title)?
                }
                LineKind::ListItem(parts) => {
                    let section = self.section();
                    section.list_items.push(list_item(line_no, parts));
                    let idx = section.list_items.len() - 1;
                    self.state.list_item = Some(idx);
                }
                LineKind::BlockBegin { subtype, arguments } => {
                    self.section().delimiters.push(Delimiter {
                        line: line_no,
                        kind: DelimiterKind::Begin,
                        subtype: subtype.to_string(),
                        arguments: arguments.to_string(),
                        raw: line.to_string(),
                    });
                    self.state.classifier.block = Some(subtype.to_string());
                }
                LineKind::BlockEnd { subtype } => {
                    self.section().delimiters.push(Delimiter {
                        line: line_no,
                        kind: DelimiterKind::End,
                        subtype: subtype.to_string(),
                        arguments: String::new(),
                        raw: line.to_string(),
                    });
                    self.state.classifier.block = None;
                }
                LineKind::Keyword {
                    indentation,
                    key,
                    options,
                    spacing,
                    value,
                } => self.section().keywords.push(Keyword {
                    line: line_no,
                    indentation: indentation.to_string(),
                    key: key.to_string(),
                    options: options.map(str::to_string),
                    spacing: spacing.to_string(),
                    value: value.to_string(),
                }),
                LineKind::DrawerStart { name } => {
                    self.push_structural(line_no, line);
                    self.state.classifier.drawer = Some(if name.eq_ignore_ascii_case("PROPERTIES") {
                        DrawerState::Properties
                    } else {
                        DrawerState::Other
                    });
                }
                LineKind::DrawerEnd => {
                    self.push_structural(line_no, line);
                    self.state.classifier.drawer = None;
                }
                LineKind::Property {
                    indentation,
                    key,
                    plus,
                    spacing,
                    value,
                } => {
                    let property =
                        Property::from_source(line_no, indentation, key, plus, spacing, value)?;
                    self.section().properties.push(property);
                }
                LineKind::StrayProperty => {
                    warn!("line {line_no}: property outside a :PROPERTIES: drawer, kept as text");
                    self.add_raw(line_no, line);
                }
                LineKind::TableRow => self.section().table_rows.push(table_row(line_no, line)),
                LineKind::Raw => self.add_raw(line_no, line),
            }
            Ok(())
        }

        fn push_structural(&mut self, line_no: usize, line: &str) {
            self.section().structural.push(StructuralLine {
                line: line_no,
                text: line.to_string(),
            });
        }

        /// Raw text, merged into the active list item when indented past its bullet.
        fn add_raw(&mut self, line_no: usize, line: &str) {
            if let Some(idx) = self.state.list_item {
                let section = self.section();
                if let Some(item) = section.list_items.get_mut(idx) {
                    let width = item.indentation.chars().count() + 1;
                    let indented = line.chars().count() >= width
                        && line.chars().take(width).all(char::is_whitespace);
                    if indented || line.trim().is_empty() {
                        item.append_line(line);
                        return;
                    }
                }
                self.state.list_item = None;
            }
            self.section().raw_lines.push(RawLine {
                line: line_no,
                text: line.to_string(),
                verbatim: false,
            });
        }

        fn add_headline(
            &mut self,
            line_no: usize,
            depth: usize,
            spacing: &str,
            title: &str,
        ) -> OrgResult<()> {
            let hierarchy = &mut self.state.hierarchy;
            hierarchy.truncate(depth - 1);
            while hierarchy.len() < depth - 1 {
                hierarchy.push(None);
            }
            let idx = self.builders.len();
            self.builders.push(HeadlineBuilder {
                start_line: line_no,
                depth,
                spacing: spacing.to_string(),
                title: title.to_string(),
                section: SectionBuilder::default(),
                children: Vec::new(),
            });
            match hierarchy.iter().rev().flatten().next() {
                Some(&parent) => self.builders[parent].children.push(idx),
                None => self.top.push(idx),
            }
            hierarchy.push(Some(idx));
            self.check_hierarchy(line_no)?;

            self.state.classifier.drawer = None;
            self.state.list_item = None;
            Ok(())
        }

        fn check_hierarchy(&self, line_no: usize) -> OrgResult<()> {
            for (pos, entry) in self.state.hierarchy.iter().enumerate() {
                if let Some(idx) = entry {
                    let depth = self.builders[*idx].depth;
                    if depth != pos + 1 {
                        return Err(OrgError::Structural {
                            line: line_no,
                            message: format!("headline of depth {depth} stacked at depth {}", pos + 1),
                        });
                    }
                }
            }
            Ok(())
        }

        fn finish(self, options: &LoadOptions) -> OrgResult<Document> {
            let Reader {
                root,
                top,
                builders,
                ..
            } = self;
            let section = root.finish();
            let vocabulary = Vocabulary::from_keywords(&section.keywords, options);
            let mut slots: Vec<Option<HeadlineBuilder>> = builders.into_iter().map(Some).collect();
            let headlines = top
                .into_iter()
                .map(|idx| finish_headline(&mut slots, idx, 0, &[], &vocabulary))
                .collect::<OrgResult<Vec<_>>>()?;
            Ok(Document {
                path: None,
                todo_keywords: vocabulary.todo,
                done_keywords: vocabulary.done,
                section,
                headlines,
            })
        }
    }

    fn list_item(line_no: usize, parts: ListItemParts<'_>) -> ListItem {
        ListItem {
            line: line_no,
            indentation: parts.indentation.to_string(),
            bullet: parts.bullet,
            checkbox: parts.checkbox.map(|(indentation, mark)| Checkbox {
                indentation: indentation.to_string(),
                mark,
            }),
            tag_indentation: parts.tag.map_or("", |(indentation, _)| indentation).to_string(),
            tag: parts.tag.map(|(_, term)| Text::parse(line_no, term)),
            content: Text::parse(line_no, parts.content),
        }
    }

    fn table_row(line_no: usize, line: &str) -> TableRow {
        let mut chunks: Vec<&str> = line.split('|').collect();
        let indentation = chunks.remove(0).to_string();
        let closed = chunks.len() >= 2 && chunks.last().is_some_and(|last| last.trim().is_empty());
        let suffix = if closed {
            chunks.pop().unwrap_or_default().to_string()
        } else {
            String::new()
        };
        TableRow {
            line: line_no,
            indentation,
            cells: chunks.into_iter().map(str::to_string).collect(),
            closed,
            suffix,
        }
    }

    /* ------------------------------ Pass two ------------------------------ */

    struct Vocabulary {
        todo: Vec<String>,
        done: Vec<String>,
    }

    impl Vocabulary {
        /// States declared by `#+TODO:`-style keywords, falling back to the options.
        fn from_keywords(keywords: &[Keyword], options: &LoadOptions) -> Self {
            let mut todo = Vec::new();
            let mut done = Vec::new();
            for keyword in keywords.iter().filter(|k| {
                ["TODO", "SEQ_TODO", "TYP_TODO"]
                    .iter()
                    .any(|name| k.key.eq_ignore_ascii_case(name))
            }) {
                let words = |s: &str| -> Vec<String> {
                    s.split_whitespace()
                        .map(|w| w.split('(').next().unwrap_or(w).to_string())
                        .filter(|w| !w.is_empty())
                        .collect()
                };
                match keyword.value.split_once('|') {
                    Some((before, after)) => {
                        todo.extend(words(before));
                        done.extend(words(after));
                    }
                    None => {
                        let mut all = words(&keyword.value);
                        if let Some(last) = all.pop() {
                            todo.extend(all);
                            done.push(last);
                        }
                    }
                }
            }
            if todo.is_empty() && done.is_empty() {
                todo = options.todo_keywords.clone();
                done = options.done_keywords.clone();
            }
            Self { todo, done }
        }

        fn state_of<'t>(&self, title: &'t str) -> Option<(TodoState, &'t str)> {
            let candidates = self
                .todo
                .iter()
                .map(|k| (k, false))
                .chain(self.done.iter().map(|k| (k, true)));
            for (keyword, done) in candidates {
                let Some(rest) = title.strip_prefix(keyword.as_str()) else {
                    continue;
                };
                let body = rest.trim_start();
                if body.len() == rest.len() && !rest.is_empty() {
                    continue;
                }
                let mut state = TodoState::new(keyword.clone(), done);
                state.separator = rest[..rest.len() - body.len()].to_string();
                return Some((state, body));
            }
            None
        }
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    struct TitleParts<'t> {
        state: Option<TodoState>,
        priority: Option<Priority>,
        title: &'t str,
        tags: Vec<String>,
        padding: &'t str,
        trailing: &'t str,
    }

    /// `:a:b:` at the end of the title, preceded by whitespace or starting it.
    /// Returns (head, padding, tags, trailing).
    fn split_tags(title: &str) -> (&str, &str, Vec<String>, &str) {
        let body = title.trim_end();
        let trailing = &title[body.len()..];
        let run_start = body
            .char_indices()
            .rev()
            .take_while(|(_, c)| *c == ':' || is_tag_char(*c))
            .last()
            .map_or(body.len(), |(i, _)| i);
        let Some(offset) = body[run_start..].find(':') else {
            return (body, "", Vec::new(), trailing);
        };
        let start = run_start + offset;
        let block = &body[start..];
        let preceded_ok = body[..start]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace);
        let segments: Vec<&str> = if block.len() >= 3 && block.ends_with(':') {
            block[1..block.len() - 1].split(':').collect()
        } else {
            Vec::new()
        };
        if !preceded_ok || segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return (body, "", Vec::new(), trailing);
        }
        let before = &body[..start];
        let head = before.trim_end();
        (
            head,
            &before[head.len()..],
            segments.into_iter().map(str::to_string).collect(),
            trailing,
        )
    }

    fn split_title<'t>(title: &'t str, vocabulary: &Vocabulary) -> TitleParts<'t> {
        let (head, padding, tags, trailing) = split_tags(title);
        let (state, rest) = match vocabulary.state_of(head) {
            Some((state, rest)) => (Some(state), rest),
            None => (None, head),
        };
        let (priority, rest) = split_priority(rest);
        TitleParts {
            state,
            priority,
            title: rest,
            tags,
            padding,
            trailing,
        }
    }

    /// `[#A]` followed by whitespace or the end of the title.
    fn split_priority(title: &str) -> (Option<Priority>, &str) {
        let mut chars = title.chars();
        let (Some('['), Some('#'), Some(value), Some(']')) =
            (chars.next(), chars.next(), chars.next(), chars.next())
        else {
            return (None, title);
        };
        let after = &title[3 + value.len_utf8()..];
        let body = after.trim_start();
        if body.len() == after.len() && !after.is_empty() {
            return (None, title);
        }
        let spacing = after[..after.len() - body.len()].to_string();
        (Some(Priority { value, spacing }), body)
    }

    /// Lift a planning line directly below the headline out of the contents.
    fn take_planning(section: &mut Section, start_line: usize) -> Planning {
        let Some(pos) = section.contents.iter().position(|t| t.line == start_line + 1) else {
            return Planning::default();
        };
        let raw = section.contents[pos].raw();
        let (first, rest) = match raw.split_once('\n') {
            Some((first, rest)) => (first, Some(rest)),
            None => (raw.as_str(), None),
        };
        let Some(planning) = parse_planning(first) else {
            return Planning::default();
        };
        debug!("line {}: planning line {first:?}", start_line + 1);
        match rest {
            Some(rest) => section.contents[pos] = Text::parse(start_line + 2, rest),
            None => {
                section.contents.remove(pos);
            }
        }
        planning
    }

    fn finish_headline(
        slots: &mut [Option<HeadlineBuilder>],
        idx: usize,
        parent_depth: usize,
        inherited: &[String],
        vocabulary: &Vocabulary,
    ) -> OrgResult<Headline> {
        let Some(builder) = slots.get_mut(idx).and_then(Option::take) else {
            return Err(OrgError::Structural {
                line: 0,
                message: format!("headline #{idx} attached twice"),
            });
        };
        if builder.depth <= parent_depth {
            return Err(OrgError::Structural {
                line: builder.start_line,
                message: format!(
                    "headline of depth {} placed under depth {parent_depth}",
                    builder.depth
                ),
            });
        }
        let parts = split_title(&builder.title, vocabulary);
        let mut section = builder.section.finish();
        let planning = take_planning(&mut section, builder.start_line);

        let mut effective = parts.tags.clone();
        effective.extend(inherited.iter().cloned());
        let children = builder
            .children
            .iter()
            .map(|&child| finish_headline(slots, child, builder.depth, &effective, vocabulary))
            .collect::<OrgResult<Vec<_>>>()?;

        Ok(Headline {
            start_line: builder.start_line,
            depth: builder.depth,
            spacing: builder.spacing,
            state: parts.state,
            priority: parts.priority,
            title: Text::parse(builder.start_line, parts.title),
            shallow_tags: parts.tags,
            parent_tags: inherited.to_vec(),
            tags_padding: parts.padding.to_string(),
            tags_trailing: parts.trailing.to_string(),
            planning,
            section,
            children,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn skipped_depths_attach_to_nearest_ancestor() {
            let doc = parse("* A\n*** deep\n** B\n* C", false).expect("parse");
            let titles: Vec<(usize, String)> = doc
                .all_headlines()
                .map(|h| (h.depth, h.title_text()))
                .collect();
            assert_eq!(
                titles,
                vec![
                    (1, "A".to_string()),
                    (3, "deep".to_string()),
                    (2, "B".to_string()),
                    (1, "C".to_string())
                ]
            );
            assert_eq!(doc.headlines[0].children.len(), 2);
        }

        #[test]
        fn title_parts() {
            let doc = parse("* TODO [#A] Call mom   :family:phone:  ", false).expect("parse");
            let h = &doc.headlines[0];
            assert_eq!(h.state.as_ref().map(|s| s.keyword.as_str()), Some("TODO"));
            assert_eq!(h.priority.as_ref().map(|p| p.value), Some('A'));
            assert_eq!(h.title.raw(), "Call mom");
            assert_eq!(h.shallow_tags(), ["family", "phone"]);
            assert_eq!(h.tags_padding, "   ");
            assert_eq!(h.tags_trailing, "  ");
        }

        #[test]
        fn tag_like_suffixes_without_separation_stay_in_title() {
            let doc = parse("* see foo:bar:\n* a :: b\n* TODOS", false).expect("parse");
            assert_eq!(doc.headlines[0].title.raw(), "see foo:bar:");
            assert!(doc.headlines[0].shallow_tags().is_empty());
            assert_eq!(doc.headlines[1].title.raw(), "a :: b");
            assert!(doc.headlines[2].state.is_none());
        }

        #[test]
        fn vocabulary_from_keywords() {
            let doc = parse(
                "#+TODO: NEXT(n) WAIT(w@/!) | DONE(d) CANCELLED(c)\n* WAIT thing\n* CANCELLED other\n* TODO not a state",
                false,
            )
            .expect("parse");
            assert_eq!(doc.todo_keywords(), ["NEXT", "WAIT"]);
            assert_eq!(doc.done_keywords(), ["DONE", "CANCELLED"]);
            assert!(doc.headlines[0].is_todo());
            assert!(doc.headlines[1].is_done());
            assert_eq!(doc.headlines[2].state, None);
        }

        #[test]
        fn planning_is_split_off_the_first_block() {
            let doc = parse(
                "* Task\nSCHEDULED: <2020-12-12 Sáb> DEADLINE: <2020-12-14>\nBody line\nmore",
                false,
            )
            .expect("parse");
            let h = &doc.headlines[0];
            assert!(h.scheduled().is_some());
            assert!(h.deadline().is_some());
            assert_eq!(h.section.contents.len(), 1);
            assert_eq!(h.section.contents[0].line, 3);
            assert_eq!(h.section.contents[0].raw(), "Body line\nmore");
        }

        #[test]
        fn list_continuations_and_blocks() {
            let doc = parse(
                "* H\n- first\n  continued\nafter\n#+BEGIN_SRC sh\n* not a headline\n#+END_SRC",
                false,
            )
            .expect("parse");
            let s = &doc.headlines[0].section;
            assert_eq!(s.list_items.len(), 1);
            assert_eq!(s.list_items[0].content.raw(), "first\n  continued");
            assert_eq!(s.list_items[0].last_line(), 3);
            assert_eq!(s.contents.len(), 2);
            assert_eq!(s.contents[1].raw(), "* not a headline");
            assert_eq!(s.delimiters.len(), 2);
            assert_eq!(doc.headlines.len(), 1);
        }

        #[test]
        fn properties_route_only_inside_drawer() {
            let doc = parse(
                "* H\n:PROPERTIES:\n:ID: abc\n:CREATED: [2020-01-01]\n:END:\n:STRAY: x",
                false,
            )
            .expect("parse");
            let s = &doc.headlines[0].section;
            assert_eq!(s.properties.len(), 2);
            assert_eq!(s.structural.len(), 2);
            assert!(matches!(s.get_property("created"), Some(PropertyValue::Time(_))));
            assert_eq!(s.contents[0].raw(), ":STRAY: x");
        }

        #[test]
        fn malformed_range_in_property_is_fatal() {
            let err = parse("* H\n:PROPERTIES:\n:WHEN: <2020-01-01>--<later>\n:END:", false)
                .expect_err("range");
            assert!(matches!(err, OrgError::MalformedTimeRange(_)));
        }

        #[test]
        fn table_rows_keep_their_edges() {
            let doc = parse("| a | b |  \n|---+---|\n  | open", false).expect("parse");
            let rows = &doc.section.table_rows;
            assert_eq!(rows.len(), 3);
            assert_eq!(rows[0].cells, vec![" a ", " b "]);
            assert_eq!(rows[0].suffix, "  ");
            assert!(rows[1].is_separator());
            assert!(!rows[2].closed);
            assert_eq!(rows[2].indentation, "  ");
        }
    }
}

pub mod format {
    //! Serializer. Section records are written back in source-line order; a
    //! property with no drawer around it gets `:PROPERTIES:`/`:END:` lines
    //! synthesized so programmatic additions stay valid org.

    use super::core::*;
    use log::{error, warn};
    use similar::{Algorithm, TextDiff};

    pub fn serialize(doc: &Document) -> String {
        let mut lines = Vec::new();
        write_section(&mut lines, &doc.section);
        for headline in &doc.headlines {
            write_headline(&mut lines, headline);
        }
        lines.join("\n")
    }

    /// The star line of a headline, rebuilt from its parts.
    pub fn headline_line(headline: &Headline) -> String {
        let mut line = "*".repeat(headline.depth);
        line.push_str(&headline.spacing);
        if let Some(state) = &headline.state {
            line.push_str(&state.keyword);
            line.push_str(&state.separator);
        }
        if let Some(priority) = &headline.priority {
            line.push_str("[#");
            line.push(priority.value);
            line.push(']');
            line.push_str(&priority.spacing);
        }
        let title = headline.title.raw();
        line.push_str(&title);
        if !headline.shallow_tags.is_empty() {
            // Tags glued to a title would read back as title text.
            if headline.tags_padding.is_empty()
                && !title.is_empty()
                && !title.ends_with(char::is_whitespace)
            {
                line.push(' ');
            }
            line.push_str(&headline.tags_padding);
            line.push(':');
            line.push_str(&headline.shallow_tags.join(":"));
            line.push(':');
        }
        line.push_str(&headline.tags_trailing);
        line
    }

    fn write_headline(out: &mut Vec<String>, headline: &Headline) {
        out.push(headline_line(headline));
        if let Some(planning) = headline.planning.to_raw() {
            out.push(planning);
        }
        write_section(out, &headline.section);
        for child in &headline.children {
            write_headline(out, child);
        }
    }

    fn write_section(out: &mut Vec<String>, section: &Section) {
        let mut in_drawer = false;
        // Indentation of a drawer opened here rather than read from the source.
        let mut synthesized: Option<String> = None;

        for item in section.items() {
            match item {
                SectionItem::Property(property) => {
                    if !in_drawer && synthesized.is_none() {
                        warn!(
                            "line {}: synthesizing :PROPERTIES: for {:?}",
                            property.line, property.key
                        );
                        out.push(format!("{}:PROPERTIES:", property.indentation));
                        synthesized = Some(property.indentation.clone());
                    }
                }
                SectionItem::Structural(structural) => {
                    close_synthesized(out, &mut synthesized);
                    in_drawer = !structural.is_drawer_end();
                }
                _ => close_synthesized(out, &mut synthesized),
            }
            out.push(item.to_raw());
        }
        close_synthesized(out, &mut synthesized);
    }

    fn close_synthesized(out: &mut Vec<String>, synthesized: &mut Option<String>) {
        if let Some(indentation) = synthesized.take() {
            warn!("synthesizing :END: after added properties");
            out.push(format!("{indentation}:END:"));
        }
    }

    /// Fail with a unified diff when `doc` does not serialize back to `source`.
    pub fn check_round_trip(source: &str, doc: &Document, context: usize) -> OrgResult<()> {
        let dumped = serialize(doc);
        if dumped == source {
            return Ok(());
        }
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_lines(source, dumped.as_str())
            .unified_diff()
            .context_radius(context)
            .header("source", "serialized")
            .to_string();
        error!("document does not round-trip:\n{diff}");
        Err(OrgError::RoundTripMismatch { diff })
    }

    #[cfg(test)]
    pub(crate) mod tests {
        use super::*;
        use crate::reader::parse;
        use crate::time::TimeValue;
        use pretty_assertions::assert_eq;

        pub(crate) const SIMPLE: &str = r#"#+TITLE: 01-Simple
#+DESCRIPTION: Simple org file
#+TODO: TODO(t) PAUSED(p) |  DONE(d)

:PROPERTIES:
:ID: 01-simple
:CREATED: [2020-01-01 Wed 01:01]
:END:

* First level
:PROPERTIES:
:ID: 01-simple-first-level-id
:CREATED: [2020-01-01 Wed 01:01]
:END:
  First level content

** Second level  :second:
   :PROPERTIES:
   :ID: 01-simple-second-level-id
   :END:

   Second level content

*** PAUSED Third level   :third:
Third level content
** DONE [#B] Other second level
"#;

        pub(crate) const MARKUP: &str = r#"#+TITLE: 02-Markup

* First level
This is a *bold phrase*. This is a /italic phrase/. This is ~code~ and =verbatim=.
This is +striked out+ and _underlined_.

This is a nested *bold =verbatim /italic/ inside=* and an interleaved *bold /italic* here/.
This is a lone _ marker, a * star, a**b** without pre and an empty ** span.
"#;

        pub(crate) const LINKS: &str = r#"#+TITLE: 03-Links

* Links
  This is a [[https://codigoparallevar.com/1][web link]].

  This is a /italized [[https://codigoparallevar.com/2][web link]]/.

  This is a link with no description: [[https://codigoparallevar.com/3]].

  This is a [[https://codigoparallevar.com/4][multi
  line link]].

  This is a [[https://codigoparallevar.com/5][[tricky web link]ZWSP]] followed by text.

  This is [[[https://codigoparallevar.com/6][another tricky web link]]] in brackets.

  This is an [tricky] [[https://codigoparallevar.com/7][link next to brackets]].
"#;

        pub(crate) const CODE: &str = r#"#+TITLE: 04-Code

* First Item
#+BEGIN_SRC sh
echo "This is a test"
echo "with two lines"
exit 0 # Exit successfully
#+END_SRC

#+RESULTS:
: This is a test
: with two lines

* Second item
#+NAME: second-snippet
#+BEGIN_SRC sh :results drawer
echo "This is another test"
,* not a headline
#+END_SRC

#+RESULTS:
  :results:
  This is another test
  ,* not a headline
  :end:
"#;

        pub(crate) const DATES: &str = r#"#+TITLE: 05-Dates

* Scheduled for date
SCHEDULED: <2020-12-12 Sáb> CLOSED: <2020-12-13 Dom> DEADLINE: <2020-12-14 Lun>

** Scheduled for time range
SCHEDULED: <2020-12-15 Mar 00:05-00:10>

** Repeating deadline
DEADLINE: <2020-12-15 Mar 00:05 ++1w>
:LOGBOOK:
CLOCK: [2020-12-15 Mar 00:05]--[2020-12-15 Mar 00:10] =>  0:05
:END:
"#;

        pub(crate) const LISTS: &str = r#"#+TITLE: 06-Lists

* Simple lists
- This is a simple list.
- This list has multiple elements, with _markup_.

* Numbered lists
1. First element
2) Second element
   continued on the next line

* Nested and tagged
+ Top
  + Nested [[https://example.org][link]]
  + [X] Checked
+ Back to top
- Term :: Description
"#;

        pub(crate) const TABLES: &str = r#"#+TITLE: 07-Tables

* Table
  | Header1 | Header2 |
  |---------+---------|
  | Content | more    |
  | unclosed
"#;

        pub(crate) const ROAM: &str = r#":PROPERTIES:
:ID: 515054a9-ced8-4119-a844-71726f80dedf
:END:
#+title: Org-roam node
"#;

        pub(crate) fn fixture(source: &str) -> String {
            source.replace("ZWSP", "\u{200b}")
        }

        #[test]
        fn fixtures_round_trip() {
            for source in [SIMPLE, MARKUP, LINKS, CODE, DATES, LISTS, TABLES, ROAM] {
                let source = fixture(source);
                let doc = parse(&source, true).expect("parse");
                assert_eq!(serialize(&doc), source);
            }
        }

        #[test]
        fn edge_inputs_round_trip() {
            for source in ["", "\n", "no newline", "* only a headline", "*** \n\n", ":END:\n:PROPERTIES:"] {
                let doc = parse(source, true).expect("parse");
                assert_eq!(serialize(&doc), source);
            }
        }

        #[test]
        fn double_round_trip_is_stable() {
            let mut doc = parse(&fixture(LISTS), false).expect("parse");
            doc.headlines[1].set_property("ORDER", "2");
            let once = serialize(&doc);
            let twice = serialize(&parse(&once, true).expect("reparse"));
            assert_eq!(twice, once);
        }

        #[test]
        fn property_creation_synthesizes_drawers() {
            let source = r#"#+TITLE: 08-Property-creation

* Top headline
** Second headline

*** Third headline
"#;
            let mut doc = parse(source, false).expect("parse");
            doc.headlines[0].set_id("first");
            doc.headlines[0].children[0].set_id("second");
            let expected = r#"#+TITLE: 08-Property-creation

* Top headline
:PROPERTIES:
:ID: first
:END:
** Second headline
:PROPERTIES:
:ID: second
:END:

*** Third headline
"#;
            assert_eq!(serialize(&doc), expected);
        }

        #[test]
        fn new_properties_join_existing_drawers() {
            let mut doc = parse(SIMPLE, false).expect("parse");
            doc.headlines[0].set_property("EFFORT", "1:00");
            doc.headlines[0].set_property("ID", "renamed");
            let out = serialize(&doc);
            assert!(out.contains(
                ":PROPERTIES:\n:ID: renamed\n:CREATED: [2020-01-01 Wed 01:01]\n:EFFORT: 1:00\n:END:\n  First level content"
            ));
            assert_eq!(out.matches(":PROPERTIES:").count(), 3);
        }

        #[test]
        fn property_keys_ignore_case_and_keep_their_spelling() {
            let mut doc = parse("* H\n:PROPERTIES:\n:Effort: 0:30\n:END:", false).expect("parse");
            assert!(doc.headlines[0].get_property("EFFORT").is_some());
            doc.headlines[0].set_property("effort", "1:00");
            assert_eq!(doc.headlines[0].section.properties.len(), 1);
            assert_eq!(serialize(&doc), "* H\n:PROPERTIES:\n:Effort: 1:00\n:END:");
        }

        #[test]
        fn document_properties_go_to_the_top() {
            let mut doc = parse("#+TITLE: x\n* H", false).expect("parse");
            doc.set_property("ID", "doc-id");
            assert_eq!(serialize(&doc), ":PROPERTIES:\n:ID: doc-id\n:END:\n#+TITLE: x\n* H");
            assert_eq!(doc.id(), Some("doc-id"));
        }

        #[test]
        fn dates_shrink_when_days_change() {
            let source = fixture(DATES);
            let mut doc = parse(&source, false).expect("parse");
            let planning = &mut doc.headlines[0].planning;
            for (keyword, day) in PlanningKeyword::ALL.into_iter().zip([15, 16, 17]) {
                let value = planning.slot_mut(keyword).as_mut().expect("planning");
                value.as_time_mut().time.set_day(day);
            }
            let out = serialize(&doc);
            // three " Dow" labels dropped
            assert_eq!(out.chars().count(), source.chars().count() - 4 * 3);
            assert!(out.contains("SCHEDULED: <2020-12-15> CLOSED: <2020-12-16> DEADLINE: <2020-12-17>\n"));
        }

        #[test]
        fn planning_additions_and_removals() {
            let mut doc = parse("* A\nDEADLINE: <2020-12-14>  SCHEDULED: <2020-12-12>\n* B\nbody", false)
                .expect("parse");
            doc.headlines[0].set_scheduled(None);
            doc.headlines[1].set_closed(TimeValue::parse("[2021-01-02 Sat]").expect("time"));
            assert_eq!(
                serialize(&doc),
                "* A\nDEADLINE: <2020-12-14>\n* B\nCLOSED: [2021-01-02 Sat]\nbody"
            );
        }

        #[test]
        fn title_and_tag_edits_rebuild_the_star_line() {
            let mut doc = parse("* TODO Task :a:\n** Child", false).expect("parse");
            doc.headlines[0].title = Text::parse(1, "Renamed *task*");
            doc.headlines[0].children[0].add_tag("b");
            assert_eq!(serialize(&doc), "* TODO Renamed *task* :a:\n** Child :b:");
            assert_eq!(doc.headlines[0].children[0].tags(), vec!["b", "a"]);
        }

        #[test]
        fn titles_added_before_tags_keep_a_separator() {
            let mut doc = parse("* :a:\n** B", false).expect("parse");
            assert_eq!(doc.headlines[0].shallow_tags(), ["a"]);
            doc.headlines[0].title = Text::parse(1, "X");
            let once = serialize(&doc);
            assert_eq!(once, "* X :a:\n** B");

            let reparsed = parse(&once, true).expect("reparse");
            assert_eq!(reparsed.headlines[0].title.raw(), "X");
            assert_eq!(reparsed.headlines[0].shallow_tags(), ["a"]);
            assert_eq!(reparsed.headlines[0].children[0].tags(), vec!["a"]);
            assert_eq!(serialize(&reparsed), once);
        }

        #[test]
        fn created_children_follow_existing_ones() {
            let mut doc = parse("* Parent :p:\nbody\n** Old\n* Next", false).expect("parse");
            let child = doc.headlines[0].create_headline_at_end();
            child.title = Text::parse(child.start_line, "New child");
            child.add_tag("c");
            child.set_property("ID", "fresh");
            let once = serialize(&doc);
            assert_eq!(
                once,
                "* Parent :p:\nbody\n** Old\n** New child :c:\n:PROPERTIES:\n:ID: fresh\n:END:\n* Next"
            );

            let reparsed = parse(&once, true).expect("reparse");
            let added = &reparsed.headlines[0].children[1];
            assert_eq!(added.depth, 2);
            assert_eq!(added.title_text(), "New child");
            assert_eq!(added.tags(), vec!["c", "p"]);
            assert_eq!(added.id(), Some("fresh"));
            assert_eq!(serialize(&reparsed), once);
        }

        #[test]
        fn cautious_mode_reports_a_diff() {
            let doc = parse("* A\nline", false).expect("parse");
            let err = check_round_trip("* A\nother line", &doc, 3).expect_err("mismatch");
            let OrgError::RoundTripMismatch { diff } = err else {
                panic!("unexpected error {err:?}");
            };
            assert!(diff.contains("-other line"));
            assert!(diff.contains("+line"));
        }
    }
}

pub mod query {
    //! Read and edit helpers over a parsed document: links, lists, tables,
    //! source blocks, clock entries and tags.

    use crate::core::*;
    use crate::inline::implicit_links;
    use crate::time::TimeValue;
    use log::debug;

    /* -------------------------------- Links -------------------------------- */

    /// Something that owns the texts a [`Link`] points into.
    pub trait LinkHost {
        fn text_at_mut(&mut self, location: &TextLocation) -> Option<&mut Text>;
    }

    impl LinkHost for Headline {
        /// `location.path` is relative to this headline.
        fn text_at_mut(&mut self, location: &TextLocation) -> Option<&mut Text> {
            let mut node = self;
            for &index in &location.path {
                node = node.children.get_mut(index)?;
            }
            node.text_slot_mut(location.slot)
        }
    }

    impl LinkHost for Document {
        /// An empty path addresses the text before the first headline.
        fn text_at_mut(&mut self, location: &TextLocation) -> Option<&mut Text> {
            if location.path.is_empty() {
                return self.section.text_mut(location.slot);
            }
            self.headline_mut(&location.path)?
                .text_slot_mut(location.slot)
        }
    }

    impl Link {
        pub fn value(&self) -> &str {
            &self.value
        }

        pub fn description(&self) -> Option<&str> {
            self.description.as_deref()
        }

        /// Bare URL found in running text; it has no brackets to rewrite.
        pub fn is_implicit(&self) -> bool {
            self.range.is_none()
        }

        /// Rewrite the link target inside `host`, leaving every other token alone.
        pub fn set_value(&mut self, host: &mut impl LinkHost, value: impl Into<String>) -> OrgResult<()> {
            let value = value.into();
            self.rewrite(host, &value, self.description.as_deref())?;
            self.value = value;
            Ok(())
        }

        /// Replace or drop the description. `None` turns `[[a][b]]` into `[[a]]`.
        pub fn set_description(
            &mut self,
            host: &mut impl LinkHost,
            description: Option<&str>,
        ) -> OrgResult<()> {
            self.rewrite(host, &self.value, description)?;
            self.description = description.map(str::to_string);
            Ok(())
        }

        fn rewrite(&self, host: &mut impl LinkHost, value: &str, description: Option<&str>) -> OrgResult<()> {
            let range = self.range.as_ref().ok_or(OrgError::DetachedLink)?;
            let text = host
                .text_at_mut(&range.location)
                .ok_or(OrgError::DetachedLink)?;
            let mut tokens = vec![Token::text(value)];
            if let Some(description) = description {
                tokens.push(Token::LinkDescription);
                tokens.push(Token::text(description));
            }
            if text.splice_between(range.open, range.close, tokens) {
                Ok(())
            } else {
                Err(OrgError::DetachedLink)
            }
        }
    }

    /// Bracket links of `text` in order, plus bare URLs in the text around them.
    fn collect_links(text: &Text, location: TextLocation, out: &mut Vec<Link>) {
        // (open token, target, description)
        let mut open: Option<(TokenId, String, Option<String>)> = None;
        for (id, token) in text.slots() {
            match token {
                Token::LinkOpen => open = Some((*id, String::new(), None)),
                Token::LinkDescription => {
                    if let Some((_, _, description)) = open.as_mut() {
                        *description = Some(String::new());
                    }
                }
                Token::LinkClose => {
                    if let Some((start, value, description)) = open.take() {
                        out.push(Link {
                            value,
                            description,
                            range: Some(LinkRange {
                                location: location.clone(),
                                open: start,
                                close: *id,
                            }),
                        });
                    }
                }
                Token::Text(s) => match open.as_mut() {
                    Some((_, value, description)) => {
                        description.as_mut().unwrap_or(value).push_str(s)
                    }
                    None => out.extend(implicit_links(s).into_iter().map(|url| Link {
                        value: url.clone(),
                        description: Some(url),
                        range: None,
                    })),
                },
                Token::Open(_) | Token::Close(_) => {}
            }
        }
    }

    fn section_links(section: &Section, path: &[usize], out: &mut Vec<Link>) {
        let at = |slot| TextLocation {
            path: path.to_vec(),
            slot,
        };
        for (index, text) in section.contents.iter().enumerate() {
            collect_links(text, at(TextSlot::Content(index)), out);
        }
        for (index, item) in section.list_items.iter().enumerate() {
            if let Some(tag) = &item.tag {
                collect_links(tag, at(TextSlot::ListItemTag(index)), out);
            }
            collect_links(&item.content, at(TextSlot::ListItemContent(index)), out);
        }
    }

    fn headline_links(headline: &Headline, path: &mut Vec<usize>, recurse: bool, out: &mut Vec<Link>) {
        collect_links(
            &headline.title,
            TextLocation {
                path: path.clone(),
                slot: TextSlot::Title,
            },
            out,
        );
        section_links(&headline.section, path, out);
        if recurse {
            for (index, child) in headline.children.iter().enumerate() {
                path.push(index);
                headline_links(child, path, true, out);
                path.pop();
            }
        }
    }

    /* ------------------------------- Sections ------------------------------- */

    impl Section {
        /// Text lines numbered `start..end`, in line order.
        pub fn get_lines_between(&self, start: usize, end: usize) -> Vec<String> {
            let mut lines: Vec<(usize, String)> = Vec::new();
            for text in &self.contents {
                for (offset, line) in text.raw().split('\n').enumerate() {
                    let number = text.line + offset;
                    if (start..end).contains(&number) {
                        lines.push((number, line.to_string()));
                    }
                }
            }
            lines.sort_by_key(|(number, _)| *number);
            lines.into_iter().map(|(_, line)| line).collect()
        }

        /// First `:END:` below `line`.
        pub fn get_structural_end_after(&self, line: usize) -> Option<&StructuralLine> {
            self.structural
                .iter()
                .find(|s| s.line > line && s.is_drawer_end())
        }

        /// List items grouped into runs. Items separated only by blank lines share a run.
        pub fn lists(&self) -> Vec<Vec<&ListItem>> {
            let mut lists: Vec<Vec<&ListItem>> = Vec::new();
            let mut last_line: Option<usize> = None;
            for item in &self.list_items {
                let joins = last_line.is_some_and(|last| {
                    let gap = item.line.saturating_sub(last + 1);
                    let between = self.get_lines_between(last + 1, item.line);
                    between.len() == gap && between.iter().all(|line| line.trim().is_empty())
                });
                match lists.last_mut() {
                    Some(run) if joins => run.push(item),
                    _ => lists.push(vec![item]),
                }
                last_line = Some(item.last_line());
            }
            lists
        }

        /// Table rows grouped by adjacency.
        pub fn tables(&self) -> Vec<Vec<&TableRow>> {
            let mut tables: Vec<Vec<&TableRow>> = Vec::new();
            let mut last_line: Option<usize> = None;
            for row in &self.table_rows {
                match tables.last_mut() {
                    Some(table) if last_line.is_some_and(|last| last + 1 == row.line) => table.push(row),
                    _ => tables.push(vec![row]),
                }
                last_line = Some(row.line);
            }
            tables
        }

        pub fn code_snippets(&self) -> Vec<CodeSnippet> {
            // (last body line, snippet)
            let mut snippets: Vec<(usize, CodeSnippet)> = Vec::new();
            let mut begin: Option<&Delimiter> = None;
            for delimiter in self
                .delimiters
                .iter()
                .filter(|d| d.subtype.eq_ignore_ascii_case("SRC"))
            {
                match delimiter.kind {
                    DelimiterKind::Begin => begin = Some(delimiter),
                    DelimiterKind::End => {
                        let Some(start) = begin.take() else {
                            continue;
                        };
                        let body = self.get_lines_between(start.line + 1, delimiter.line).join("\n");
                        let content = unescape_block(&body);
                        let arguments = start.arguments.trim();
                        let name = self
                            .keywords
                            .iter()
                            .find(|k| k.key.eq_ignore_ascii_case("NAME") && k.line + 1 == start.line)
                            .map(|k| k.value.trim().to_string());
                        snippets.push((
                            delimiter.line.saturating_sub(1),
                            CodeSnippet {
                                name,
                                content: content.strip_suffix('\n').unwrap_or(&content).to_string(),
                                result: None,
                                arguments: (!arguments.is_empty()).then(|| arguments.to_string()),
                            },
                        ));
                    }
                }
            }
            for keyword in self
                .keywords
                .iter()
                .filter(|k| k.key.eq_ignore_ascii_case("RESULTS"))
            {
                let Some((_, snippet)) = snippets
                    .iter_mut()
                    .rev()
                    .find(|(last, _)| *last < keyword.line)
                else {
                    debug!("line {}: #+RESULTS: with no source block above", keyword.line);
                    continue;
                };
                if let Some(result) = self.result_after(keyword.line) {
                    snippet.result = Some(result);
                }
            }
            snippets.into_iter().map(|(_, snippet)| snippet).collect()
        }

        /// Output recorded below a `#+RESULTS:` keyword on `line`.
        fn result_after(&self, line: usize) -> Option<String> {
            if let Some(text) = self.contents.iter().find(|t| t.line == line + 1) {
                let raw = text.raw();
                if !raw.trim_start().starts_with(": ") {
                    return Some(raw.trim_end_matches('\n').to_string());
                }
                let mut lines = Vec::new();
                for line in raw.split('\n') {
                    let trimmed = line.trim_start();
                    match trimmed.strip_prefix(": ") {
                        Some(body) => lines.push(body),
                        None if trimmed == ":" => lines.push(""),
                        None => break,
                    }
                }
                return Some(lines.join("\n"));
            }
            let drawer = self
                .structural
                .iter()
                .find(|s| s.line == line + 1 && s.drawer_name().as_deref() == Some("RESULTS"))?;
            let end = self.get_structural_end_after(drawer.line)?;
            let dedent = drawer.text.find(':').unwrap_or(0);
            let lines: Vec<String> = self
                .get_lines_between(drawer.line + 1, end.line)
                .iter()
                .map(|line| {
                    let spaces = line.len() - line.trim_start_matches(' ').len();
                    line[spaces.min(dedent)..].to_string()
                })
                .collect();
            Some(lines.join("\n"))
        }

        /// `CLOCK:` entries of the text lines, in order. Malformed entries are skipped.
        pub fn clock(&self) -> Vec<TimeValue> {
            let mut entries = Vec::new();
            for text in &self.contents {
                for (offset, line) in text.raw().split('\n').enumerate() {
                    let Some(entry) = line.trim().strip_prefix("CLOCK:") else {
                        continue;
                    };
                    match TimeValue::parse(entry) {
                        Ok(Some(value)) => entries.push(value),
                        Ok(None) => debug!("line {}: unreadable clock entry", text.line + offset),
                        Err(err) => debug!("line {}: {err}", text.line + offset),
                    }
                }
            }
            entries
        }
    }

    /// Drop the `,` that protects block lines starting with `*`.
    fn unescape_block(body: &str) -> String {
        body.split('\n')
            .map(|line| {
                let indent = line.len() - line.trim_start().len();
                if line[indent..].starts_with(",*") {
                    format!("{}{}", &line[..indent], &line[indent + 1..])
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /* ------------------------------- Headlines ------------------------------- */

    impl Headline {
        /// Links in the title, text and list items of this headline (not its children).
        /// Rewrite them through this headline.
        pub fn links(&self) -> Vec<Link> {
            let mut out = Vec::new();
            headline_links(self, &mut Vec::new(), false, &mut out);
            out
        }

        pub fn lists(&self) -> Vec<Vec<&ListItem>> {
            self.section.lists()
        }

        pub fn tables(&self) -> Vec<Vec<&TableRow>> {
            self.section.tables()
        }

        pub fn code_snippets(&self) -> Vec<CodeSnippet> {
            self.section.code_snippets()
        }

        pub fn clock(&self) -> Vec<TimeValue> {
            self.section.clock()
        }

        /// Append an own tag; descendants see it as inherited.
        pub fn add_tag(&mut self, tag: impl Into<String>) {
            if self.shallow_tags.is_empty() && self.tags_padding.is_empty() {
                self.tags_padding = " ".to_string();
            }
            self.shallow_tags.push(tag.into());
            self.refresh_inherited_tags();
        }

        /// Remove an own tag. Returns whether it was present.
        pub fn remove_tag(&mut self, tag: &str) -> bool {
            let before = self.shallow_tags.len();
            self.shallow_tags.retain(|t| t != tag);
            let removed = self.shallow_tags.len() != before;
            if removed {
                self.refresh_inherited_tags();
            }
            removed
        }

        fn refresh_inherited_tags(&mut self) {
            let effective = self.tags();
            for child in &mut self.children {
                child.parent_tags = effective.clone();
                child.refresh_inherited_tags();
            }
        }
    }

    /* ------------------------------- Document ------------------------------- */

    impl Document {
        /// Every link: the text before the first headline, then all headlines pre-order.
        /// Rewrite them through the document.
        pub fn links(&self) -> Vec<Link> {
            let mut out = Vec::new();
            section_links(&self.section, &[], &mut out);
            let mut path = Vec::new();
            for (index, headline) in self.headlines.iter().enumerate() {
                path.push(index);
                headline_links(headline, &mut path, true, &mut out);
                path.pop();
            }
            out
        }

        pub fn code_snippets(&self) -> Vec<CodeSnippet> {
            let mut snippets = self.section.code_snippets();
            for headline in self.all_headlines() {
                snippets.extend(headline.code_snippets());
            }
            snippets
        }
    }

}

pub mod dom {
    //! Tree view of a section. Line records are replayed in source order through
    //! a small container state machine: drawers, blocks, list groups (nested by
    //! indentation) and tables fold their lines into nodes. The view is derived
    //! on demand and never written back.

    use crate::core::*;
    use log::{error, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DrawerKind {
        Properties,
        Logbook,
        Results,
        Other,
    }

    impl DrawerKind {
        fn from_name(name: &str) -> Self {
            match name {
                "PROPERTIES" => DrawerKind::Properties,
                "LOGBOOK" => DrawerKind::Logbook,
                "RESULTS" => DrawerKind::Results,
                _ => DrawerKind::Other,
            }
        }
    }

    /// Inline content with properly nested emphasis folded into spans.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Inline {
        Text(String),
        Emphasis { kind: Marker, children: Vec<Inline> },
        /// A marker whose partner interleaves with another span.
        Marker { kind: Marker, open: bool },
        Link { value: String, description: Option<String> },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Row {
        Cells(Vec<String>),
        Separator,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListEntry {
        pub line: usize,
        pub ordered: bool,
        pub checked: Option<bool>,
        pub tag: Option<Vec<Inline>>,
        pub content: Vec<Inline>,
        /// Nested lists.
        pub children: Vec<DomNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DomNode {
        Keyword { line: usize, key: String, value: String },
        Property { line: usize, key: String, value: PropertyValue },
        Text { line: usize, content: Vec<Inline> },
        Drawer { line: usize, kind: DrawerKind, name: String, children: Vec<DomNode> },
        List { line: usize, items: Vec<ListEntry> },
        Table { line: usize, rows: Vec<Row> },
        Block { line: usize, subtype: String, arguments: String, content: String },
    }

    impl Headline {
        pub fn as_dom(&self) -> OrgResult<Vec<DomNode>> {
            project(&self.section)
        }
    }

    impl Document {
        /// Projection of the lines before the first headline.
        pub fn as_dom(&self) -> OrgResult<Vec<DomNode>> {
            project(&self.section)
        }
    }

    pub fn project(section: &Section) -> OrgResult<Vec<DomNode>> {
        let mut projector = Projector::default();
        for item in section.items() {
            projector.feed(item)?;
        }
        Ok(projector.finish())
    }

    /* ------------------------------ Inline spans ------------------------------ */

    pub fn inline_tree<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Vec<Inline> {
        let tokens: Vec<&Token> = tokens.into_iter().collect();
        let paired = pair_markers(&tokens);
        let mut root = Vec::new();
        let mut spans: Vec<(Marker, Vec<Inline>)> = Vec::new();
        let mut link: Option<(String, Option<String>)> = None;

        fn push(root: &mut Vec<Inline>, spans: &mut [(Marker, Vec<Inline>)], node: Inline) {
            let target = match spans.last_mut() {
                Some((_, children)) => children,
                None => root,
            };
            // continuation lines arrive as separate text tokens
            if let (Inline::Text(new), Some(Inline::Text(last))) = (&node, target.last_mut()) {
                last.push_str(new);
                return;
            }
            target.push(node);
        }

        for (index, token) in tokens.iter().enumerate() {
            match token {
                Token::Text(s) => match link.as_mut() {
                    Some((value, description)) => description.as_mut().unwrap_or(value).push_str(s),
                    None => push(&mut root, &mut spans, Inline::Text(s.clone())),
                },
                Token::Open(kind) if paired[index] => spans.push((*kind, Vec::new())),
                Token::Close(_) if paired[index] => {
                    if let Some((kind, children)) = spans.pop() {
                        push(&mut root, &mut spans, Inline::Emphasis { kind, children });
                    }
                }
                Token::Open(kind) => push(&mut root, &mut spans, Inline::Marker { kind: *kind, open: true }),
                Token::Close(kind) => push(&mut root, &mut spans, Inline::Marker { kind: *kind, open: false }),
                Token::LinkOpen => link = Some((String::new(), None)),
                Token::LinkDescription => {
                    if let Some((_, description)) = link.as_mut() {
                        *description = Some(String::new());
                    }
                }
                Token::LinkClose => {
                    if let Some((value, description)) = link.take() {
                        push(&mut root, &mut spans, Inline::Link { value, description });
                    }
                }
            }
        }
        root
    }

    /// Which markers close in stack order. Interleaved pairs stay unpaired.
    fn pair_markers(tokens: &[&Token]) -> Vec<bool> {
        let mut paired = vec![false; tokens.len()];
        let mut open: Vec<(Marker, usize)> = Vec::new();
        for (index, token) in tokens.iter().enumerate() {
            match token {
                Token::Open(kind) => open.push((*kind, index)),
                Token::Close(kind) => match open.last() {
                    Some(&(top, at)) if top == *kind => {
                        open.pop();
                        paired[at] = true;
                        paired[index] = true;
                    }
                    _ => {
                        if let Some(pos) = open.iter().rposition(|(k, _)| k == kind) {
                            open.remove(pos);
                        }
                    }
                },
                _ => {}
            }
        }
        paired
    }

    /* ------------------------------ State machine ------------------------------ */

    enum Container {
        Drawer {
            line: usize,
            kind: DrawerKind,
            name: String,
            /// Opened for properties that have no drawer line of their own.
            implicit: bool,
            children: Vec<DomNode>,
        },
        Block {
            line: usize,
            subtype: String,
            arguments: String,
            lines: Vec<String>,
        },
    }

    impl Container {
        fn into_node(self) -> DomNode {
            match self {
                Container::Drawer {
                    line,
                    kind,
                    name,
                    children,
                    ..
                } => DomNode::Drawer {
                    line,
                    kind,
                    name,
                    children,
                },
                Container::Block {
                    line,
                    subtype,
                    arguments,
                    lines,
                } => DomNode::Block {
                    line,
                    subtype,
                    arguments: arguments.trim().to_string(),
                    content: lines.join("\n"),
                },
            }
        }
    }

    #[derive(Default)]
    struct Projector {
        out: Vec<DomNode>,
        open: Vec<Container>,
        /// Open list levels: (indentation width, items).
        list: Vec<(usize, Vec<ListEntry>)>,
        /// (first line, last line, rows)
        table: Option<(usize, usize, Vec<Row>)>,
    }

    impl Projector {
        fn feed(&mut self, item: SectionItem<'_>) -> OrgResult<()> {
            if let Some(Container::Block { subtype, lines, .. }) = self.open.last_mut() {
                match item {
                    SectionItem::Content(text) => lines.push(text.raw()),
                    SectionItem::Delimiter(d)
                        if d.kind == DelimiterKind::End && d.subtype.eq_ignore_ascii_case(subtype) =>
                    {
                        if let Some(block) = self.open.pop() {
                            self.emit(block.into_node());
                        }
                    }
                    other => {
                        return Err(OrgError::UnknownNodeInProjection {
                            node: kind_name(&other),
                            line: other.line(),
                        });
                    }
                }
                return Ok(());
            }

            if !matches!(item, SectionItem::Property(_)) {
                self.close_implicit();
            }
            match item {
                SectionItem::Keyword(keyword) => {
                    self.flush();
                    self.emit(DomNode::Keyword {
                        line: keyword.line,
                        key: keyword.key.clone(),
                        value: keyword.value.clone(),
                    });
                }
                SectionItem::Property(property) => {
                    self.flush();
                    let in_drawer = matches!(
                        self.open.last(),
                        Some(Container::Drawer {
                            kind: DrawerKind::Properties,
                            ..
                        })
                    );
                    if !in_drawer {
                        self.open.push(Container::Drawer {
                            line: property.line,
                            kind: DrawerKind::Properties,
                            name: "PROPERTIES".to_string(),
                            implicit: true,
                            children: Vec::new(),
                        });
                    }
                    self.emit(DomNode::Property {
                        line: property.line,
                        key: property.key.clone(),
                        value: property.value.clone(),
                    });
                }
                SectionItem::Content(text) => {
                    self.flush();
                    self.emit(DomNode::Text {
                        line: text.line,
                        content: inline_tree(text.tokens()),
                    });
                }
                SectionItem::ListItem(item) => {
                    self.flush_table();
                    self.add_list_item(item);
                }
                SectionItem::TableRow(row) => {
                    self.flush_list();
                    self.add_row(row);
                }
                SectionItem::Structural(structural) => {
                    self.flush();
                    if structural.is_drawer_end() {
                        self.close_drawer(structural.line);
                    } else {
                        let name = structural.drawer_name().unwrap_or_default();
                        self.open.push(Container::Drawer {
                            line: structural.line,
                            kind: DrawerKind::from_name(&name),
                            name,
                            implicit: false,
                            children: Vec::new(),
                        });
                    }
                }
                SectionItem::Delimiter(delimiter) => {
                    self.flush();
                    match delimiter.kind {
                        DelimiterKind::Begin => self.open.push(Container::Block {
                            line: delimiter.line,
                            subtype: delimiter.subtype.clone(),
                            arguments: delimiter.arguments.clone(),
                            lines: Vec::new(),
                        }),
                        DelimiterKind::End => {
                            return Err(OrgError::UnknownNodeInProjection {
                                node: "block end",
                                line: delimiter.line,
                            });
                        }
                    }
                }
            }
            Ok(())
        }

        fn emit(&mut self, node: DomNode) {
            match self.open.last_mut() {
                Some(Container::Drawer { children, .. }) => children.push(node),
                _ => self.out.push(node),
            }
        }

        fn flush(&mut self) {
            self.flush_list();
            self.flush_table();
        }

        fn close_implicit(&mut self) {
            while matches!(self.open.last(), Some(Container::Drawer { implicit: true, .. })) {
                if let Some(drawer) = self.open.pop() {
                    self.emit(drawer.into_node());
                }
            }
        }

        fn close_drawer(&mut self, line: usize) {
            match self.open.pop() {
                Some(drawer @ Container::Drawer { .. }) => self.emit(drawer.into_node()),
                Some(block) => {
                    error!("line {line}: :END: inside an open block");
                    self.open.push(block);
                }
                None => error!("line {line}: :END: with no open drawer"),
            }
        }

        fn add_list_item(&mut self, item: &ListItem) {
            let indentation = item.indentation.chars().count();
            let entry = ListEntry {
                line: item.line,
                ordered: item.bullet.is_ordered(),
                checked: item.checkbox.as_ref().map(Checkbox::is_checked),
                tag: item.tag.as_ref().map(|tag| inline_tree(tag.tokens())),
                content: inline_tree(item.content.tokens()),
                children: Vec::new(),
            };
            while self.list.len() > 1 && self.list.last().is_some_and(|(level, _)| indentation < *level) {
                collapse_level(&mut self.list);
            }
            match self.list.last_mut() {
                Some((level, entries)) if indentation <= *level => entries.push(entry),
                _ => self.list.push((indentation, vec![entry])),
            }
        }

        fn flush_list(&mut self) {
            while self.list.len() > 1 {
                collapse_level(&mut self.list);
            }
            if let Some((_, items)) = self.list.pop() {
                let line = items.first().map_or(0, |entry| entry.line);
                self.emit(DomNode::List { line, items });
            }
        }

        fn add_row(&mut self, row: &TableRow) {
            if self
                .table
                .as_ref()
                .is_some_and(|(_, last, _)| last + 1 != row.line)
            {
                self.flush_table();
            }
            let cells = if row.is_separator() {
                Row::Separator
            } else {
                Row::Cells(row.cells.iter().map(|cell| cell.trim().to_string()).collect())
            };
            match self.table.as_mut() {
                Some((_, last, rows)) => {
                    *last = row.line;
                    rows.push(cells);
                }
                None => self.table = Some((row.line, row.line, vec![cells])),
            }
        }

        fn flush_table(&mut self) {
            if let Some((line, _, rows)) = self.table.take() {
                self.emit(DomNode::Table { line, rows });
            }
        }

        fn finish(mut self) -> Vec<DomNode> {
            self.flush();
            self.close_implicit();
            while let Some(container) = self.open.pop() {
                let node = container.into_node();
                match &node {
                    DomNode::Block { line, subtype, .. } => {
                        warn!("line {line}: #+BEGIN_{subtype} never closed")
                    }
                    DomNode::Drawer { line, name, .. } => warn!("line {line}: :{name}: never closed"),
                    _ => {}
                }
                self.emit(node);
            }
            self.out
        }
    }

    /// Fold the innermost list level into the last item of the level above.
    fn collapse_level(levels: &mut Vec<(usize, Vec<ListEntry>)>) {
        let Some((_, items)) = levels.pop() else {
            return;
        };
        let line = items.first().map_or(0, |entry| entry.line);
        if let Some(parent) = levels.last_mut().and_then(|(_, entries)| entries.last_mut()) {
            parent.children.push(DomNode::List { line, items });
        }
    }

    fn kind_name(item: &SectionItem<'_>) -> &'static str {
        match item {
            SectionItem::Keyword(_) => "keyword",
            SectionItem::Property(_) => "property",
            SectionItem::Content(..) => "text",
            SectionItem::ListItem(..) => "list item",
            SectionItem::TableRow(_) => "table row",
            SectionItem::Structural(_) => "drawer line",
            SectionItem::Delimiter(_) => "block delimiter",
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::format::tests::{fixture, CODE, LISTS, ROAM, SIMPLE, TABLES};
        use crate::inline::tokenize;
        use crate::reader::parse;
        use pretty_assertions::assert_eq;

        fn text(s: &str) -> Inline {
            Inline::Text(s.to_string())
        }

        #[test]
        fn nested_emphasis_becomes_spans() {
            let tree = inline_tree(&tokenize("a *b /c/* [[x][y]]"));
            assert_eq!(
                tree,
                vec![
                    text("a "),
                    Inline::Emphasis {
                        kind: Marker::Bold,
                        children: vec![
                            text("b "),
                            Inline::Emphasis {
                                kind: Marker::Italic,
                                children: vec![text("c")],
                            },
                        ],
                    },
                    text(" "),
                    Inline::Link {
                        value: "x".into(),
                        description: Some("y".into()),
                    },
                ]
            );
        }

        #[test]
        fn interleaved_markers_stay_flat() {
            let tree = inline_tree(&tokenize("*bold /italic* here/"));
            assert_eq!(
                tree,
                vec![
                    Inline::Marker {
                        kind: Marker::Bold,
                        open: true,
                    },
                    text("bold "),
                    Inline::Emphasis {
                        kind: Marker::Italic,
                        children: vec![
                            text("italic"),
                            Inline::Marker {
                                kind: Marker::Bold,
                                open: false,
                            },
                            text(" here"),
                        ],
                    },
                ]
            );
        }

        #[test]
        fn property_drawer_then_text() {
            let doc = parse(SIMPLE, false).expect("parse");
            let dom = doc.headlines[0].as_dom().expect("dom");
            assert_eq!(dom.len(), 2);
            let DomNode::Drawer { kind, children, line, .. } = &dom[0] else {
                panic!("expected drawer, got {:?}", dom[0]);
            };
            assert_eq!((*kind, *line), (DrawerKind::Properties, 11));
            let keys: Vec<&str> = children
                .iter()
                .filter_map(|node| match node {
                    DomNode::Property { key, .. } => Some(key.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(keys, ["ID", "CREATED"]);
            assert!(matches!(&dom[1], DomNode::Text { line: 15, .. }));
        }

        #[test]
        fn added_properties_get_an_implicit_drawer() {
            let mut doc = parse("* H\nbody", false).expect("parse");
            doc.headlines[0].set_property("A", "1");
            let dom = doc.headlines[0].as_dom().expect("dom");
            assert_eq!(
                dom[0],
                DomNode::Drawer {
                    line: 1,
                    kind: DrawerKind::Properties,
                    name: "PROPERTIES".into(),
                    children: vec![DomNode::Property {
                        line: 1,
                        key: "A".into(),
                        value: PropertyValue::Text("1".into()),
                    }],
                }
            );
            assert!(matches!(&dom[1], DomNode::Text { line: 2, .. }));
        }

        #[test]
        fn lists_nest_by_indentation() {
            let doc = parse(&fixture(LISTS), false).expect("parse");
            let dom = doc.headlines[2].as_dom().expect("dom");
            let [DomNode::List { items, line }] = dom.as_slice() else {
                panic!("expected a single list, got {dom:?}");
            };
            assert_eq!(*line, 13);
            assert_eq!(items.len(), 3);
            let [DomNode::List { items: nested, .. }] = items[0].children.as_slice() else {
                panic!("expected a nested list");
            };
            assert_eq!(nested.len(), 2);
            assert_eq!(nested[1].checked, Some(true));
            assert_eq!(items[2].tag, Some(vec![text("Term ")]));
            assert_eq!(items[2].content, vec![text(" Description\n")]);
        }

        #[test]
        fn tables_and_separators() {
            let doc = parse(TABLES, false).expect("parse");
            let dom = doc.headlines[0].as_dom().expect("dom");
            assert_eq!(
                dom[0],
                DomNode::Table {
                    line: 4,
                    rows: vec![
                        Row::Cells(vec!["Header1".into(), "Header2".into()]),
                        Row::Separator,
                        Row::Cells(vec!["Content".into(), "more".into()]),
                        Row::Cells(vec!["unclosed".into()]),
                    ],
                }
            );
        }

        #[test]
        fn code_blocks_and_result_drawers() {
            let doc = parse(CODE, false).expect("parse");
            let dom = doc.headlines[1].as_dom().expect("dom");
            assert!(matches!(&dom[0], DomNode::Keyword { key, .. } if key == "NAME"));
            assert_eq!(
                dom[1],
                DomNode::Block {
                    line: 16,
                    subtype: "SRC".into(),
                    arguments: "sh :results drawer".into(),
                    content: "echo \"This is another test\"\n,* not a headline".into(),
                }
            );
            let drawer = dom
                .iter()
                .find_map(|node| match node {
                    DomNode::Drawer { kind, children, .. } => Some((*kind, children.len())),
                    _ => None,
                })
                .expect("results drawer");
            assert_eq!(drawer, (DrawerKind::Results, 1));
        }

        #[test]
        fn document_preamble_and_other_drawers() {
            let doc = parse(ROAM, false).expect("parse");
            let dom = doc.as_dom().expect("dom");
            assert!(matches!(&dom[0], DomNode::Drawer { kind: DrawerKind::Properties, .. }));
            assert!(matches!(&dom[1], DomNode::Keyword { key, .. } if key == "title"));

            let doc = parse("* H\n:NOTES:\nsomething\n:END:", false).expect("parse");
            let dom = doc.headlines[0].as_dom().expect("dom");
            assert!(matches!(
                &dom[..],
                [DomNode::Drawer { kind: DrawerKind::Other, name, children, .. }]
                    if name == "NOTES" && children.len() == 1
            ));
        }

        #[test]
        fn stray_end_is_ignored_but_stray_block_end_fails() {
            let doc = parse("* H\n:END:\ntext", false).expect("parse");
            let dom = doc.headlines[0].as_dom().expect("dom");
            assert!(matches!(&dom[..], [DomNode::Text { line: 3, .. }]));

            let doc = parse("* H\n#+END_SRC", false).expect("parse");
            assert!(matches!(
                doc.headlines[0].as_dom(),
                Err(OrgError::UnknownNodeInProjection { line: 2, .. })
            ));
        }
    }
}

pub mod storage {
    //! Reading documents from disk.

    use crate::core::{Document, LoadOptions, OrgError, OrgResult};
    use crate::format::serialize;
    use crate::reader::parse_with;
    use std::{fs, path::Path};

    /// Parsing is independent of where the text comes from.
    pub trait OrgParser {
        fn parse_file(&self, path: &Path) -> OrgResult<Document>;
    }

    /// Reads UTF-8 files and records their absolute path on the document.
    #[derive(Debug, Clone, Default)]
    pub struct FsOrgParser {
        pub options: LoadOptions,
    }

    impl OrgParser for FsOrgParser {
        fn parse_file(&self, path: &Path) -> OrgResult<Document> {
            let text = fs::read_to_string(path).map_err(|source| OrgError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let mut doc = parse_with(&text, &self.options)?;
            doc.path = Some(std::path::absolute(path).map_err(|source| OrgError::Io {
                path: path.to_path_buf(),
                source,
            })?);
            Ok(doc)
        }
    }

    pub fn parse_file(path: impl AsRef<Path>) -> OrgResult<Document> {
        FsOrgParser::default().parse_file(path.as_ref())
    }

    pub fn parse_file_with(path: impl AsRef<Path>, options: &LoadOptions) -> OrgResult<Document> {
        FsOrgParser {
            options: options.clone(),
        }
        .parse_file(path.as_ref())
    }

    /// Serialize `doc` over `path`.
    pub fn write_file(path: impl AsRef<Path>, doc: &Document) -> OrgResult<()> {
        let path = path.as_ref();
        fs::write(path, serialize(doc)).map_err(|source| OrgError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

}
