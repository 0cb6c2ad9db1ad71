//! Pseudo-XML document decoder.
//!
//! Accepts a restricted markup subset: elements and text only, no
//! attributes, comments, namespaces or self-closing tags. Every element must
//! be closed explicitly and closing names are compared case-sensitively.
//! Path queries compare names case-insensitively.
//!
//! The parser is a character-driven automaton with an explicit stack of open
//! elements. Nesting is limited to [`MAX_DEPTH`] open elements.

use thiserror::Error;

/// Maximum number of simultaneously open elements.
pub const MAX_DEPTH: usize = 20;

/// Errors raised while parsing or querying a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Character not allowed in the current automaton state.
    #[error("syntax error at offset {offset}")]
    Syntax {
        /// Byte offset of the offending character.
        offset: usize,
    },

    /// A closing tag arrived while no element was open.
    #[error("closing tag </{name}> without open element")]
    UnmatchedClose {
        /// Name in the closing tag.
        name: String,
    },

    /// A closing tag names a different element than the innermost open one.
    #[error("closing tag </{found}> does not match <{expected}>")]
    TagMismatch {
        /// Name of the innermost open element.
        expected: String,
        /// Name in the closing tag.
        found: String,
    },

    /// More than [`MAX_DEPTH`] elements open at once.
    #[error("element nesting exceeds {MAX_DEPTH}")]
    DepthExceeded,

    /// Input ended before the root element was closed.
    #[error("document incomplete")]
    Incomplete,

    /// A path segment does not exist.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The addressed element carries no text.
    #[error("no value at {0}")]
    NoValue(String),

    /// The addressed text is not an integer.
    #[error("invalid value at {0}")]
    InvalidValue(String),
}

/// One decoded element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    value: Option<String>,
    children: Vec<Node>,
}

impl Node {
    /// An element with text content.
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    /// An element with child elements and no text.
    pub fn element(name: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            value: None,
            children,
        }
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accumulated text content.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Find the first direct child with this name (case-insensitive).
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a `root/child/...` path.
    ///
    /// The first segment stands for this node and is not compared with its name.
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        if segments.next().is_none() {
            return Ok(self);
        }
        let mut node = self;
        for segment in segments {
            node = node
                .child(segment)
                .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
        }
        Ok(node)
    }

    /// Text value at `path`.
    pub fn get_string(&self, path: &str) -> Result<&str, TreeError> {
        self.get(path)?
            .value()
            .ok_or_else(|| TreeError::NoValue(path.to_owned()))
    }

    /// Integer value at `path` (leading whitespace and sign accepted, trailing text ignored).
    pub fn get_int(&self, path: &str) -> Result<i64, TreeError> {
        let raw = self.get_string(path)?.trim_start();
        let end = raw
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
            .map_or(raw.len(), |(i, _)| i);
        raw[..end]
            .parse()
            .map_err(|_| TreeError::InvalidValue(path.to_owned()))
    }

    /// Every direct child of the parent path whose name equals the last segment.
    ///
    /// A path with at most one segment returns this node alone.
    pub fn get_all(&self, path: &str) -> Result<Vec<&Node>, TreeError> {
        let Some((parent, last)) = path.trim_end_matches('/').rsplit_once('/') else {
            return Ok(vec![self]);
        };
        let parent = self.get(parent)?;
        Ok(parent
            .children
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(last))
            .collect())
    }

    /// Text value of the `index`-th child of the element at `path`.
    pub fn get_value(&self, path: &str, index: usize) -> Option<&str> {
        self.get(path).ok()?.children.get(index)?.value()
    }

    /// Serialize back into the markup subset.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        self.write_markup(&mut out);
        out
    }

    fn write_markup(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        out.push('>');
        if let Some(v) = &self.value {
            out.push_str(v);
        }
        for child in &self.children {
            child.write_markup(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    TagStart,
    TagBody,
    TagEnd,
    Value,
}

struct Parser {
    state: State,
    buf: String,
    stack: Vec<Node>,
    root: Option<Node>,
}

/// Parse a document into its root element.
pub fn parse(input: &str) -> Result<Node, TreeError> {
    let mut p = Parser {
        state: State::Start,
        buf: String::new(),
        stack: Vec::with_capacity(MAX_DEPTH),
        root: None,
    };

    for (offset, c) in input.char_indices() {
        match c {
            '<' => p.tag_start(offset)?,
            '>' => p.tag_end(offset)?,
            '/' => p.slash(offset)?,
            c => p.letter(offset, c)?,
        }
    }

    p.finish(input.len())
}

impl Parser {
    fn tag_start(&mut self, offset: usize) -> Result<(), TreeError> {
        match self.state {
            State::Start => {}
            State::TagEnd | State::Value => {
                if self.stack.is_empty() {
                    return Err(TreeError::Syntax { offset });
                }
                self.flush_text();
            }
            State::TagStart | State::TagBody => return Err(TreeError::Syntax { offset }),
        }
        self.buf.clear();
        self.state = State::TagStart;
        Ok(())
    }

    fn tag_end(&mut self, offset: usize) -> Result<(), TreeError> {
        if self.state != State::TagBody {
            return Err(TreeError::Syntax { offset });
        }
        let tag = std::mem::take(&mut self.buf);
        match tag.strip_prefix('/') {
            Some(name) => self.close(name)?,
            None => self.open(tag)?,
        }
        self.state = State::TagEnd;
        Ok(())
    }

    fn slash(&mut self, offset: usize) -> Result<(), TreeError> {
        match self.state {
            State::TagStart => {
                self.buf.push('/');
                self.state = State::TagBody;
            }
            State::Start | State::TagBody => return Err(TreeError::Syntax { offset }),
            State::TagEnd => {
                self.buf.push('/');
                self.state = State::Value;
            }
            State::Value => self.buf.push('/'),
        }
        Ok(())
    }

    fn letter(&mut self, offset: usize, c: char) -> Result<(), TreeError> {
        if c.is_whitespace() {
            match self.state {
                State::Start => {}
                State::TagStart => return Err(TreeError::Syntax { offset }),
                // Whitespace directly after a tag is dropped; text starts at
                // the first other character.
                State::TagEnd => {}
                State::TagBody | State::Value => self.buf.push(c),
            }
            return Ok(());
        }

        match self.state {
            State::Start => return Err(TreeError::Syntax { offset }),
            State::TagStart => {
                self.buf.push(c);
                self.state = State::TagBody;
            }
            State::TagBody | State::Value => self.buf.push(c),
            State::TagEnd => {
                self.buf.push(c);
                self.state = State::Value;
            }
        }
        Ok(())
    }

    fn flush_text(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buf);
        if let Some(top) = self.stack.last_mut() {
            match &mut top.value {
                Some(v) => v.push_str(&text),
                None => top.value = Some(text),
            }
        }
    }

    fn open(&mut self, name: String) -> Result<(), TreeError> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(TreeError::DepthExceeded);
        }
        self.stack.push(Node {
            name,
            value: None,
            children: Vec::new(),
        });
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), TreeError> {
        let Some(top) = self.stack.last() else {
            return Err(TreeError::UnmatchedClose {
                name: name.to_owned(),
            });
        };
        if top.name != name {
            return Err(TreeError::TagMismatch {
                expected: top.name.clone(),
                found: name.to_owned(),
            });
        }
        let Some(mut node) = self.stack.pop() else {
            return Err(TreeError::Incomplete);
        };
        if node.value.is_none() && node.children.is_empty() {
            node.value = Some(String::new());
        }
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root = Some(node),
        }
        Ok(())
    }

    fn finish(self, len: usize) -> Result<Node, TreeError> {
        if self.state == State::Value && !self.buf.trim().is_empty() {
            return Err(TreeError::Syntax { offset: len });
        }
        if !self.stack.is_empty() || matches!(self.state, State::TagStart | State::TagBody) {
            return Err(TreeError::Incomplete);
        }
        self.root.ok_or(TreeError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = "<report>\n  <record>\n    <recordid>TCR00A1</recordid>\n    \
        <status>Real</status>\n    <processorinfo><type>CP</type><max>4</max></processorinfo>\n    \
        <processorinfo><type>zIIP</type><max>2</max></processorinfo>\n  </record>\n</report>";

    #[test]
    fn parses_nested_elements() {
        let root = parse(RECORD).expect("parse");
        assert_eq!(root.name(), "report");
        assert_eq!(
            root.get_string("report/record/recordid").expect("recordid"),
            "TCR00A1"
        );
        assert_eq!(root.get_string("REPORT/Record/STATUS").expect("status"), "Real");
        assert_eq!(
            root.get_int("report/record/processorinfo/max").expect("max"),
            4
        );
    }

    #[test]
    fn get_all_keeps_document_order() {
        let root = parse(RECORD).expect("parse");
        let cpus = root
            .get_all("report/record/processorinfo")
            .expect("processorinfo");
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0].get_string("processorinfo/type").expect("type"), "CP");
        assert_eq!(cpus[1].get_string("processorinfo/type").expect("type"), "zIIP");
    }

    #[test]
    fn get_all_single_segment_returns_root() {
        let root = parse("<a><b>1</b></a>").expect("parse");
        let all = root.get_all("a").expect("get_all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "a");
    }

    #[test]
    fn text_fragments_accumulate() {
        let root = parse("<a>one<b>x</b> two</a>").expect("parse");
        assert_eq!(root.value(), Some("onetwo"));

        let root = parse("<a>\n  x y </a>").expect("parse");
        assert_eq!(root.value(), Some("x y "));
    }

    #[test]
    fn formatting_whitespace_is_not_text() {
        let root = parse("<a>\n  <b>x</b>\n</a>").expect("parse");
        assert_eq!(root.value(), None);
        assert!(matches!(root.get_string("a"), Err(TreeError::NoValue(_))));
    }

    #[test]
    fn empty_leaf_has_empty_value() {
        let root = parse("<a><b></b></a>").expect("parse");
        assert_eq!(root.get_string("a/b").expect("b"), "");
    }

    #[test]
    fn rejects_unmatched_close() {
        let err = parse("</a>").expect_err("expected error");
        assert!(matches!(err, TreeError::UnmatchedClose { ref name } if name == "a"));
    }

    #[test]
    fn rejects_mismatched_close() {
        let err = parse("<a><b>x</c></a>").expect_err("expected error");
        assert_eq!(
            err,
            TreeError::TagMismatch {
                expected: "b".to_owned(),
                found: "c".to_owned(),
            }
        );
    }

    #[test]
    fn depth_limit_is_enforced() {
        let ok: String = (0..MAX_DEPTH).map(|i| format!("<n{i}>")).collect::<String>()
            + &(0..MAX_DEPTH).rev().map(|i| format!("</n{i}>")).collect::<String>();
        assert!(parse(&ok).is_ok());

        let deep: String = (0..=MAX_DEPTH).map(|i| format!("<n{i}>")).collect::<String>()
            + &(0..=MAX_DEPTH).rev().map(|i| format!("</n{i}>")).collect::<String>();
        assert_eq!(parse(&deep).expect_err("expected error"), TreeError::DepthExceeded);
    }

    #[test]
    fn whitespace_after_open_bracket_is_syntax_error() {
        assert!(matches!(parse("< a></a>"), Err(TreeError::Syntax { offset: 1 })));
    }

    #[test]
    fn self_closing_and_slash_in_name_are_rejected() {
        assert!(matches!(parse("<a/>"), Err(TreeError::Syntax { .. })));
        assert!(matches!(parse("<a><b/c></b/c></a>"), Err(TreeError::Syntax { .. })));
    }

    #[test]
    fn second_root_is_rejected() {
        assert!(matches!(parse("<a></a><b></b>"), Err(TreeError::Syntax { .. })));
    }

    #[test]
    fn unterminated_document_is_incomplete() {
        assert_eq!(parse("<a><b>x</b>").expect_err("err"), TreeError::Incomplete);
        assert_eq!(parse("").expect_err("err"), TreeError::Incomplete);
    }

    #[test]
    fn invalid_path_and_value_are_reported() {
        let root = parse("<a><n>12x</n><s>abc</s></a>").expect("parse");
        assert_eq!(root.get_int("a/n").expect("n"), 12);
        assert!(matches!(root.get_int("a/s"), Err(TreeError::InvalidValue(_))));
        assert!(matches!(root.get_string("a/missing"), Err(TreeError::InvalidPath(_))));
        assert_eq!(root.get_string("report/n").expect("root segment is not checked"), "12x");
        assert_eq!(root.get_value("a", 1), Some("abc"));
        assert_eq!(root.get_value("a", 2), None);
    }
}
