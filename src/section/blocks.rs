//! Block-comment markup (`<!-- wp:name {attrs} -->…<!-- /wp:name -->`).
//!
//! Parsing is lossless: rendering a parsed document reproduces the input
//! byte for byte, so untouched content survives a mutation unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::extract::clean_text;

static RE_OPENER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A<!--\s+wp:([a-z][a-z0-9_-]*(?:/[a-z][a-z0-9_-]*)?)\s+(?:(\{.*?\})\s+)?(/)?-->")
        .expect("opener regex")
});
static RE_CLOSER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\A<!--\s+/wp:([a-z][a-z0-9_-]*(?:/[a-z][a-z0-9_-]*)?)\s+-->").expect("closer regex")
});
static RE_ID_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<h[1-6]\b[^>]*\bid\s*=\s*"([^"]*)""#).expect("id regex"));

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Freeform markup between (or inside) blocks, kept verbatim.
    Html(String),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Fully qualified, e.g. `core/heading`.
    pub name: String,
    pub attrs: Option<Value>,
    pub inner: Vec<Node>,
    opener: String,
    closer: Option<String>,
}

/// `heading` -> `core/heading`; namespaced names are kept.
pub fn qualify(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("core/{name}")
    }
}

/// Name as written in a delimiter (`core/` is implicit).
fn delimiter_name(name: &str) -> &str {
    name.strip_prefix("core/").unwrap_or(name)
}

impl Block {
    /// A freshly built block with canonical delimiters.
    pub fn new(name: &str, attrs: Option<Value>, inner: Vec<Node>) -> Self {
        let name = qualify(name);
        let short = delimiter_name(&name).to_string();
        let opener = match &attrs {
            Some(a) => format!("<!-- wp:{short} {a} -->"),
            None => format!("<!-- wp:{short} -->"),
        };
        Self {
            name,
            attrs,
            inner,
            opener,
            closer: Some(format!("<!-- /wp:{short} -->")),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == qualify(name)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.as_ref()?.get(key)?.as_str()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr_str("className")
            .is_some_and(|c| c.split_whitespace().any(|x| x == class))
    }

    /// Everything between the delimiters, nested blocks included.
    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        render_nodes(&self.inner, &mut out);
        out
    }

    /// Visible text with tags stripped and entities decoded.
    pub fn text(&self) -> String {
        clean_text(&self.inner_html())
    }

    /// Heading anchor: the `anchor` attribute, else an `id` on the `<hN>` tag.
    pub fn anchor(&self) -> Option<String> {
        if let Some(a) = self.attr_str("anchor") {
            return Some(a.to_string());
        }
        RE_ID_ATTR
            .captures(&self.inner_html())
            .map(|c| html_escape::decode_html_entities(&c[1]).to_string())
    }

    fn render(&self, out: &mut String) {
        out.push_str(&self.opener);
        render_nodes(&self.inner, out);
        if let Some(c) = &self.closer {
            out.push_str(c);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDocument {
    pub nodes: Vec<Node>,
}

enum Token<'a> {
    Text(&'a str),
    Open { name: String, attrs: Option<Value>, raw: &'a str, void: bool },
    Close { name: String, raw: &'a str },
}

fn tokenize(src: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;
    while let Some(off) = src[pos..].find("<!--") {
        let at = pos + off;
        let rest = &src[at..];
        let delim = if let Some(c) = RE_OPENER.captures(rest) {
            let raw = c.get(0).map_or("", |m| m.as_str());
            let attrs = c.get(2).and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok());
            Some(Token::Open {
                name: qualify(&c[1]),
                attrs,
                raw: &src[at..at + raw.len()],
                void: c.get(3).is_some(),
            })
        } else {
            RE_CLOSER.captures(rest).map(|c| {
                let len = c.get(0).map_or(0, |m| m.len());
                Token::Close {
                    name: qualify(&c[1]),
                    raw: &src[at..at + len],
                }
            })
        };
        match delim {
            Some(tok) => {
                if text_start < at {
                    tokens.push(Token::Text(&src[text_start..at]));
                }
                let len = match &tok {
                    Token::Open { raw, .. } | Token::Close { raw, .. } => raw.len(),
                    Token::Text(t) => t.len(),
                };
                tokens.push(tok);
                pos = at + len;
                text_start = pos;
            }
            None => pos = at + 4,
        }
    }
    if text_start < src.len() {
        tokens.push(Token::Text(&src[text_start..]));
    }
    tokens
}

fn push_html(nodes: &mut Vec<Node>, s: &str) {
    if let Some(Node::Html(prev)) = nodes.last_mut() {
        prev.push_str(s);
    } else {
        nodes.push(Node::Html(s.to_string()));
    }
}

impl BlockDocument {
    pub fn parse(src: &str) -> Self {
        let mut root: Vec<Node> = Vec::new();
        let mut stack: Vec<Block> = Vec::new();

        fn container<'s>(root: &'s mut Vec<Node>, stack: &'s mut [Block]) -> &'s mut Vec<Node> {
            match stack.last_mut() {
                Some(b) => &mut b.inner,
                None => root,
            }
        }

        for tok in tokenize(src) {
            match tok {
                Token::Text(t) => push_html(container(&mut root, &mut stack), t),
                Token::Open { name, attrs, raw, void } => {
                    let block = Block {
                        name,
                        attrs,
                        inner: Vec::new(),
                        opener: raw.to_string(),
                        closer: None,
                    };
                    if void {
                        container(&mut root, &mut stack).push(Node::Block(block));
                    } else {
                        stack.push(block);
                    }
                }
                Token::Close { name, raw } => {
                    let Some(idx) = stack.iter().rposition(|b| b.name == name) else {
                        // Stray closer: keep it as text.
                        push_html(container(&mut root, &mut stack), raw);
                        continue;
                    };
                    // Unclosed blocks above the match end here, without a closer.
                    while stack.len() > idx + 1 {
                        if let Some(b) = stack.pop() {
                            container(&mut root, &mut stack).push(Node::Block(b));
                        }
                    }
                    if let Some(mut b) = stack.pop() {
                        b.closer = Some(raw.to_string());
                        container(&mut root, &mut stack).push(Node::Block(b));
                    }
                }
            }
        }
        while let Some(b) = stack.pop() {
            container(&mut root, &mut stack).push(Node::Block(b));
        }
        Self { nodes: root }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, &mut out);
        out
    }
}

fn render_nodes(nodes: &[Node], out: &mut String) {
    for n in nodes {
        match n {
            Node::Html(s) => out.push_str(s),
            Node::Block(b) => b.render(out),
        }
    }
}
