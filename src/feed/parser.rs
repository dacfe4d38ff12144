//! Streaming RSS parser.
//!
//! A SAX-style pass over the document builds a generic attributed tree, and
//! per-element hooks specialize it into channel/item records on the way out:
//!
//! - element open pushes a frame; `xmlns:` attributes extend a copy-on-write
//!   namespace map inherited from the parent
//! - contiguous text runs coalesce; whitespace-only runs between elements
//!   are dropped
//! - element close runs the post-hook registered for the local name, which
//!   may replace the frame with a processed record (`item`, `channel`, `rss`)
//!
//! Only structurally invalid XML fails the parse. Malformed dates and
//! missing guids are logged and tolerated. Atom is not handled here.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid xml: {0}")]
    Malformed(String),
}

/// Structured result of a parse: `<rss version=...>` plus the channel record
/// and its items. The item list rides beside the channel map; consumers
/// persist the two separately.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub version: Option<String>,
    pub channel: Map<String, Value>,
    pub items: Vec<Map<String, Value>>,
}

/// Parse an RSS 2.0/0.9x document.
pub fn parse(data: &[u8]) -> Result<ParsedFeed, ParseError> {
    let mut parser = RssParser::new();
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => parser.open(&e)?,
            Event::Empty(e) => {
                parser.open(&e)?;
                parser.close()?;
            }
            Event::End(_) => parser.close()?,
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                parser.text(&text);
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                parser.text(&text);
            }
            Event::Eof => break,
            // declaration, comments, processing instructions, doctype
            _ => {}
        }
        buf.clear();
    }

    parser.finish()
}

// ============================================================================
// Namespace bindings
// ============================================================================

/// Prefix → URI bindings in scope for a frame.
///
/// Ownership is explicit: a frame either shares its parent's map (no local
/// `xmlns:` attributes, `owned == false`) or owns a clone extended with its
/// own declarations.
struct Namespaces {
    map: Rc<HashMap<String, String>>,
    owned: bool,
}

impl Namespaces {
    fn root() -> Self {
        Self {
            map: Rc::new(HashMap::new()),
            owned: true,
        }
    }

    /// Share the parent's bindings by reference.
    fn inherit(parent: &Namespaces) -> Self {
        Self {
            map: Rc::clone(&parent.map),
            owned: false,
        }
    }

    /// Bind `prefix`, cloning the inherited map on first local declaration.
    fn declare(&mut self, prefix: &str, uri: String) {
        if !self.owned {
            self.map = Rc::new(self.map.as_ref().clone());
            self.owned = true;
        }
        Rc::make_mut(&mut self.map).insert(prefix.to_string(), uri);
    }

    #[cfg(test)]
    fn get(&self, prefix: &str) -> Option<&str> {
        self.map.get(prefix).map(String::as_str)
    }
}

// ============================================================================
// Tree nodes
// ============================================================================

/// One in-progress element.
struct Frame {
    /// Qualified name as written (`dc:creator` keeps its prefix).
    name: String,
    attrs: Option<Map<String, Value>>,
    #[allow(dead_code)] // bindings are tracked for children; nothing reads them after close
    xmlns: Namespaces,
    content: Vec<Node>,
}

/// Content of a frame. Processed elements become tagged records; everything
/// else stays a raw element or text run.
enum Node {
    Text(String),
    Element(Frame),
    Item(Map<String, Value>),
    Channel {
        channel: Map<String, Value>,
        items: Vec<Map<String, Value>>,
    },
}

impl Frame {
    /// Local part of the qualified name.
    fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Single-value rendition used when collapsing a parent: text content if
    /// present, nested children collapsed to a record, else the attribute
    /// map. An element with neither yields nothing.
    fn into_value(self) -> Option<Value> {
        let Frame { attrs, content, .. } = self;
        match content.into_iter().next() {
            None => attrs.map(Value::Object),
            Some(Node::Text(s)) => Some(Value::String(s)),
            Some(Node::Element(child)) => {
                let mut map = Map::new();
                let key = child.name.clone();
                if let Some(v) = child.into_value() {
                    map.insert(key, v);
                }
                Some(Value::Object(map))
            }
            Some(Node::Item(m)) | Some(Node::Channel { channel: m, .. }) => Some(Value::Object(m)),
        }
    }
}

/// Flatten a frame's element children into a record keyed by child name.
fn collapse(content: Vec<Node>) -> Map<String, Value> {
    let mut map = Map::new();
    for node in content {
        if let Node::Element(child) = node {
            let key = child.name.clone();
            if let Some(value) = child.into_value() {
                map.insert(key, value);
            }
        }
    }
    map
}

// ============================================================================
// Parser state machine
// ============================================================================

type PreHook = fn(&mut RssParser, &mut Frame);
type PostHook = fn(&mut RssParser, Frame) -> Node;

#[derive(Default, Clone, Copy)]
struct Hooks {
    pre: Option<PreHook>,
    post: Option<PostHook>,
}

struct RssParser {
    current: Frame,
    stack: Vec<Frame>,
    /// The previous content entry at this depth was text (coalescing state).
    last_was_text: bool,
    /// Per-element handlers, resolved once by local name.
    hooks: HashMap<&'static str, Hooks>,
    version: Option<String>,
    channel: Option<Map<String, Value>>,
    items: Vec<Map<String, Value>>,
}

impl RssParser {
    fn new() -> Self {
        let mut hooks: HashMap<&'static str, Hooks> = HashMap::new();
        hooks.insert(
            "rss",
            Hooks {
                pre: Some(pre_rss),
                post: Some(post_rss),
            },
        );
        hooks.insert(
            "item",
            Hooks {
                pre: None,
                post: Some(post_item),
            },
        );
        hooks.insert(
            "channel",
            Hooks {
                pre: None,
                post: Some(post_channel),
            },
        );

        Self {
            current: Frame {
                name: String::new(),
                attrs: None,
                xmlns: Namespaces::root(),
                content: Vec::new(),
            },
            stack: Vec::new(),
            last_was_text: false,
            hooks,
            version: None,
            channel: None,
            items: Vec::new(),
        }
    }

    fn open(&mut self, start: &BytesStart<'_>) -> Result<(), ParseError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut xmlns = Namespaces::inherit(&self.current.xmlns);
        let mut attrs: Option<Map<String, Value>> = None;

        for attr in start.attributes() {
            let attr = attr.map_err(|e| ParseError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| ParseError::Malformed(e.to_string()))?
                .into_owned();
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                xmlns.declare(prefix, value);
            } else {
                attrs
                    .get_or_insert_with(Map::new)
                    .insert(key, Value::String(value));
            }
        }

        let mut frame = Frame {
            name,
            attrs,
            xmlns,
            content: Vec::new(),
        };

        let pre = self.lookup(frame.local_name()).pre;
        if let Some(pre) = pre {
            pre(self, &mut frame);
        }

        let parent = std::mem::replace(&mut self.current, frame);
        self.stack.push(parent);
        self.last_was_text = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ParseError> {
        let parent = self
            .stack
            .pop()
            .ok_or_else(|| ParseError::Malformed("unbalanced end tag".to_string()))?;
        let frame = std::mem::replace(&mut self.current, parent);

        let post = self.lookup(frame.local_name()).post;
        let node = match post {
            Some(post) => post(self, frame),
            None => Node::Element(frame),
        };
        self.current.content.push(node);
        self.last_was_text = false;
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if self.last_was_text {
            if let Some(Node::Text(prev)) = self.current.content.last_mut() {
                prev.push_str(text);
            }
        } else if !text.trim().is_empty() {
            self.current.content.push(Node::Text(text.to_string()));
            self.last_was_text = true;
        }
    }

    fn lookup(&self, local_name: &str) -> Hooks {
        self.hooks.get(local_name).copied().unwrap_or_default()
    }

    fn finish(self) -> Result<ParsedFeed, ParseError> {
        if !self.stack.is_empty() {
            return Err(ParseError::Malformed(
                "unexpected end of document".to_string(),
            ));
        }
        if self.channel.is_none() {
            tracing::warn!("document contained no rss channel");
        }
        Ok(ParsedFeed {
            version: self.version,
            channel: self.channel.unwrap_or_default(),
            items: self.items,
        })
    }
}

// ============================================================================
// Element hooks
// ============================================================================

/// Seed the version record before the channel is visited.
fn pre_rss(parser: &mut RssParser, frame: &mut Frame) {
    parser.version = frame
        .attrs
        .as_ref()
        .and_then(|a| a.get("version"))
        .and_then(Value::as_str)
        .map(String::from);
}

/// Attach the completed channel to the parse result.
fn post_rss(parser: &mut RssParser, mut frame: Frame) -> Node {
    let mut rest = Vec::new();
    for node in frame.content {
        match node {
            Node::Channel { channel, items } => {
                parser.channel = Some(channel);
                parser.items = items;
            }
            other => rest.push(other),
        }
    }
    frame.content = rest;
    Node::Element(frame)
}

/// Collapse an item into a flat record, normalize its `pubDate`, and derive
/// its guid.
fn post_item(_parser: &mut RssParser, frame: Frame) -> Node {
    let mut item = collapse(frame.content);
    normalize_pub_date(&mut item);
    derive_guid(&mut item);
    Node::Item(item)
}

/// Collapse the channel, gathering items in document order and resolving
/// their links against the channel's own `link` once it is known. Items that
/// appear before the `link` element cannot be resolved; the pass is linear.
fn post_channel(_parser: &mut RssParser, frame: Frame) -> Node {
    let mut channel = Map::new();
    let mut items = Vec::new();
    let mut base: Option<Url> = None;

    for node in frame.content {
        match node {
            Node::Item(mut item) => {
                if let (Some(base), Some(Value::String(link))) = (&base, item.get("link")) {
                    match base.join(link) {
                        Ok(abs) => {
                            item.insert("link".to_string(), Value::String(abs.to_string()));
                        }
                        Err(e) => {
                            tracing::debug!(link = %link, error = %e, "item link did not resolve")
                        }
                    }
                }
                items.push(item);
            }
            Node::Element(child) => {
                let name = child.name.clone();
                if let Some(value) = child.into_value() {
                    if name == "link" {
                        if let Value::String(l) = &value {
                            base = Url::parse(l).ok();
                        }
                    }
                    channel.insert(name, value);
                }
            }
            _ => {}
        }
    }

    Node::Channel { channel, items }
}

// ============================================================================
// Item field normalization
// ============================================================================

/// Canonicalize `pubDate` to an RFC 3339 UTC string and derive the numeric
/// `date` (epoch ms). Unparseable dates are logged and left as-is.
fn normalize_pub_date(item: &mut Map<String, Value>) {
    let Some(Value::String(raw)) = item.get("pubDate") else {
        return;
    };

    // Some generators emit "GMT+00:00"; strip the bogus offset before parsing.
    let cleaned = match raw.find("GMT+00:00").or_else(|| raw.find("GMT-00:00")) {
        Some(pos) => {
            let mut s = raw.clone();
            s.replace_range(pos + 3..pos + 9, "");
            s
        }
        None => raw.clone(),
    };

    match parse_date(&cleaned) {
        Some(date) => {
            item.insert(
                "pubDate".to_string(),
                Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            item.insert(
                "date".to_string(),
                Value::Number(date.timestamp_millis().into()),
            );
        }
        None => tracing::warn!(value = %raw, "unparseable pubDate, keeping original"),
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc2822(s)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Item identity: explicit guid, else link, else enclosure URL. Without any
/// of those the item cannot be stored; leave guid unset and let the caller
/// drop it.
fn derive_guid(item: &mut Map<String, Value>) {
    let present = match item.get("guid") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    };
    if present {
        return;
    }

    if let Some(Value::String(link)) = item.get("link") {
        item.insert("guid".to_string(), Value::String(link.clone()));
    } else if let Some(url) = item
        .get("enclosure")
        .and_then(|e| e.get("url"))
        .filter(|u| u.is_string())
    {
        let url = url.clone();
        item.insert("guid".to_string(), url);
    } else {
        tracing::warn!(
            title = item.get("title").and_then(serde_json::Value::as_str).unwrap_or(""),
            "item has no derivable guid"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_str(doc: &str) -> ParsedFeed {
        parse(doc.as_bytes()).expect("parse failed")
    }

    #[test]
    fn minimal_document() {
        let feed = parse_str(
            r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>http://x/</link>
    <item><title>T</title><link>http://x/a</link></item>
  </channel>
</rss>"#,
        );

        assert_eq!(feed.version.as_deref(), Some("2.0"));
        assert_eq!(feed.channel.get("title"), Some(&json!("Example")));
        assert_eq!(feed.channel.get("link"), Some(&json!("http://x/")));
        assert_eq!(feed.items.len(), 1);

        let item = &feed.items[0];
        assert_eq!(item.get("title"), Some(&json!("T")));
        assert_eq!(item.get("link"), Some(&json!("http://x/a")));
        // guid derived from the already-absolute link
        assert_eq!(item.get("guid"), Some(&json!("http://x/a")));
    }

    #[test]
    fn relative_links_resolve_against_channel_base() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel>
  <link>http://example.com/base/</link>
  <item><title>Rel</title><link>posts/1</link></item>
</channel></rss>"#,
        );

        assert_eq!(
            feed.items[0].get("link"),
            Some(&json!("http://example.com/base/posts/1"))
        );
    }

    #[test]
    fn items_before_channel_link_are_not_rewritten() {
        // Single linear pass: the base URL is unknown until <link> closes.
        let feed = parse_str(
            r#"<rss version="2.0"><channel>
  <item><title>Early</title><link>posts/1</link></item>
  <link>http://example.com/base/</link>
  <item><title>Late</title><link>posts/2</link></item>
</channel></rss>"#,
        );

        assert_eq!(feed.items[0].get("link"), Some(&json!("posts/1")));
        assert_eq!(
            feed.items[1].get("link"),
            Some(&json!("http://example.com/base/posts/2"))
        );
    }

    #[test]
    fn explicit_guid_wins_over_link() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><guid>tag:x,2026:1</guid><link>http://x/a</link></item>
</channel></rss>"#,
        );
        assert_eq!(feed.items[0].get("guid"), Some(&json!("tag:x,2026:1")));
    }

    #[test]
    fn guid_falls_back_to_enclosure_url() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><title>Cast</title><enclosure url="http://x/ep1.mp3" length="1" type="audio/mpeg"/></item>
</channel></rss>"#,
        );
        assert_eq!(feed.items[0].get("guid"), Some(&json!("http://x/ep1.mp3")));
    }

    #[test]
    fn item_without_identity_keeps_guid_unset() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><title>Orphan</title><description>no link</description></item>
</channel></rss>"#,
        );
        assert_eq!(feed.items[0].get("guid"), None);
        assert_eq!(feed.items[0].get("title"), Some(&json!("Orphan")));
    }

    #[test]
    fn pub_date_is_canonicalized() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><link>http://x/a</link><pubDate>Mon, 06 Sep 2010 00:01:00 +0000</pubDate></item>
</channel></rss>"#,
        );
        let item = &feed.items[0];
        assert_eq!(
            item.get("pubDate"),
            Some(&json!("2010-09-06T00:01:00.000Z"))
        );
        assert_eq!(item.get("date"), Some(&json!(1283731260000i64)));
    }

    #[test]
    fn bogus_gmt_offset_is_stripped_before_parsing() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><link>http://x/a</link><pubDate>Mon, 06 Sep 2010 00:01:00 GMT+00:00</pubDate></item>
</channel></rss>"#,
        );
        assert_eq!(
            feed.items[0].get("pubDate"),
            Some(&json!("2010-09-06T00:01:00.000Z"))
        );
    }

    #[test]
    fn unparseable_pub_date_is_left_alone() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><link>http://x/a</link><pubDate>sometime soon</pubDate></item>
</channel></rss>"#,
        );
        let item = &feed.items[0];
        assert_eq!(item.get("pubDate"), Some(&json!("sometime soon")));
        assert_eq!(item.get("date"), None);
    }

    #[test]
    fn channel_ttl_and_extra_fields_are_captured() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel>
  <title>X</title><link>http://x/</link><ttl>30</ttl>
  <managingEditor>ed@x</managingEditor>
</channel></rss>"#,
        );
        assert_eq!(feed.channel.get("ttl"), Some(&json!("30")));
        assert_eq!(feed.channel.get("managingEditor"), Some(&json!("ed@x")));
    }

    #[test]
    fn namespaced_item_fields_keep_their_prefix() {
        let feed = parse_str(
            r#"<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
  <link>http://x/</link>
  <item><link>http://x/a</link><dc:creator>someone</dc:creator></item>
</channel></rss>"#,
        );
        assert_eq!(feed.items[0].get("dc:creator"), Some(&json!("someone")));
    }

    #[test]
    fn xmlns_attributes_do_not_become_fields() {
        let feed = parse_str(
            r#"<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom"><channel>
  <link>http://x/</link>
</channel></rss>"#,
        );
        assert!(feed.channel.keys().all(|k| !k.starts_with("xmlns")));
    }

    #[test]
    fn cdata_text_is_captured() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><link>http://x/a</link><description><![CDATA[5 < 6 & so on]]></description></item>
</channel></rss>"#,
        );
        assert_eq!(
            feed.items[0].get("description"),
            Some(&json!("5 < 6 & so on"))
        );
    }

    #[test]
    fn attribute_only_elements_keep_their_attributes() {
        let feed = parse_str(
            r#"<rss version="2.0"><channel><link>http://x/</link>
  <item><link>http://x/a</link><enclosure url="http://x/f.mp3" length="9" type="audio/mpeg"/></item>
</channel></rss>"#,
        );
        assert_eq!(
            feed.items[0].get("enclosure"),
            Some(&json!({"url": "http://x/f.mp3", "length": "9", "type": "audio/mpeg"}))
        );
    }

    #[test]
    fn structurally_invalid_xml_fails() {
        assert!(parse(b"<rss version=\"2.0\"><channel></rss>").is_err());
        assert!(parse(b"<rss><unclosed>").is_err());
    }

    #[test]
    fn non_rss_document_yields_empty_feed() {
        let feed = parse_str("<unrelated><thing>1</thing></unrelated>");
        assert_eq!(feed.version, None);
        assert!(feed.channel.is_empty());
        assert!(feed.items.is_empty());
    }

    // ------------------------------------------------------------------
    // Namespace ownership
    // ------------------------------------------------------------------

    #[test]
    fn child_without_declarations_shares_parent_map() {
        let parent = Namespaces::root();
        let child = Namespaces::inherit(&parent);
        assert!(!child.owned);
        assert!(Rc::ptr_eq(&parent.map, &child.map));
    }

    #[test]
    fn local_declaration_clones_and_extends() {
        let mut parent = Namespaces::root();
        parent.declare("dc", "http://purl.org/dc/elements/1.1/".to_string());

        let mut child = Namespaces::inherit(&parent);
        child.declare("media", "http://search.yahoo.com/mrss/".to_string());

        assert!(child.owned);
        assert!(!Rc::ptr_eq(&parent.map, &child.map));
        // inherited binding survives the clone
        assert_eq!(child.get("dc"), Some("http://purl.org/dc/elements/1.1/"));
        assert_eq!(child.get("media"), Some("http://search.yahoo.com/mrss/"));
        // parent is untouched
        assert_eq!(parent.get("media"), None);
    }
}
