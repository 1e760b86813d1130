use chrono::Utc;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::{derive_guid, FeedItem};
use crate::util::strip_control_chars;

/// Errors produced when a payload yields no usable items.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The token stream broke before any grammar produced an item.
    #[error("XML parsing error: {0}")]
    Xml(String),
    /// The document was well formed but nothing in it had a title and a link.
    #[error("No valid RSS or Atom items found")]
    NoValidItems,
}

/// Which grammar produced the items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    /// Last-resort parse through `feed-rs` (RSS 0.9x/1.0 variants, JSON Feed, sloppy markup).
    Permissive,
}

/// Valid items extracted from one payload, in document order.
///
/// Items are not deduplicated here; that is the job of the item store.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    pub items: Vec<FeedItem>,
}

/// Parse a feed body into items.
///
/// The root element picks the grammar: `<feed>` is Atom, anything else is
/// read with the RSS item grammar. An RSS pass that finds no valid item is
/// retried as Atom, and if that also comes up empty (or the stream errored)
/// the payload goes through `feed-rs` before giving up.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let mut stream_error = None;

    let primary = match detect_format(bytes) {
        Some(FeedFormat::Atom) => FeedFormat::Atom,
        _ => FeedFormat::Rss,
    };

    let first_pass = match primary {
        FeedFormat::Atom => walk::<Atom>(bytes),
        _ => walk::<Rss>(bytes),
    };

    match first_pass {
        Ok(items) if !items.is_empty() => {
            return Ok(ParsedFeed {
                format: primary,
                items,
            })
        }
        Ok(_) if primary == FeedFormat::Rss => {
            tracing::debug!("No RSS items found, retrying as Atom");
            match walk::<Atom>(bytes) {
                Ok(items) if !items.is_empty() => {
                    return Ok(ParsedFeed {
                        format: FeedFormat::Atom,
                        items,
                    })
                }
                Ok(_) => {}
                Err(e) => stream_error = Some(e),
            }
        }
        Ok(_) => {}
        Err(e) => stream_error = Some(e),
    }

    let items = parse_permissive(bytes);
    if !items.is_empty() {
        tracing::debug!(items = items.len(), "Feed parsed with fallback parser");
        return Ok(ParsedFeed {
            format: FeedFormat::Permissive,
            items,
        });
    }

    Err(stream_error.unwrap_or(ParseError::NoValidItems))
}

/// Peek at the first element of the document.
///
/// Returns `None` when the stream has no element at all or breaks before one.
pub fn detect_format(bytes: &[u8]) -> Option<FeedFormat> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(match e.name().local_name().as_ref() {
                    b"feed" => FeedFormat::Atom,
                    _ => FeedFormat::Rss,
                });
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

// ============================================================================
// Grammars
// ============================================================================

/// Elements the RSS item grammar reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RssElement {
    Item,
    Title,
    Link,
    Description,
    PubDate,
    Category,
    Guid,
    Enclosure,
    MediaContent,
    MediaThumbnail,
    Other,
}

/// Elements the Atom entry grammar reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtomElement {
    Entry,
    Title,
    Link,
    Id,
    Summary,
    Content,
    Published,
    Updated,
    Category,
    MediaContent,
    MediaThumbnail,
    /// `<source>` metadata of the feed an entry was copied from.
    Source,
    Other,
}

/// One item grammar driven by [`walk`].
///
/// `open` sees every element inside an item (start and self-closing tags) and
/// returns whether the element's text should be captured; captured text is
/// handed to `close` when the element ends.
trait Grammar {
    type Element: Copy;

    fn classify(name: QName<'_>) -> Self::Element;
    fn is_item(element: Self::Element) -> bool;
    /// Elements whose whole subtree belongs to something other than the item.
    fn skips_subtree(_element: Self::Element) -> bool {
        false
    }
    fn open(
        draft: &mut ItemDraft,
        element: Self::Element,
        start: &BytesStart<'_>,
        reader: &Reader<&[u8]>,
    ) -> bool;
    fn close(draft: &mut ItemDraft, element: Self::Element, text: String);
}

struct Rss;
struct Atom;

impl Grammar for Rss {
    type Element = RssElement;

    fn classify(name: QName<'_>) -> RssElement {
        match name.as_ref() {
            b"item" => RssElement::Item,
            b"title" => RssElement::Title,
            b"link" => RssElement::Link,
            b"description" => RssElement::Description,
            b"pubDate" => RssElement::PubDate,
            b"category" => RssElement::Category,
            b"guid" => RssElement::Guid,
            b"enclosure" => RssElement::Enclosure,
            b"media:content" => RssElement::MediaContent,
            b"media:thumbnail" => RssElement::MediaThumbnail,
            _ => RssElement::Other,
        }
    }

    fn is_item(element: RssElement) -> bool {
        element == RssElement::Item
    }

    fn open(
        draft: &mut ItemDraft,
        element: RssElement,
        start: &BytesStart<'_>,
        reader: &Reader<&[u8]>,
    ) -> bool {
        match element {
            RssElement::Title
            | RssElement::Link
            | RssElement::Description
            | RssElement::PubDate
            | RssElement::Category
            | RssElement::Guid => true,
            RssElement::Enclosure => {
                draft.offer_enclosure(
                    attribute(start, reader, b"url"),
                    attribute(start, reader, b"type"),
                );
                false
            }
            RssElement::MediaContent | RssElement::MediaThumbnail => {
                draft.offer_media(attribute(start, reader, b"url"));
                false
            }
            RssElement::Item | RssElement::Other => false,
        }
    }

    fn close(draft: &mut ItemDraft, element: RssElement, text: String) {
        match element {
            RssElement::Title => draft.title = text,
            RssElement::Link => draft.link = text,
            RssElement::Description => draft.description = text,
            RssElement::PubDate => draft.pub_date = text,
            RssElement::Category => draft.offer_category(text),
            RssElement::Guid => draft.guid = text,
            RssElement::Item
            | RssElement::Enclosure
            | RssElement::MediaContent
            | RssElement::MediaThumbnail
            | RssElement::Other => {}
        }
    }
}

impl Grammar for Atom {
    type Element = AtomElement;

    fn classify(name: QName<'_>) -> AtomElement {
        match name.as_ref() {
            b"media:content" => return AtomElement::MediaContent,
            b"media:thumbnail" => return AtomElement::MediaThumbnail,
            _ => {}
        }
        match name.local_name().as_ref() {
            b"entry" => AtomElement::Entry,
            b"title" => AtomElement::Title,
            b"link" => AtomElement::Link,
            b"id" => AtomElement::Id,
            b"summary" => AtomElement::Summary,
            b"content" => AtomElement::Content,
            b"published" => AtomElement::Published,
            b"updated" => AtomElement::Updated,
            b"category" => AtomElement::Category,
            b"source" => AtomElement::Source,
            _ => AtomElement::Other,
        }
    }

    fn is_item(element: AtomElement) -> bool {
        element == AtomElement::Entry
    }

    fn skips_subtree(element: AtomElement) -> bool {
        element == AtomElement::Source
    }

    fn open(
        draft: &mut ItemDraft,
        element: AtomElement,
        start: &BytesStart<'_>,
        reader: &Reader<&[u8]>,
    ) -> bool {
        match element {
            AtomElement::Title | AtomElement::Id | AtomElement::Summary | AtomElement::Content => {
                true
            }
            AtomElement::Published | AtomElement::Updated => draft.pub_date.is_empty(),
            AtomElement::Link => {
                let Some(href) = attribute(start, reader, b"href") else {
                    // <link>http://...</link>
                    return draft.link.is_empty();
                };
                match attribute(start, reader, b"rel").as_deref() {
                    None | Some("alternate") => {
                        if draft.link.is_empty() {
                            draft.link = href;
                        }
                    }
                    Some("enclosure") => {
                        draft.offer_enclosure(Some(href), attribute(start, reader, b"type"));
                    }
                    Some(_) => {
                        draft.fallback_link.get_or_insert(href);
                    }
                }
                false
            }
            AtomElement::Category => match attribute(start, reader, b"term") {
                Some(term) if !term.trim().is_empty() => {
                    draft.offer_category(term);
                    false
                }
                _ => draft.category.is_none(),
            },
            AtomElement::MediaContent | AtomElement::MediaThumbnail => {
                draft.offer_media(attribute(start, reader, b"url"));
                false
            }
            AtomElement::Entry | AtomElement::Source | AtomElement::Other => false,
        }
    }

    fn close(draft: &mut ItemDraft, element: AtomElement, text: String) {
        match element {
            AtomElement::Title => draft.title = text,
            AtomElement::Link => {
                if draft.link.is_empty() {
                    draft.link = text;
                }
            }
            AtomElement::Id => draft.guid = text,
            AtomElement::Summary | AtomElement::Content => draft.description = text,
            AtomElement::Published | AtomElement::Updated => {
                if draft.pub_date.is_empty() {
                    draft.pub_date = text.trim().to_string();
                }
            }
            AtomElement::Category => draft.offer_category(text),
            AtomElement::Entry
            | AtomElement::MediaContent
            | AtomElement::MediaThumbnail
            | AtomElement::Source
            | AtomElement::Other => {}
        }
    }
}

// ============================================================================
// Token stream walker
// ============================================================================

struct Capture<E> {
    element: E,
    depth: usize,
    text: String,
}

/// Drive a grammar over the token stream and collect every valid item.
///
/// Text is kept untrimmed while it is collected so that runs split by inline
/// markup keep their spacing; fields are trimmed when the item is finished.
fn walk<G: Grammar>(bytes: &[u8]) -> Result<Vec<FeedItem>, ParseError> {
    // SEC-002: quick-xml 0.37 never expands DTD entity declarations; only the
    // five predefined entities are resolved by `unescape()`.
    let mut reader = Reader::from_reader(bytes);

    let mut items = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut draft: Option<(ItemDraft, usize)> = None;
    let mut capture: Option<Capture<G::Element>> = None;
    // Depth of a subtree that is not part of the current item.
    let mut skipping: Option<usize> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) if skipping.is_some() => depth += 1,
            Ok(Event::Empty(_)) if skipping.is_some() => {}
            Ok(Event::Start(e)) => {
                depth += 1;
                let element = G::classify(e.name());
                match draft.as_mut() {
                    None if G::is_item(element) => draft = Some((ItemDraft::default(), depth)),
                    Some(_) if capture.is_none() && G::skips_subtree(element) => {
                        skipping = Some(depth);
                    }
                    Some((item, _)) if capture.is_none() => {
                        if G::open(item, element, &e, &reader) {
                            capture = Some(Capture {
                                element,
                                depth,
                                text: String::new(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if let (Some((item, _)), None) = (draft.as_mut(), capture.as_ref()) {
                    G::open(item, G::classify(e.name()), &e, &reader);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(capture) = capture.as_mut() {
                    capture.text.push_str(&unescape_text(&t));
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(capture) = capture.as_mut() {
                    capture
                        .text
                        .push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok(Event::End(_)) if skipping.is_some() => {
                if skipping == Some(depth) {
                    skipping = None;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::End(_)) => {
                if let Some(done) = capture.take() {
                    if done.depth == depth {
                        if let Some((item, _)) = draft.as_mut() {
                            G::close(item, done.element, done.text);
                        }
                    } else {
                        capture = Some(done);
                    }
                }
                if draft.as_ref().is_some_and(|(_, item_depth)| *item_depth == depth) {
                    if let Some((item, _)) = draft.take() {
                        if let Some(item) = item.finish() {
                            items.push(item);
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ParseError::Xml(format!(
                    "{} (at byte {})",
                    e,
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

/// Read one attribute value; malformed attributes count as absent.
fn attribute(start: &BytesStart<'_>, reader: &Reader<&[u8]>, key: &[u8]) -> Option<String> {
    for attr_result in start.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed feed attribute");
                continue;
            }
        };
        if attr.key.as_ref() == key {
            return attr
                .decode_and_unescape_value(reader.decoder())
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
    }
    None
}

/// Unescape element text, keeping it raw when it carries entities XML does not
/// define (`&nbsp;` and friends are common in feed HTML).
fn unescape_text(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

// ============================================================================
// Item assembly
// ============================================================================

/// Fields collected for one item/entry before validation.
#[derive(Debug, Default)]
struct ItemDraft {
    title: String,
    link: String,
    description: String,
    pub_date: String,
    category: Option<String>,
    guid: String,
    enclosure_image: Option<String>,
    media_image: Option<String>,
    /// Atom link with a rel other than `alternate`, used only when no alternate exists.
    fallback_link: Option<String>,
}

impl ItemDraft {
    fn offer_enclosure(&mut self, url: Option<String>, mime: Option<String>) {
        if self.enclosure_image.is_some() {
            return;
        }
        if let (Some(url), Some(mime)) = (url, mime) {
            if mime.starts_with("image/") {
                self.enclosure_image = Some(url);
            }
        }
    }

    fn offer_media(&mut self, url: Option<String>) {
        if self.media_image.is_none() {
            self.media_image = url;
        }
    }

    fn offer_category(&mut self, category: String) {
        let category = category.trim();
        if self.category.is_none() && !category.is_empty() {
            self.category = Some(category.to_string());
        }
    }

    /// Validate and build the item; `None` when title or link is missing.
    ///
    /// Image priority: image enclosure, then media:content/thumbnail, then the
    /// first inline `<img>` in the description.
    fn finish(self) -> Option<FeedItem> {
        let title = strip_control_chars(self.title.trim()).into_owned();
        let link = if self.link.trim().is_empty() {
            self.fallback_link.unwrap_or_default()
        } else {
            self.link
        };
        let link = link.trim().to_string();

        if title.is_empty() || link.is_empty() {
            return None;
        }

        let image_url = self
            .enclosure_image
            .or(self.media_image)
            .or_else(|| extract_inline_image(&self.description));

        let guid = match self.guid.trim() {
            "" => derive_guid(&link, &title),
            explicit => explicit.to_string(),
        };

        Some(FeedItem {
            title,
            link,
            description: self.description.trim().to_string(),
            pub_date: self.pub_date.trim().to_string(),
            image_url,
            category: self
                .category
                .map(|c| strip_control_chars(&c).into_owned()),
            guid,
            is_read: false,
            fetch_time: Utc::now(),
        })
    }
}

/// First `src` of an `<img>` tag in an HTML fragment.
pub fn extract_inline_image(html: &str) -> Option<String> {
    let lowered = html.to_ascii_lowercase();
    let mut from = 0;

    while let Some(offset) = lowered[from..].find("<img") {
        let tag_start = from + offset;
        let tag_end = lowered[tag_start..]
            .find('>')
            .map_or(lowered.len(), |end| tag_start + end);
        let tag = &lowered[tag_start..tag_end];

        for quote in ['"', '\''] {
            let needle = format!("src={quote}");
            if let Some(src) = tag.find(&needle) {
                let value_start = tag_start + src + needle.len();
                if let Some(len) = html[value_start..tag_end].find(quote) {
                    if len > 0 {
                        return Some(html[value_start..value_start + len].to_string());
                    }
                }
            }
        }
        from = tag_end;
    }

    None
}

/// Last resort: let `feed-rs` make sense of the payload.
fn parse_permissive(bytes: &[u8]) -> Vec<FeedItem> {
    let feed = match feed_rs::parser::parse(bytes) {
        Ok(feed) => feed,
        Err(e) => {
            tracing::debug!(error = %e, "Fallback parser rejected payload");
            return Vec::new();
        }
    };

    feed.entries
        .into_iter()
        .filter_map(|entry| {
            let media_image = entry.media.iter().find_map(|media| {
                media
                    .thumbnails
                    .first()
                    .map(|thumb| thumb.image.uri.clone())
                    .or_else(|| {
                        media
                            .content
                            .iter()
                            .find_map(|content| content.url.as_ref().map(|u| u.to_string()))
                    })
            });

            ItemDraft {
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                link: entry
                    .links
                    .first()
                    .map(|l| l.href.clone())
                    .unwrap_or_default(),
                description: entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .unwrap_or_default(),
                pub_date: entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.to_rfc2822())
                    .unwrap_or_default(),
                category: entry.categories.first().map(|c| c.term.clone()),
                guid: entry.id,
                enclosure_image: None,
                media_image,
                fallback_link: None,
            }
            .finish()
        })
        .collect()
}
