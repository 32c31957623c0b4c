use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0a9c4e-1b77-5d02-9e64-8c21d4b0af55").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: u32,
}

impl DocumentInfo {
    pub fn new(path: PathBuf, page_count: u32) -> Self {
        Self {
            id: document_id_for_path(&path),
            path,
            page_count,
        }
    }

    /// True if a link target as written in a referencing document addresses
    /// this document: either the exact path or the bare file name.
    pub fn is_addressed_by(&self, target: &str) -> bool {
        if Path::new(target) == self.path {
            return true;
        }
        self.path
            .file_name()
            .map(|name| name == Path::new(target).as_os_str())
            .unwrap_or(false)
    }
}

/// Rectangle in page coordinate space: origin at the bottom-left corner,
/// `top` > `bottom` for non-degenerate rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
}

impl Rect {
    pub fn new(left: f32, bottom: f32, right: f32, top: f32) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    pub fn is_valid(&self) -> bool {
        self.left.is_finite()
            && self.bottom.is_finite()
            && self.right.is_finite()
            && self.top.is_finite()
            && self.right > self.left
            && self.top > self.bottom
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

/// One text content item of a page's text layer. Items are ordered the way
/// the layout produced them; `line` associates items that sit on the same
/// visual line. `char_rects` holds one rectangle per character, indexed in
/// the same unit selection offsets are measured in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextItem {
    pub text: String,
    pub rect: Rect,
    pub line: u32,
    pub font_size: f32,
    #[serde(default)]
    pub char_rects: Vec<Rect>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextLayer {
    pub items: Vec<TextItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationKind {
    Selection,
    Annotation,
    Xyz,
    FitBh,
    FitR,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationIdError {
    #[error("expected {expected} comma-separated fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("invalid numeric field {0:?}")]
    InvalidNumber(String),
}

fn split_fields(id: &str, expected: usize) -> Result<Vec<&str>, DestinationIdError> {
    let fields: Vec<&str> = id.split(',').collect();
    if fields.len() != expected {
        return Err(DestinationIdError::FieldCount {
            expected,
            got: fields.len(),
        });
    }
    Ok(fields)
}

fn parse_usize(field: &str) -> Result<usize, DestinationIdError> {
    field
        .parse()
        .map_err(|_| DestinationIdError::InvalidNumber(field.to_owned()))
}

fn parse_f32(field: &str) -> Result<f32, DestinationIdError> {
    let value: f32 = field
        .parse()
        .map_err(|_| DestinationIdError::InvalidNumber(field.to_owned()))?;
    if !value.is_finite() {
        return Err(DestinationIdError::InvalidNumber(field.to_owned()));
    }
    Ok(value)
}

/// Half-open text selection range `[(begin_index, begin_offset),
/// (end_index, end_offset))` over a page's text items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionParams {
    pub begin_index: usize,
    pub begin_offset: usize,
    pub end_index: usize,
    pub end_offset: usize,
}

impl SelectionParams {
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.begin_index, self.begin_offset, self.end_index, self.end_offset
        )
    }

    pub fn decode(id: &str) -> Result<Self, DestinationIdError> {
        let fields = split_fields(id, 4)?;
        Ok(Self {
            begin_index: parse_usize(fields[0])?,
            begin_offset: parse_usize(fields[1])?,
            end_index: parse_usize(fields[2])?,
            end_offset: parse_usize(fields[3])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzParams {
    pub left: f32,
    pub top: f32,
}

impl XyzParams {
    pub fn encode(&self) -> String {
        format!("{},{}", self.left, self.top)
    }

    pub fn decode(id: &str) -> Result<Self, DestinationIdError> {
        let fields = split_fields(id, 2)?;
        Ok(Self {
            left: parse_f32(fields[0])?,
            top: parse_f32(fields[1])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitBhParams {
    pub top: f32,
}

impl FitBhParams {
    pub fn encode(&self) -> String {
        format!("{}", self.top)
    }

    pub fn decode(id: &str) -> Result<Self, DestinationIdError> {
        let fields = split_fields(id, 1)?;
        Ok(Self {
            top: parse_f32(fields[0])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRParams {
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
}

impl FitRParams {
    pub fn encode(&self) -> String {
        format!("{},{},{},{}", self.left, self.bottom, self.right, self.top)
    }

    pub fn decode(id: &str) -> Result<Self, DestinationIdError> {
        let fields = split_fields(id, 4)?;
        Ok(Self {
            left: parse_f32(fields[0])?,
            bottom: parse_f32(fields[1])?,
            right: parse_f32(fields[2])?,
            top: parse_f32(fields[3])?,
        })
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.left, self.bottom, self.right, self.top)
    }
}

/// A location within the target document. Each kind owns its id encoding;
/// ids are never compared across kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Selection(SelectionParams),
    Annotation(String),
    Xyz(XyzParams),
    FitBh(FitBhParams),
    FitR(FitRParams),
}

impl Destination {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Destination::Selection(_) => DestinationKind::Selection,
            Destination::Annotation(_) => DestinationKind::Annotation,
            Destination::Xyz(_) => DestinationKind::Xyz,
            Destination::FitBh(_) => DestinationKind::FitBh,
            Destination::FitR(_) => DestinationKind::FitR,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Destination::Selection(params) => params.encode(),
            Destination::Annotation(id) => id.clone(),
            Destination::Xyz(params) => params.encode(),
            Destination::FitBh(params) => params.encode(),
            Destination::FitR(params) => params.encode(),
        }
    }

    pub fn from_id(kind: DestinationKind, id: &str) -> Result<Self, DestinationIdError> {
        Ok(match kind {
            DestinationKind::Selection => Destination::Selection(SelectionParams::decode(id)?),
            DestinationKind::Annotation => Destination::Annotation(id.to_owned()),
            DestinationKind::Xyz => Destination::Xyz(XyzParams::decode(id)?),
            DestinationKind::FitBh => Destination::FitBh(FitBhParams::decode(id)?),
            DestinationKind::FitR => Destination::FitR(FitRParams::decode(id)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightColor {
    Name(String),
    Rgb { r: u8, g: u8, b: u8 },
}

impl HighlightColor {
    /// Parses the `color=` subpath parameter: a color name or `r,g,b`.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }
        let fields: Vec<&str> = value.split(',').collect();
        if fields.len() == 3 {
            let r = fields[0].trim().parse().ok()?;
            let g = fields[1].trim().parse().ok()?;
            let b = fields[2].trim().parse().ok()?;
            return Some(HighlightColor::Rgb { r, g, b });
        }
        Some(HighlightColor::Name(value.to_owned()))
    }

    pub fn css_value(&self) -> String {
        match self {
            HighlightColor::Name(name) => name.to_lowercase(),
            HighlightColor::Rgb { r, g, b } => format!("rgb({}, {}, {})", r, g, b),
        }
    }
}

/// One raw cross-document reference record, as delivered by the reference
/// collection collaborator. `subpath` addresses a location in `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReference {
    pub source_path: String,
    pub target: String,
    pub subpath: String,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSubpath {
    pub page: u32,
    pub destination: Destination,
    pub color: Option<HighlightColor>,
}

/// Parses a location subpath of the form
/// `#page=3&selection=2,0,2,5&color=red`. The leading `#` is optional;
/// `page` is mandatory and 1-based. Exactly one destination parameter is
/// expected (`selection`, `annotation`, `offset` or `rect`); `offset` with an
/// empty first field denotes a horizontal-fit destination. Returns `None`
/// for anything that does not encode a resolvable destination.
pub fn parse_subpath(subpath: &str) -> Option<ParsedSubpath> {
    let trimmed = subpath.strip_prefix('#').unwrap_or(subpath);

    let mut page = None;
    let mut destination = None;
    let mut color = None;

    for pair in trimmed.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "page" => page = value.parse::<u32>().ok(),
            "selection" => {
                destination = SelectionParams::decode(value).ok().map(Destination::Selection);
            }
            "annotation" => {
                if !value.is_empty() {
                    destination = Some(Destination::Annotation(value.to_owned()));
                }
            }
            "offset" => {
                destination = match value.split_once(',') {
                    Some(("", top)) => parse_f32(top)
                        .ok()
                        .map(|top| Destination::FitBh(FitBhParams { top })),
                    Some(_) => XyzParams::decode(value).ok().map(Destination::Xyz),
                    None => None,
                };
            }
            "rect" => {
                destination = FitRParams::decode(value).ok().map(Destination::FitR);
            }
            "color" => color = HighlightColor::parse(value),
            _ => {}
        }
    }

    let page = page.filter(|page| *page >= 1)?;
    let destination = destination?;
    Some(ParsedSubpath {
        page,
        destination,
        color,
    })
}

/// Opaque handle to a visual element issued by a [`RenderSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct NativeAnnotation {
    pub rect: Rect,
    pub color: Option<[u8; 3]>,
    pub element: ElementId,
}

/// Read access to the rendering backend of one open document. Supplied by an
/// external collaborator; this crate never parses the document format.
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_size(&self, page: u32) -> Option<PageSize>;
    fn text_layer(&self, page: u32) -> Option<TextLayer>;
    fn annotation(&self, page: u32, id: &str) -> Option<NativeAnnotation>;
}

/// Placement and styling primitives of the rendering surface overlays are
/// drawn on. Rectangles are given in page coordinate space.
pub trait RenderSurface: Send + Sync {
    fn place_rect(&self, page: u32, rect: Rect) -> ElementId;
    fn set_icon(&self, element: ElementId, icon: &str);
    fn add_class(&self, element: ElementId, class: &str);
    fn remove_class(&self, element: ElementId, class: &str);
    fn set_attribute(&self, element: ElementId, key: &str, value: &str);
    fn remove_attribute(&self, element: ElementId, key: &str);
    fn set_css_property(&self, element: ElementId, key: &str, value: &str);
    fn remove_css_property(&self, element: ElementId, key: &str);
    fn remove(&self, element: ElementId);
    /// True if `element` is rendered inside `ancestor`. Used to tell real
    /// pointer exits apart from moves into an element's own children.
    fn is_within(&self, element: ElementId, ancestor: ElementId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    PageReady(u32),
    TextLayerReady(u32),
    AnnotationLayerReady(u32),
}

impl PageEvent {
    pub fn page(&self) -> u32 {
        match self {
            PageEvent::PageReady(page)
            | PageEvent::TextLayerReady(page)
            | PageEvent::AnnotationLayerReady(page) => *page,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Signal hub with explicit subscription handles. Subscribers registered
/// here must be released with [`EventHub::unsubscribe`] by their owner; the
/// hub never drops them on its own.
pub struct EventHub<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<E>)>>,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber: Subscriber<E> = Arc::new(subscriber);
        self.subscribers.lock().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn emit(&self, event: &E) {
        // Snapshot under the lock so a subscriber may subscribe/unsubscribe
        // re-entrantly without deadlocking.
        let snapshot: Vec<Subscriber<E>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in snapshot {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tempfile::tempdir;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("paper.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        assert_eq!(
            document_id_for_path(&file_path),
            document_id_for_path(&file_path)
        );
    }

    #[test]
    fn document_addressing_matches_path_or_file_name() {
        let info = DocumentInfo::new(PathBuf::from("notes/papers/attention.pdf"), 12);
        assert!(info.is_addressed_by("notes/papers/attention.pdf"));
        assert!(info.is_addressed_by("attention.pdf"));
        assert!(!info.is_addressed_by("other.pdf"));
        assert!(!info.is_addressed_by("papers/attention.pdf"));
    }

    #[test]
    fn rect_union_covers_both() {
        let a = Rect::new(0.0, 0.0, 10.0, 5.0);
        let b = Rect::new(8.0, -2.0, 12.0, 4.0);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(0.0, -2.0, 12.0, 5.0));
        assert!(u.is_valid());
    }

    #[test]
    fn destination_ids_round_trip() {
        let destinations = [
            Destination::Selection(SelectionParams {
                begin_index: 2,
                begin_offset: 0,
                end_index: 5,
                end_offset: 17,
            }),
            Destination::Annotation("207R".to_owned()),
            Destination::Xyz(XyzParams {
                left: 72.5,
                top: 340.25,
            }),
            Destination::FitBh(FitBhParams { top: 700.125 }),
            Destination::FitR(FitRParams {
                left: 10.0,
                bottom: 20.5,
                right: 110.0,
                top: 44.75,
            }),
        ];

        for destination in destinations {
            let decoded = Destination::from_id(destination.kind(), &destination.id()).unwrap();
            assert_eq!(decoded, destination);
        }
    }

    #[test]
    fn destination_decode_rejects_malformed_ids() {
        assert!(matches!(
            SelectionParams::decode("1,2,3"),
            Err(DestinationIdError::FieldCount {
                expected: 4,
                got: 3
            })
        ));
        assert!(matches!(
            XyzParams::decode("1,abc"),
            Err(DestinationIdError::InvalidNumber(_))
        ));
        assert!(XyzParams::decode("1,inf").is_err());
    }

    #[test]
    fn subpath_parses_selection_with_color() {
        let parsed = parse_subpath("#page=3&selection=2,0,2,5&color=red").unwrap();
        assert_eq!(parsed.page, 3);
        assert_eq!(
            parsed.destination,
            Destination::Selection(SelectionParams {
                begin_index: 2,
                begin_offset: 0,
                end_index: 2,
                end_offset: 5,
            })
        );
        assert_eq!(parsed.color, Some(HighlightColor::Name("red".to_owned())));
    }

    #[test]
    fn subpath_offset_forms_select_kind() {
        let xyz = parse_subpath("page=1&offset=72,640").unwrap();
        assert!(matches!(xyz.destination, Destination::Xyz(_)));

        let fit_bh = parse_subpath("page=1&offset=,640").unwrap();
        assert_eq!(
            fit_bh.destination,
            Destination::FitBh(FitBhParams { top: 640.0 })
        );

        let rect = parse_subpath("page=2&rect=10,20,30,40&color=12,200,7").unwrap();
        assert!(matches!(rect.destination, Destination::FitR(_)));
        assert_eq!(
            rect.color,
            Some(HighlightColor::Rgb { r: 12, g: 200, b: 7 })
        );
    }

    #[test]
    fn subpath_without_page_or_destination_is_rejected() {
        assert!(parse_subpath("selection=1,2,3,4").is_none());
        assert!(parse_subpath("page=3").is_none());
        assert!(parse_subpath("page=0&annotation=1R").is_none());
        assert!(parse_subpath("page=3&annotation=").is_none());
        assert!(parse_subpath("").is_none());
    }

    #[test]
    fn event_hub_delivers_and_releases() {
        let hub: EventHub<u32> = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_a = Arc::clone(&seen);
        let a = hub.subscribe(move |value| {
            seen_a.fetch_add(*value as usize, Ordering::SeqCst);
        });
        let seen_b = Arc::clone(&seen);
        let b = hub.subscribe(move |value| {
            seen_b.fetch_add(*value as usize, Ordering::SeqCst);
        });
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 6);

        assert!(hub.unsubscribe(a));
        assert!(!hub.unsubscribe(a));
        hub.emit(&1);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        assert!(hub.unsubscribe(b));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
