use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use marginalia_core::{
    DocumentBackend, DocumentInfo, ElementId, EventHub, FitBhParams, FitRParams, HighlightColor,
    PageEvent, Rect, RenderSurface, SelectionParams, SubscriptionId, TextItem, XyzParams,
};
use marginalia_index::{BacklinkCache, BacklinkIndex, CacheGroup};

pub const CLASS_BACKLINK: &str = "marginalia-backlink";
pub const CLASS_BACKLINK_SELECTION: &str = "marginalia-backlink-selection";
pub const CLASS_BACKLINK_ANNOTATION: &str = "marginalia-backlink-annotation";
pub const CLASS_BACKLINK_FIT_R: &str = "marginalia-backlink-fit-r";
pub const CLASS_BACKLINK_ICON: &str = "marginalia-backlink-icon";
pub const CLASS_ANNOTATION_BOUNDING_RECT: &str = "marginalia-annotation-bounding-rect";
pub const CLASS_BACKLINK_LAYER: &str = "marginalia-backlink-layer";
pub const CLASS_IS_HOVERED: &str = "is-hovered";

pub const ATTR_DESTINATION_COLOR: &str = "data-destination-color";
pub const ATTR_TEXT_INDICES: &str = "data-text-indices";

const CSS_COLOR: &str = "--marginalia-color";
const CSS_ICON_COLOR: &str = "--marginalia-backlink-icon-color";
const CSS_RECT_COLOR: &str = "--marginalia-rect-color";
const BACKLINK_ICON: &str = "links-coming-in";

/// One merged highlight region: the union bounding box of a maximal run of
/// covered text items sitting on the same visual line, plus the indices of
/// the items that contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRect {
    pub rect: Rect,
    pub indices: Vec<usize>,
}

/// Merges the per-character boxes covered by a half-open selection range
/// into one rectangle per visual line. An empty text layer yields an empty
/// list; items without character geometry contribute their whole rectangle.
pub fn merge_selection_rects(items: &[TextItem], selection: SelectionParams) -> Vec<MergedRect> {
    if items.is_empty() || selection.begin_index >= items.len() {
        return Vec::new();
    }
    let end_index = selection.end_index.min(items.len() - 1);
    if end_index < selection.begin_index {
        return Vec::new();
    }

    let mut merged: Vec<MergedRect> = Vec::new();
    let mut current: Option<(u32, Rect, Vec<usize>)> = None;

    for index in selection.begin_index..=end_index {
        let item = &items[index];
        let from = if index == selection.begin_index {
            selection.begin_offset
        } else {
            0
        };
        let to = if index == selection.end_index {
            Some(selection.end_offset)
        } else {
            None
        };
        let Some(rect) = covered_rect(item, from, to) else {
            continue;
        };

        match &mut current {
            Some((line, run, indices)) if *line == item.line => {
                *run = run.union(&rect);
                indices.push(index);
            }
            slot => {
                if let Some((_, run_rect, run_indices)) = slot.take() {
                    merged.push(MergedRect {
                        rect: run_rect,
                        indices: run_indices,
                    });
                }
                *slot = Some((item.line, rect, vec![index]));
            }
        }
    }
    if let Some((_, rect, indices)) = current {
        merged.push(MergedRect { rect, indices });
    }

    merged
}

fn covered_rect(item: &TextItem, from: usize, to: Option<usize>) -> Option<Rect> {
    if item.char_rects.is_empty() {
        return item.rect.is_valid().then_some(item.rect);
    }
    let to = to.unwrap_or(item.char_rects.len()).min(item.char_rects.len());
    let from = from.min(item.char_rects.len());
    if from >= to {
        return None;
    }
    let mut rect = item.char_rects[from];
    for char_rect in &item.char_rects[from + 1..to] {
        rect = rect.union(char_rect);
    }
    Some(rect)
}

/// Bidirectional multi-valued association. Both directions are kept in
/// lock-step; mutation only goes through [`add`](BidiMultiMap::add) and the
/// remove methods, never through the underlying maps.
#[derive(Debug)]
pub struct BidiMultiMap<K, V> {
    forward: HashMap<K, HashSet<V>>,
    backward: HashMap<V, HashSet<K>>,
}

impl<K, V> BidiMultiMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }

    pub fn add(&mut self, key: K, value: V) {
        self.forward
            .entry(key.clone())
            .or_default()
            .insert(value.clone());
        self.backward.entry(value).or_default().insert(key);
    }

    pub fn get(&self, key: &K) -> impl Iterator<Item = &V> {
        self.forward.get(key).into_iter().flatten()
    }

    pub fn keys_of(&self, value: &V) -> impl Iterator<Item = &K> {
        self.backward.get(value).into_iter().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.forward.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.backward.keys()
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.backward.contains_key(value)
    }

    pub fn remove_value(&mut self, value: &V) {
        let Some(keys) = self.backward.remove(value) else {
            return;
        };
        for key in keys {
            if let Some(values) = self.forward.get_mut(&key) {
                values.remove(value);
                if values.is_empty() {
                    self.forward.remove(&key);
                }
            }
        }
    }

    pub fn remove_key(&mut self, key: &K) {
        let Some(values) = self.forward.remove(key) else {
            return;
        };
        for value in values {
            if let Some(keys) = self.backward.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.backward.remove(&value);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backward.is_empty()
    }

    pub fn value_count(&self) -> usize {
        self.backward.len()
    }
}

impl<K, V> Default for BidiMultiMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Arrival state of a page's three independently delivered rendering layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStatus {
    pub page_ready: bool,
    pub text_layer_ready: bool,
    pub annotation_layer_ready: bool,
}

impl PageStatus {
    pub fn is_processed(&self) -> bool {
        self.page_ready && self.text_layer_ready && self.annotation_layer_ready
    }

    fn apply(&mut self, update: PageStatusUpdate) {
        if let Some(page_ready) = update.page_ready {
            self.page_ready = page_ready;
        }
        if let Some(text_layer_ready) = update.text_layer_ready {
            self.text_layer_ready = text_layer_ready;
        }
        if let Some(annotation_layer_ready) = update.annotation_layer_ready {
            self.annotation_layer_ready = annotation_layer_ready;
        }
    }
}

/// Merge-update for [`PageStatus`]; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageStatusUpdate {
    pub page_ready: Option<bool>,
    pub text_layer_ready: Option<bool>,
    pub annotation_layer_ready: Option<bool>,
}

#[derive(Default)]
struct PageOverlays {
    map: BidiMultiMap<Arc<BacklinkCache>, ElementId>,
    owned: HashSet<ElementId>,
    interactive: HashSet<ElementId>,
}

/// Per-page bookkeeping of everything the visualizer placed on the surface:
/// the readiness state machine and the cache↔element association. Owned
/// exclusively by one visualized surface; never shared.
pub struct OverlayManager {
    surface: Arc<dyn RenderSurface>,
    pagewise: HashMap<u32, PageOverlays>,
    status: HashMap<u32, PageStatus>,
}

impl OverlayManager {
    pub fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self {
            surface,
            pagewise: HashMap::new(),
            status: HashMap::new(),
        }
    }

    pub fn get_status(&mut self, page: u32) -> PageStatus {
        *self.status.entry(page).or_default()
    }

    pub fn update_status(&mut self, page: u32, update: PageStatusUpdate) {
        self.status.entry(page).or_default().apply(update);
    }

    pub fn is_page_processed(&mut self, page: u32) -> bool {
        self.get_status(page).is_processed()
    }

    pub fn tracked_pages(&self) -> Vec<u32> {
        self.status.keys().copied().collect()
    }

    /// Registers an element created by the engine itself. Owned elements are
    /// removed from the surface when the page is cleared.
    pub fn register_owned(&mut self, page: u32, cache: &Arc<BacklinkCache>, element: ElementId) {
        self.surface.add_class(element, CLASS_BACKLINK_LAYER);
        self.register(page, cache, element, true);
    }

    /// Registers an element belonging to a layer the engine does not own
    /// (native annotation rendering). Such elements are unstyled on clear,
    /// never removed.
    pub fn register_native(&mut self, page: u32, cache: &Arc<BacklinkCache>, element: ElementId) {
        self.register(page, cache, element, false);
    }

    fn register(&mut self, page: u32, cache: &Arc<BacklinkCache>, element: ElementId, owned: bool) {
        let overlays = self.pagewise.entry(page).or_default();
        overlays.map.add(Arc::clone(cache), element);
        if owned {
            overlays.owned.insert(element);
        }
    }

    pub fn elements_of(&self, page: u32, cache: &Arc<BacklinkCache>) -> Vec<ElementId> {
        self.pagewise
            .get(&page)
            .map(|overlays| overlays.map.get(cache).copied().collect())
            .unwrap_or_default()
    }

    pub fn caches_of(&self, page: u32, element: ElementId) -> Vec<Arc<BacklinkCache>> {
        self.pagewise
            .get(&page)
            .map(|overlays| overlays.map.keys_of(&element).cloned().collect())
            .unwrap_or_default()
    }

    pub fn page_of(&self, element: ElementId) -> Option<u32> {
        self.pagewise
            .iter()
            .find(|(_, overlays)| overlays.map.contains_value(&element))
            .map(|(page, _)| *page)
    }

    pub fn is_interactive(&self, page: u32, element: ElementId) -> bool {
        self.pagewise
            .get(&page)
            .map(|overlays| overlays.interactive.contains(&element))
            .unwrap_or(false)
    }

    /// Removes every owned element of the page from the surface, unstyles
    /// the native ones, discards the association and resets the readiness
    /// flags to all-false.
    pub fn clear_page(&mut self, page: u32) {
        if let Some(overlays) = self.pagewise.remove(&page) {
            for element in overlays.map.values() {
                if overlays.owned.contains(element) {
                    self.surface.remove(*element);
                } else {
                    unstyle(self.surface.as_ref(), *element);
                }
            }
        }
        self.status.insert(page, PageStatus::default());
    }

    pub fn clear_all(&mut self) {
        for page in self.pagewise.keys().copied().collect::<Vec<_>>() {
            self.clear_page(page);
        }
    }

    pub fn post_process_page_if_ready(&mut self, page: u32) {
        if self.is_page_processed(page) {
            self.post_process_page(page);
        }
    }

    /// Propagates each cache's color onto its elements and marks them
    /// interactive. Runs only once all three layers arrived, so annotation
    /// colors assigned during annotation-layer processing are visible here.
    fn post_process_page(&mut self, page: u32) {
        let surface = Arc::clone(&self.surface);
        let Some(overlays) = self.pagewise.get_mut(&page) else {
            return;
        };

        let caches: Vec<Arc<BacklinkCache>> = overlays.map.keys().cloned().collect();
        for cache in caches {
            let color = cache.color();
            let elements: Vec<ElementId> = overlays.map.get(&cache).copied().collect();
            for element in elements {
                match &color {
                    Some(HighlightColor::Name(name)) => {
                        surface.set_attribute(element, ATTR_DESTINATION_COLOR, &name.to_lowercase());
                    }
                    Some(HighlightColor::Rgb { r, g, b }) => {
                        let value = format!("rgb({}, {}, {})", r, g, b);
                        surface.set_css_property(element, CSS_COLOR, &value);
                        surface.set_css_property(element, CSS_ICON_COLOR, &value);
                        surface.set_css_property(element, CSS_RECT_COLOR, &value);
                    }
                    None => {}
                }
                overlays.interactive.insert(element);
            }
        }
    }
}

fn unstyle(surface: &dyn RenderSurface, element: ElementId) {
    surface.remove_class(element, CLASS_BACKLINK);
    surface.remove_class(element, CLASS_BACKLINK_ANNOTATION);
    surface.remove_class(element, CLASS_IS_HOVERED);
    surface.remove_attribute(element, ATTR_DESTINATION_COLOR);
    surface.remove_css_property(element, CSS_COLOR);
    surface.remove_css_property(element, CSS_ICON_COLOR);
    surface.remove_css_property(element, CSS_RECT_COLOR);
}

/// Rendering context a visualizer is attached to. Each kind is
/// independently toggleable in the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Normal,
    Embed,
    HoverPopover,
    Canvas,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    pub highlight_backlinks: bool,
    pub highlight_backlinks_in_embed: bool,
    pub highlight_backlinks_in_hover_popover: bool,
    pub highlight_backlinks_in_canvas: bool,
    pub show_backlink_icon_for_selection: bool,
    pub show_backlink_icon_for_annotation: bool,
    pub show_backlink_icon_for_offset: bool,
    pub show_backlink_icon_for_rect: bool,
    pub show_bounding_rect_for_annotation: bool,
    pub double_click_highlight_to_open_backlink: bool,
    pub highlight_backlinks_pane: bool,
    pub backlink_icon_size: f32,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            highlight_backlinks: true,
            highlight_backlinks_in_embed: true,
            highlight_backlinks_in_hover_popover: true,
            highlight_backlinks_in_canvas: true,
            show_backlink_icon_for_selection: true,
            show_backlink_icon_for_annotation: true,
            show_backlink_icon_for_offset: true,
            show_backlink_icon_for_rect: true,
            show_bounding_rect_for_annotation: false,
            double_click_highlight_to_open_backlink: true,
            highlight_backlinks_pane: true,
            backlink_icon_size: 50.0,
        }
    }
}

impl VisualizerSettings {
    pub fn should_visualize(&self, view: ViewKind) -> bool {
        self.highlight_backlinks
            && match view {
                ViewKind::Normal => true,
                ViewKind::Embed => self.highlight_backlinks_in_embed,
                ViewKind::HoverPopover => self.highlight_backlinks_in_hover_popover,
                ViewKind::Canvas => self.highlight_backlinks_in_canvas,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanePolicy {
    Tab,
    Split,
    Window,
}

/// Opens a backlink's source document, optionally scrolled to a line.
pub trait Navigator: Send + Sync {
    fn open(&self, source_path: &str, line: Option<u32>);
    fn open_in_pane(&self, source_path: &str, line: Option<u32>, pane: PanePolicy);
}

/// Mirrors hover state into a reference-list view bound to the same
/// document.
pub trait BacklinkPaneSync: Send + Sync {
    fn set_highlighted(&self, cache: &BacklinkCache, highlighted: bool);
}

pub trait ContextMenuHandler: Send + Sync {
    fn open_menu(&self, cache: &Arc<BacklinkCache>, page: u32);
}

#[derive(Default, Clone)]
pub struct Collaborators {
    pub navigator: Option<Arc<dyn Navigator>>,
    pub pane_sync: Option<Arc<dyn BacklinkPaneSync>>,
    pub context_menu: Option<Arc<dyn ContextMenuHandler>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
    HoverLink {
        source_path: String,
        line: Option<u32>,
        element: ElementId,
    },
}

/// Pointer interactions forwarded by the surface owner. `Leave` carries the
/// element the pointer moved to, so exits into an element's own children can
/// be told apart from real exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Enter {
        element: ElementId,
    },
    Leave {
        element: ElementId,
        to: Option<ElementId>,
    },
    DoubleClick {
        element: ElementId,
        pane: Option<PanePolicy>,
    },
    ContextMenu {
        element: ElementId,
    },
}

#[derive(Clone, Copy)]
enum IconSide {
    Left,
    Right,
}

enum HubSubscription {
    Page(SubscriptionId),
    Index(SubscriptionId),
}

/// Orchestrates one visualized surface: subscribes to the page lifecycle and
/// the index's update notification, turns grouped references into overlay
/// elements and dispatches pointer interactions.
pub struct BacklinkVisualizer {
    index: Arc<BacklinkIndex>,
    backend: Arc<dyn DocumentBackend>,
    surface: Arc<dyn RenderSurface>,
    page_events: Arc<EventHub<PageEvent>>,
    settings: VisualizerSettings,
    view_kind: ViewKind,
    collaborators: Collaborators,
    manager: Mutex<OverlayManager>,
    signals: EventHub<UiSignal>,
    subscriptions: Mutex<Vec<HubSubscription>>,
}

impl BacklinkVisualizer {
    pub fn new(
        index: Arc<BacklinkIndex>,
        backend: Arc<dyn DocumentBackend>,
        surface: Arc<dyn RenderSurface>,
        page_events: Arc<EventHub<PageEvent>>,
        settings: VisualizerSettings,
        view_kind: ViewKind,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            backend,
            surface: Arc::clone(&surface),
            page_events,
            settings,
            view_kind,
            collaborators,
            manager: Mutex::new(OverlayManager::new(surface)),
            signals: EventHub::new(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn file(&self) -> &DocumentInfo {
        self.index.info()
    }

    pub fn settings(&self) -> &VisualizerSettings {
        &self.settings
    }

    pub fn signals(&self) -> &EventHub<UiSignal> {
        &self.signals
    }

    pub fn page_status(&self, page: u32) -> PageStatus {
        self.manager.lock().get_status(page)
    }

    /// Establishes the lifecycle and index-update subscriptions. Does
    /// nothing when overlays are disabled for this rendering context; in
    /// that case no listeners exist and no overlays ever appear.
    pub fn attach(self: &Arc<Self>) {
        if !self.settings.should_visualize(self.view_kind) {
            return;
        }
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let page_subscription = self.page_events.subscribe(move |event| {
            if let Some(visualizer) = weak.upgrade() {
                visualizer.on_page_event(*event);
            }
        });
        subscriptions.push(HubSubscription::Page(page_subscription));

        let weak = Arc::downgrade(self);
        let index_subscription = self.index.events().subscribe(move |_| {
            if let Some(visualizer) = weak.upgrade() {
                visualizer.revisualize();
            }
        });
        subscriptions.push(HubSubscription::Index(index_subscription));
    }

    /// Releases every subscription handle and clears every page's overlays
    /// in one pass. Safe to call more than once.
    pub fn detach(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            match subscription {
                HubSubscription::Page(id) => {
                    self.page_events.unsubscribe(id);
                }
                HubSubscription::Index(id) => {
                    self.index.events().unsubscribe(id);
                }
            }
        }
        self.manager.lock().clear_all();
    }

    pub fn on_page_event(&self, event: PageEvent) {
        match event {
            PageEvent::PageReady(page) => self.on_page_ready(page),
            PageEvent::TextLayerReady(page) => self.on_text_layer_ready(page),
            PageEvent::AnnotationLayerReady(page) => self.on_annotation_layer_ready(page),
        }
    }

    fn on_page_ready(&self, page: u32) {
        trace!(page, "page ready");
        let mut manager = self.manager.lock();
        manager.clear_page(page);

        let page_index = self.index.get_page_index(page);
        for (id, caches) in page_index.xyzs() {
            self.process_xyz(&mut manager, page, id, caches);
        }
        for (id, caches) in page_index.fit_bhs() {
            self.process_fit_bh(&mut manager, page, id, caches);
        }
        for (id, caches) in page_index.fit_rs() {
            self.process_fit_r(&mut manager, page, id, caches);
        }

        manager.update_status(
            page,
            PageStatusUpdate {
                page_ready: Some(true),
                ..Default::default()
            },
        );
        manager.post_process_page_if_ready(page);
    }

    fn on_text_layer_ready(&self, page: u32) {
        let mut manager = self.manager.lock();
        let status = manager.get_status(page);
        if !status.page_ready || status.text_layer_ready {
            return;
        }
        trace!(page, "text layer ready");

        let page_index = self.index.get_page_index(page);
        for (id, caches) in page_index.selections() {
            self.process_selection(&mut manager, page, id, caches);
        }

        manager.update_status(
            page,
            PageStatusUpdate {
                text_layer_ready: Some(true),
                ..Default::default()
            },
        );
        manager.post_process_page_if_ready(page);
    }

    fn on_annotation_layer_ready(&self, page: u32) {
        let mut manager = self.manager.lock();
        let status = manager.get_status(page);
        if !status.page_ready || status.annotation_layer_ready {
            return;
        }
        trace!(page, "annotation layer ready");

        let page_index = self.index.get_page_index(page);
        for (id, caches) in page_index.annotations() {
            self.process_annotation(&mut manager, page, id, caches);
        }

        manager.update_status(
            page,
            PageStatusUpdate {
                annotation_layer_ready: Some(true),
                ..Default::default()
            },
        );
        manager.post_process_page_if_ready(page);
    }

    /// Replays the lifecycle for every tracked page against fresh index
    /// data: page-ready first, then the layer events whose flags were set
    /// before the replay.
    fn revisualize(&self) {
        let pages = self.manager.lock().tracked_pages();
        for page in pages {
            let prior = self.manager.lock().get_status(page);
            if !prior.page_ready {
                continue;
            }
            self.on_page_ready(page);
            if prior.text_layer_ready {
                self.on_text_layer_ready(page);
            }
            if prior.annotation_layer_ready {
                self.on_annotation_layer_ready(page);
            }
        }
    }

    fn process_selection(
        &self,
        manager: &mut OverlayManager,
        page: u32,
        id: &str,
        caches: &CacheGroup,
    ) {
        let Ok(params) = SelectionParams::decode(id) else {
            return;
        };
        let Some(layer) = self.backend.text_layer(page) else {
            return;
        };
        if layer.items.is_empty() {
            return;
        }

        let rects = merge_selection_rects(&layer.items, params);
        for merged in &rects {
            let element = self.surface.place_rect(page, merged.rect);
            self.surface.add_class(element, CLASS_BACKLINK);
            self.surface.add_class(element, CLASS_BACKLINK_SELECTION);

            // font-size drives the em-based padding of the highlight
            if let Some(&first) = merged.indices.first() {
                self.surface.set_css_property(
                    element,
                    "font-size",
                    &format!("{}px", layer.items[first].font_size),
                );
            }

            let indices: Vec<String> = merged.indices.iter().map(|i| i.to_string()).collect();
            self.surface
                .set_attribute(element, ATTR_TEXT_INDICES, &indices.join(","));

            for cache in caches {
                manager.register_owned(page, cache, element);
            }
        }

        if self.settings.show_backlink_icon_for_selection {
            if let Some(last) = rects.last() {
                if let Some(icon) =
                    self.place_icon(page, last.rect.right, last.rect.bottom, IconSide::Right)
                {
                    for cache in caches {
                        manager.register_owned(page, cache, icon);
                    }
                }
            }
        }
    }

    fn process_annotation(
        &self,
        manager: &mut OverlayManager,
        page: u32,
        id: &str,
        caches: &CacheGroup,
    ) {
        // The annotation may have been deleted since the reference was made.
        let Some(annotation) = self.backend.annotation(page, id) else {
            return;
        };
        self.surface.add_class(annotation.element, CLASS_BACKLINK);
        self.surface
            .add_class(annotation.element, CLASS_BACKLINK_ANNOTATION);

        let icon = if self.settings.show_backlink_icon_for_annotation {
            self.place_icon(page, annotation.rect.right, annotation.rect.top, IconSide::Right)
        } else {
            None
        };

        let bounding = if self.settings.show_bounding_rect_for_annotation {
            let element = self.surface.place_rect(page, annotation.rect);
            self.surface.add_class(element, CLASS_ANNOTATION_BOUNDING_RECT);
            Some(element)
        } else {
            None
        };

        for cache in caches {
            manager.register_native(page, cache, annotation.element);
            if let Some(icon) = icon {
                manager.register_owned(page, cache, icon);
            }
            if let Some(bounding) = bounding {
                manager.register_owned(page, cache, bounding);
            }
            if let Some([r, g, b]) = annotation.color {
                cache.set_color(HighlightColor::Rgb { r, g, b });
            }
        }
    }

    fn process_xyz(&self, manager: &mut OverlayManager, page: u32, id: &str, caches: &CacheGroup) {
        if !self.settings.show_backlink_icon_for_offset {
            return;
        }
        let Ok(params) = XyzParams::decode(id) else {
            return;
        };
        let Some(icon) = self.place_icon(page, params.left, params.top, IconSide::Left) else {
            return;
        };
        for cache in caches {
            manager.register_owned(page, cache, icon);
        }
    }

    fn process_fit_bh(
        &self,
        manager: &mut OverlayManager,
        page: u32,
        id: &str,
        caches: &CacheGroup,
    ) {
        if !self.settings.show_backlink_icon_for_offset {
            return;
        }
        let Ok(params) = FitBhParams::decode(id) else {
            return;
        };
        let Some(icon) = self.place_icon(page, 0.0, params.top, IconSide::Right) else {
            return;
        };
        for cache in caches {
            manager.register_owned(page, cache, icon);
        }
    }

    fn process_fit_r(
        &self,
        manager: &mut OverlayManager,
        page: u32,
        id: &str,
        caches: &CacheGroup,
    ) {
        let Ok(params) = FitRParams::decode(id) else {
            return;
        };
        let element = self.surface.place_rect(page, params.rect());
        self.surface.add_class(element, CLASS_BACKLINK);
        self.surface.add_class(element, CLASS_BACKLINK_FIT_R);
        for cache in caches {
            manager.register_owned(page, cache, element);
        }

        if self.settings.show_backlink_icon_for_rect {
            if let Some(icon) = self.place_icon(page, params.right, params.top, IconSide::Right) {
                for cache in caches {
                    manager.register_owned(page, cache, icon);
                }
            }
        }
    }

    fn place_icon(&self, page: u32, x: f32, y: f32, side: IconSide) -> Option<ElementId> {
        let size = self.backend.page_size(page)?;
        let icon_size = size.width.min(size.width) * self.settings.backlink_icon_size / 2000.0;
        let rect = match side {
            IconSide::Right => Rect::new(x, y - icon_size, x + icon_size, y),
            IconSide::Left => Rect::new(x - icon_size, y - icon_size, x, y),
        };
        let element = self.surface.place_rect(page, rect);
        self.surface.add_class(element, CLASS_BACKLINK_ICON);
        self.surface.set_icon(element, BACKLINK_ICON);
        Some(element)
    }

    pub fn on_pointer_event(&self, event: PointerEvent) {
        match event {
            PointerEvent::Enter { element } => self.on_pointer_enter(element),
            PointerEvent::Leave { element, to } => self.on_pointer_leave(element, to),
            PointerEvent::DoubleClick { element, pane } => self.on_double_click(element, pane),
            PointerEvent::ContextMenu { element } => self.on_context_menu(element),
        }
    }

    fn interaction_target(
        &self,
        element: ElementId,
    ) -> Option<(u32, Vec<Arc<BacklinkCache>>)> {
        let manager = self.manager.lock();
        let page = manager.page_of(element)?;
        if !manager.is_interactive(page, element) {
            return None;
        }
        let caches = manager.caches_of(page, element);
        if caches.is_empty() {
            return None;
        }
        Some((page, caches))
    }

    fn on_pointer_enter(&self, element: ElementId) {
        let Some((page, caches)) = self.interaction_target(element) else {
            return;
        };
        self.set_co_highlight(page, &caches, true);
        for cache in &caches {
            self.signals.emit(&UiSignal::HoverLink {
                source_path: cache.source_path().to_owned(),
                line: cache.line(),
                element,
            });
            if self.settings.highlight_backlinks_pane {
                if let Some(pane_sync) = &self.collaborators.pane_sync {
                    pane_sync.set_highlighted(cache, true);
                }
            }
        }
    }

    fn on_pointer_leave(&self, element: ElementId, to: Option<ElementId>) {
        // A move into the element's own children is not a real exit.
        if let Some(to) = to {
            if to == element || self.surface.is_within(to, element) {
                return;
            }
        }
        let Some((page, caches)) = self.interaction_target(element) else {
            return;
        };
        self.set_co_highlight(page, &caches, false);
        if self.settings.highlight_backlinks_pane {
            for cache in &caches {
                if let Some(pane_sync) = &self.collaborators.pane_sync {
                    pane_sync.set_highlighted(cache, false);
                }
            }
        }
    }

    fn set_co_highlight(&self, page: u32, caches: &[Arc<BacklinkCache>], on: bool) {
        let manager = self.manager.lock();
        for cache in caches {
            if cache.page().is_none() {
                continue;
            }
            for element in manager.elements_of(page, cache) {
                if on {
                    self.surface.add_class(element, CLASS_IS_HOVERED);
                } else {
                    self.surface.remove_class(element, CLASS_IS_HOVERED);
                }
            }
        }
    }

    fn on_double_click(&self, element: ElementId, pane: Option<PanePolicy>) {
        if !self.settings.double_click_highlight_to_open_backlink {
            return;
        }
        let Some((_, caches)) = self.interaction_target(element) else {
            return;
        };
        let Some(navigator) = &self.collaborators.navigator else {
            return;
        };
        for cache in &caches {
            match pane {
                Some(pane) => navigator.open_in_pane(cache.source_path(), cache.line(), pane),
                None => navigator.open(cache.source_path(), cache.line()),
            }
        }
    }

    fn on_context_menu(&self, element: ElementId) {
        let Some((page, caches)) = self.interaction_target(element) else {
            return;
        };
        let Some(handler) = &self.collaborators.context_menu else {
            return;
        };
        for cache in &caches {
            handler.open_menu(cache, page);
        }
    }
}

impl Drop for BacklinkVisualizer {
    fn drop(&mut self) {
        self.detach();
    }
}
