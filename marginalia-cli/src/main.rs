use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use marginalia_core::{
    DocumentBackend, DocumentInfo, ElementId, EventHub, NativeAnnotation, PageEvent, PageSize,
    RawReference, Rect, RenderSurface, TextLayer,
};
use marginalia_index::{BacklinkIndex, ReferenceProvider};
use marginalia_overlay::{BacklinkVisualizer, Collaborators, ViewKind, VisualizerSettings};

#[derive(Debug, Parser)]
#[command(
    name = "marginalia",
    version,
    about = "replays a document's page lifecycle and prints the backlink overlays it produces"
)]
struct Args {
    /// Fixture document (JSON: path, pages with sizes, text layers, annotations)
    #[arg(long = "document")]
    document: PathBuf,

    /// Raw reference records (JSON array)
    #[arg(long = "references")]
    references: PathBuf,

    /// Visualizer settings (TOML); defaults apply when omitted
    #[arg(long = "settings")]
    settings: Option<PathBuf>,

    /// Only replay the given page (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<u32>,

    /// Rendering context to visualize for
    #[arg(long = "view", value_enum, default_value_t = ViewArg::Normal)]
    view: ViewArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewArg {
    Normal,
    Embed,
    Hover,
    Canvas,
}

impl ViewArg {
    fn kind(self) -> ViewKind {
        match self {
            ViewArg::Normal => ViewKind::Normal,
            ViewArg::Embed => ViewKind::Embed,
            ViewArg::Hover => ViewKind::HoverPopover,
            ViewArg::Canvas => ViewKind::Canvas,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(ProjectDirs::from("net", "marginalia", "marginalia").as_ref())?;

    let settings = load_settings(args.settings.as_deref())?;
    let fixture = load_fixture(&args.document)?;

    let surface = Arc::new(RecordingSurface::default());
    let backend = Arc::new(FixtureBackend::new(fixture, surface.as_ref()));
    let page_count = backend.info().page_count;
    if let Some(page) = args.page {
        if page == 0 || page > page_count {
            bail!("page {} out of range (document has {} pages)", page, page_count);
        }
    }

    let index = Arc::new(BacklinkIndex::new(backend.info().clone()));
    let provider = FileReferenceProvider {
        path: args.references.clone(),
    };
    index
        .rebuild_with(&provider)
        .await
        .with_context(|| format!("failed to load references from {:?}", args.references))?;

    let page_events = Arc::new(EventHub::new());
    let visualizer = BacklinkVisualizer::new(
        Arc::clone(&index),
        Arc::clone(&backend) as Arc<dyn DocumentBackend>,
        Arc::clone(&surface) as Arc<dyn RenderSurface>,
        Arc::clone(&page_events),
        settings,
        args.view.kind(),
        Collaborators::default(),
    );
    visualizer.attach();

    let pages: Vec<u32> = match args.page {
        Some(page) => vec![page],
        None => (1..=page_count).collect(),
    };
    for page in pages {
        page_events.emit(&PageEvent::PageReady(page));
        page_events.emit(&PageEvent::TextLayerReady(page));
        page_events.emit(&PageEvent::AnnotationLayerReady(page));
    }

    let output = surface.dump(args.page);
    serde_json::to_writer_pretty(io::stdout().lock(), &output)?;
    println!();

    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<VisualizerSettings> {
    let Some(path) = path else {
        return Ok(VisualizerSettings::default());
    };
    let payload = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {:?}", path))?;
    toml::from_str(&payload).with_context(|| format!("failed to decode settings file {:?}", path))
}

fn load_fixture(path: &Path) -> Result<FixtureDocument> {
    let payload =
        fs::read_to_string(path).with_context(|| format!("failed to read fixture {:?}", path))?;
    let fixture: FixtureDocument = serde_json::from_str(&payload)
        .with_context(|| format!("failed to decode fixture {:?}", path))?;
    if fixture.pages.is_empty() {
        bail!("fixture {:?} has no pages", path);
    }
    Ok(fixture)
}

#[derive(Debug, Deserialize)]
struct FixtureDocument {
    path: PathBuf,
    pages: Vec<FixturePage>,
}

#[derive(Debug, Deserialize)]
struct FixturePage {
    size: PageSize,
    #[serde(default)]
    text_layer: Option<TextLayer>,
    #[serde(default)]
    annotations: Vec<FixtureAnnotation>,
}

#[derive(Debug, Deserialize)]
struct FixtureAnnotation {
    id: String,
    rect: Rect,
    #[serde(default)]
    color: Option<[u8; 3]>,
}

/// Document backend assembled from a JSON fixture. Native annotation
/// containers are materialized on the surface up front, the way a real
/// viewer's annotation layer owns its elements before the engine sees them.
struct FixtureBackend {
    info: DocumentInfo,
    pages: Vec<FixturePage>,
    annotations: HashMap<(u32, String), NativeAnnotation>,
}

impl FixtureBackend {
    fn new(fixture: FixtureDocument, surface: &RecordingSurface) -> Self {
        let info = DocumentInfo::new(fixture.path.clone(), fixture.pages.len() as u32);
        let mut annotations = HashMap::new();
        for (index, page) in fixture.pages.iter().enumerate() {
            let page_number = index as u32 + 1;
            for annotation in &page.annotations {
                let element = surface.adopt_native(page_number, annotation.rect, &annotation.id);
                let previous = annotations.insert(
                    (page_number, annotation.id.clone()),
                    NativeAnnotation {
                        rect: annotation.rect,
                        color: annotation.color,
                        element,
                    },
                );
                if previous.is_some() {
                    warn!(
                        page = page_number,
                        id = %annotation.id,
                        "duplicate annotation id in fixture, keeping the last one"
                    );
                }
            }
        }
        Self {
            info,
            pages: fixture.pages,
            annotations,
        }
    }

    fn page(&self, page: u32) -> Option<&FixturePage> {
        (page >= 1)
            .then(|| self.pages.get(page as usize - 1))
            .flatten()
    }
}

impl DocumentBackend for FixtureBackend {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page: u32) -> Option<PageSize> {
        self.page(page).map(|page| page.size)
    }

    fn text_layer(&self, page: u32) -> Option<TextLayer> {
        self.page(page)?.text_layer.clone()
    }

    fn annotation(&self, page: u32, id: &str) -> Option<NativeAnnotation> {
        self.annotations.get(&(page, id.to_owned())).cloned()
    }
}

#[derive(Debug, Clone, Serialize)]
struct ElementRecord {
    id: u64,
    page: u32,
    rect: Rect,
    native: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotation_id: Option<String>,
    classes: BTreeSet<String>,
    attributes: BTreeMap<String, String>,
    css: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

/// Render surface that records every placement and styling call so the
/// resulting overlay set can be printed.
#[derive(Default)]
struct RecordingSurface {
    next_id: AtomicU64,
    elements: Mutex<BTreeMap<ElementId, ElementRecord>>,
}

impl RecordingSurface {
    fn insert(&self, page: u32, rect: Rect, native: bool, annotation_id: Option<String>) -> ElementId {
        let id = ElementId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.elements.lock().insert(
            id,
            ElementRecord {
                id: id.0,
                page,
                rect,
                native,
                annotation_id,
                classes: BTreeSet::new(),
                attributes: BTreeMap::new(),
                css: BTreeMap::new(),
                icon: None,
            },
        );
        id
    }

    fn adopt_native(&self, page: u32, rect: Rect, annotation_id: &str) -> ElementId {
        self.insert(page, rect, true, Some(annotation_id.to_owned()))
    }

    fn dump(&self, page: Option<u32>) -> Vec<ElementRecord> {
        self.elements
            .lock()
            .values()
            .filter(|record| page.map_or(true, |page| record.page == page))
            .cloned()
            .collect()
    }
}

impl RenderSurface for RecordingSurface {
    fn place_rect(&self, page: u32, rect: Rect) -> ElementId {
        self.insert(page, rect, false, None)
    }

    fn set_icon(&self, element: ElementId, icon: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.icon = Some(icon.to_owned());
        }
    }

    fn add_class(&self, element: ElementId, class: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.classes.insert(class.to_owned());
        }
    }

    fn remove_class(&self, element: ElementId, class: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.classes.remove(class);
        }
    }

    fn set_attribute(&self, element: ElementId, key: &str, value: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.attributes.insert(key.to_owned(), value.to_owned());
        }
    }

    fn remove_attribute(&self, element: ElementId, key: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.attributes.remove(key);
        }
    }

    fn set_css_property(&self, element: ElementId, key: &str, value: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.css.insert(key.to_owned(), value.to_owned());
        }
    }

    fn remove_css_property(&self, element: ElementId, key: &str) {
        if let Some(record) = self.elements.lock().get_mut(&element) {
            record.css.remove(key);
        }
    }

    fn remove(&self, element: ElementId) {
        self.elements.lock().remove(&element);
    }

    fn is_within(&self, _element: ElementId, _ancestor: ElementId) -> bool {
        false
    }
}

struct FileReferenceProvider {
    path: PathBuf,
}

#[async_trait]
impl ReferenceProvider for FileReferenceProvider {
    async fn references(&self, _doc: &DocumentInfo) -> Result<Vec<RawReference>> {
        let payload = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read references {:?}", self.path))?;
        let records: Vec<RawReference> = serde_json::from_str(&payload)
            .with_context(|| format!("failed to decode references {:?}", self.path))?;
        if records.is_empty() {
            warn!(path = %self.path.display(), "reference file contains no records");
        }
        Ok(records)
    }
}

fn init_logging(project_dirs: Option<&ProjectDirs>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match project_dirs {
        Some(dirs) => {
            let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
            let log_dir = dirs.data_local_dir().join("logs");
            fs::create_dir_all(&log_dir)?;
            let file_appender = tracing_appender::rolling::never(log_dir, "marginalia.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer)
                .try_init()
                .map_err(|err| anyhow!(err))?;
            Ok(Some(guard))
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
                .map_err(|err| anyhow!(err))?;
            Ok(None)
        }
    }
}
