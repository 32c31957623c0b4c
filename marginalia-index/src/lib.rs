use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use marginalia_core::{
    parse_subpath, DestinationKind, DocumentInfo, EventHub, HighlightColor, RawReference,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(u64);

/// The indexed, resolved form of one raw reference: bound to a concrete
/// destination kind and id within the target document. Two independent
/// references to the exact same destination stay distinct (identity is the
/// `CacheId`, not the destination).
#[derive(Debug)]
pub struct BacklinkCache {
    id: CacheId,
    source_path: String,
    line: Option<u32>,
    page: Option<u32>,
    kind: DestinationKind,
    dest_id: String,
    color: Mutex<Option<HighlightColor>>,
}

impl BacklinkCache {
    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn page(&self) -> Option<u32> {
        self.page
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn dest_id(&self) -> &str {
        &self.dest_id
    }

    pub fn color(&self) -> Option<HighlightColor> {
        self.color.lock().clone()
    }

    /// Single-writer presentation state: assigned when the subpath carries an
    /// explicit color, overwritten once a referenced annotation's native
    /// color becomes known during annotation-layer processing.
    pub fn set_color(&self, color: HighlightColor) {
        *self.color.lock() = Some(color);
    }
}

impl PartialEq for BacklinkCache {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BacklinkCache {}

impl Hash for BacklinkCache {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

pub type CacheGroup = HashSet<Arc<BacklinkCache>>;
type GroupMap = HashMap<String, CacheGroup>;

/// Per-page grouping of caches by destination kind and destination id.
#[derive(Debug, Default)]
pub struct PageBacklinkIndex {
    page: u32,
    selections: GroupMap,
    annotations: GroupMap,
    xyzs: GroupMap,
    fit_bhs: GroupMap,
    fit_rs: GroupMap,
}

impl PageBacklinkIndex {
    fn new(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    fn add(&mut self, cache: Arc<BacklinkCache>) {
        let id = cache.dest_id().to_owned();
        let groups = match cache.kind() {
            DestinationKind::Selection => &mut self.selections,
            DestinationKind::Annotation => &mut self.annotations,
            DestinationKind::Xyz => &mut self.xyzs,
            DestinationKind::FitBh => &mut self.fit_bhs,
            DestinationKind::FitR => &mut self.fit_rs,
        };
        groups.entry(id).or_default().insert(cache);
    }

    pub fn entries(&self, kind: DestinationKind) -> &GroupMap {
        match kind {
            DestinationKind::Selection => &self.selections,
            DestinationKind::Annotation => &self.annotations,
            DestinationKind::Xyz => &self.xyzs,
            DestinationKind::FitBh => &self.fit_bhs,
            DestinationKind::FitR => &self.fit_rs,
        }
    }

    pub fn selections(&self) -> &GroupMap {
        &self.selections
    }

    pub fn annotations(&self) -> &GroupMap {
        &self.annotations
    }

    pub fn xyzs(&self) -> &GroupMap {
        &self.xyzs
    }

    pub fn fit_bhs(&self) -> &GroupMap {
        &self.fit_bhs
    }

    pub fn fit_rs(&self) -> &GroupMap {
        &self.fit_rs
    }

    pub fn is_empty(&self) -> bool {
        self.cache_count() == 0
    }

    pub fn cache_count(&self) -> usize {
        [
            &self.selections,
            &self.annotations,
            &self.xyzs,
            &self.fit_bhs,
            &self.fit_rs,
        ]
        .into_iter()
        .flat_map(|groups| groups.values())
        .map(|caches| caches.len())
        .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    Updated,
}

#[derive(Default)]
struct IndexState {
    caches: Vec<Arc<BacklinkCache>>,
    pages: HashMap<u32, Arc<PageBacklinkIndex>>,
}

/// All resolved backlinks of one open document. Rebuilt per session from raw
/// reference records; shared read-only between any number of visualizers.
pub struct BacklinkIndex {
    info: DocumentInfo,
    next_cache_id: AtomicU64,
    state: RwLock<IndexState>,
    events: EventHub<IndexEvent>,
}

impl BacklinkIndex {
    pub fn new(info: DocumentInfo) -> Self {
        Self {
            info,
            next_cache_id: AtomicU64::new(1),
            state: RwLock::new(IndexState::default()),
            events: EventHub::new(),
        }
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn events(&self) -> &EventHub<IndexEvent> {
        &self.events
    }

    /// Replaces the whole cache collection from the given records and emits
    /// exactly one [`IndexEvent::Updated`]. Page indexes handed out earlier
    /// become stale and must be re-fetched. Records that do not encode a
    /// resolvable destination into this document are dropped.
    pub fn rebuild(&self, records: &[RawReference]) {
        let caches: Vec<Arc<BacklinkCache>> = records
            .iter()
            .filter_map(|record| self.resolve(record))
            .map(Arc::new)
            .collect();

        {
            let mut state = self.state.write();
            state.caches = caches;
            state.pages.clear();
        }

        debug!(
            file = %self.info.path.display(),
            records = records.len(),
            resolved = self.cache_count(),
            "rebuilt backlink index"
        );
        self.events.emit(&IndexEvent::Updated);
    }

    pub async fn rebuild_with(&self, provider: &dyn ReferenceProvider) -> Result<()> {
        let records = provider.references(&self.info).await?;
        self.rebuild(&records);
        Ok(())
    }

    fn resolve(&self, record: &RawReference) -> Option<BacklinkCache> {
        if !self.info.is_addressed_by(&record.target) {
            return None;
        }
        let parsed = parse_subpath(&record.subpath)?;
        if parsed.page > self.info.page_count {
            return None;
        }
        Some(BacklinkCache {
            id: CacheId(self.next_cache_id.fetch_add(1, Ordering::Relaxed)),
            source_path: record.source_path.clone(),
            line: record.line,
            page: Some(parsed.page),
            kind: parsed.destination.kind(),
            dest_id: parsed.destination.id(),
            color: Mutex::new(parsed.color),
        })
    }

    /// Never fails: an unindexed page yields empty groups. The returned index
    /// is valid until the next rebuild.
    pub fn get_page_index(&self, page: u32) -> Arc<PageBacklinkIndex> {
        if let Some(existing) = self.state.read().pages.get(&page) {
            return Arc::clone(existing);
        }

        let mut state = self.state.write();
        if let Some(existing) = state.pages.get(&page) {
            return Arc::clone(existing);
        }
        let mut page_index = PageBacklinkIndex::new(page);
        for cache in &state.caches {
            if cache.page() == Some(page) {
                page_index.add(Arc::clone(cache));
            }
        }
        let page_index = Arc::new(page_index);
        state.pages.insert(page, Arc::clone(&page_index));
        page_index
    }

    pub fn caches(&self) -> Vec<Arc<BacklinkCache>> {
        self.state.read().caches.clone()
    }

    pub fn cache_count(&self) -> usize {
        self.state.read().caches.len()
    }
}

/// Supplies the raw reference records pointing at a document. Mirrors the
/// shape of a document provider: the collaborator owns discovery, the index
/// owns resolution.
#[async_trait]
pub trait ReferenceProvider: Send + Sync {
    async fn references(&self, doc: &DocumentInfo) -> Result<Vec<RawReference>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn doc() -> DocumentInfo {
        DocumentInfo::new(PathBuf::from("notes/paper.pdf"), 10)
    }

    fn reference(source: &str, subpath: &str) -> RawReference {
        RawReference {
            source_path: source.to_owned(),
            target: "paper.pdf".to_owned(),
            subpath: subpath.to_owned(),
            line: Some(4),
        }
    }

    fn sample_records() -> Vec<RawReference> {
        vec![
            reference("a.md", "#page=3&selection=2,0,2,5"),
            reference("b.md", "#page=3&selection=2,0,2,5"),
            reference("c.md", "#page=1&annotation=207R"),
            reference("d.md", "#page=1&annotation=207R"),
            reference("e.md", "#page=2&offset=72,640"),
            reference("f.md", "#page=2&offset=,640"),
            reference("g.md", "#page=5&rect=10,20,30,40"),
        ]
    }

    #[test]
    fn rebuild_partitions_caches_by_page() {
        let index = BacklinkIndex::new(doc());
        index.rebuild(&sample_records());

        let flat: HashSet<CacheId> = index.caches().iter().map(|cache| cache.id()).collect();
        assert_eq!(flat.len(), 7);

        let mut union = HashSet::new();
        for page in 1..=10 {
            let page_index = index.get_page_index(page);
            for kind in [
                DestinationKind::Selection,
                DestinationKind::Annotation,
                DestinationKind::Xyz,
                DestinationKind::FitBh,
                DestinationKind::FitR,
            ] {
                for caches in page_index.entries(kind).values() {
                    for cache in caches {
                        assert_eq!(cache.page(), Some(page));
                        assert!(union.insert(cache.id()), "cache listed on two pages");
                    }
                }
            }
        }
        assert_eq!(union, flat);
    }

    #[test]
    fn same_destination_groups_distinct_caches() {
        let index = BacklinkIndex::new(doc());
        index.rebuild(&sample_records());

        let page_index = index.get_page_index(1);
        assert_eq!(page_index.annotations().len(), 1);
        let group = &page_index.annotations()["207R"];
        assert_eq!(group.len(), 2);

        let selections = index.get_page_index(3);
        assert_eq!(selections.selections()["2,0,2,5"].len(), 2);
    }

    #[test]
    fn unresolvable_records_are_dropped() {
        let index = BacklinkIndex::new(doc());
        let records = vec![
            RawReference {
                source_path: "a.md".to_owned(),
                target: "other.pdf".to_owned(),
                subpath: "#page=1&annotation=1R".to_owned(),
                line: None,
            },
            reference("b.md", "#page=1"),
            reference("c.md", "#page=11&annotation=1R"),
            reference("d.md", "#page=abc&annotation=1R"),
            reference("e.md", "#page=2&annotation=2R"),
        ];
        index.rebuild(&records);
        assert_eq!(index.cache_count(), 1);
        assert_eq!(index.caches()[0].dest_id(), "2R");
    }

    #[test]
    fn update_fires_once_per_rebuild_and_stales_page_indexes() {
        let index = BacklinkIndex::new(doc());
        let updates = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&updates);
        index.events().subscribe(move |event| {
            assert_eq!(*event, IndexEvent::Updated);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        index.rebuild(&sample_records());
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        let before = index.get_page_index(3);
        assert_eq!(before.cache_count(), 2);

        index.rebuild(&sample_records()[..1]);
        assert_eq!(updates.load(Ordering::SeqCst), 2);

        let after = index.get_page_index(3);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.cache_count(), 1);
    }

    #[test]
    fn unindexed_page_yields_empty_groups() {
        let index = BacklinkIndex::new(doc());
        index.rebuild(&sample_records());
        let page_index = index.get_page_index(9);
        assert!(page_index.is_empty());
        assert_eq!(page_index.page(), 9);
    }

    #[test]
    fn subpath_color_seeds_cache_color() {
        let index = BacklinkIndex::new(doc());
        index.rebuild(&[reference("a.md", "#page=1&annotation=1R&color=yellow")]);
        let cache = &index.caches()[0];
        assert_eq!(
            cache.color(),
            Some(HighlightColor::Name("yellow".to_owned()))
        );

        cache.set_color(HighlightColor::Rgb { r: 1, g: 2, b: 3 });
        assert_eq!(cache.color(), Some(HighlightColor::Rgb { r: 1, g: 2, b: 3 }));
    }

    struct FakeProvider;

    #[async_trait]
    impl ReferenceProvider for FakeProvider {
        async fn references(&self, _doc: &DocumentInfo) -> Result<Vec<RawReference>> {
            Ok(vec![reference("a.md", "#page=4&offset=10,20")])
        }
    }

    #[tokio::test]
    async fn rebuild_with_pulls_from_provider() {
        let index = BacklinkIndex::new(doc());
        index.rebuild_with(&FakeProvider).await.unwrap();
        assert_eq!(index.cache_count(), 1);
        assert_eq!(index.caches()[0].kind(), DestinationKind::Xyz);
    }
}
