//! Search behavior over real directory trees.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use unifs_vfs::search::{
    Directories, FileFilter, MatchPredicate, NameMatcher, SearchDepth, SearchJob, SearchQuery,
};
use unifs_vfs::{FileNode, Locator, ProtocolRegistry, VfsConfig};

fn write(root: &Path, rel: &str, len: usize) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'x'; len]).unwrap();
}

fn names(locators: &[Locator]) -> Vec<String> {
    let mut names: Vec<String> = locators.iter().map(|l| l.name().to_string()).collect();
    names.sort();
    names
}

fn log_filter() -> FileFilter {
    FileFilter {
        name: NameMatcher::new("*.log", false, false).unwrap(),
        ..FileFilter::default()
    }
}

#[tokio::test]
async fn depth_two_stops_above_the_third_level() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    write(&root, "a/x.log", 1);
    write(&root, "b/c/y.log", 1);

    let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
    let entry = registry.resolve(&Locator::from_local_path(&root)).unwrap();
    let results = SearchJob::builder([entry])
        .matcher(log_filter())
        .browser(Directories)
        .depth(SearchDepth::Levels(2))
        .build()
        .run()
        .await;

    assert_eq!(names(&results.locators()), ["x.log"]);
}

/// Records every candidate the engine offers, matching all of them.
#[derive(Debug, Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Locator>>>);

#[async_trait]
impl MatchPredicate for Recorder {
    async fn matches(&self, node: &dyn FileNode) -> bool {
        self.0.lock().push(node.locator().clone());
        true
    }
}

#[tokio::test]
async fn matches_do_not_depend_on_thread_count() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    for dir in ["a", "b", "c", "a/d", "a/d/e", "b/f", "c/g/h/i"] {
        write(root, &format!("{dir}/data.log"), 1);
        write(root, &format!("{dir}/notes.txt"), 1);
    }

    let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
    let mut outcomes = Vec::new();
    for threads in [1, 2, 8] {
        let entry = registry.resolve(&Locator::from_local_path(root)).unwrap();
        let results = SearchJob::builder([entry])
            .matcher(log_filter())
            .depth(SearchDepth::Levels(3))
            .threads(threads)
            .build()
            .run()
            .await;
        let mut found: Vec<String> = results.locators().iter().map(|l| l.path().to_string()).collect();
        found.sort();
        outcomes.push(found);
    }

    assert_eq!(outcomes[0].len(), 5, "a, b, c, a/d and b/f are within three levels");
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn nothing_below_the_bound_is_visited() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "1/2/3/4/deep.txt", 1);

    let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
    let entry = registry.resolve(&Locator::from_local_path(root)).unwrap();
    let recorder = Recorder::default();
    SearchJob::builder([entry])
        .matcher(recorder.clone())
        .depth(SearchDepth::Levels(2))
        .threads(4)
        .build()
        .run()
        .await;

    let root_depth = Locator::from_local_path(root).segments().count();
    let seen = recorder.0.lock().clone();
    assert_eq!(names(&seen), ["1", "2"]);
    assert!(seen.iter().all(|l| l.segments().count() - root_depth <= 2));
}

#[tokio::test]
async fn size_clauses_combine() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "fifteen.bin", 15 * 1024);
    write(tmp.path(), "twenty-five.bin", 25 * 1024);

    let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
    let query = SearchQuery::from_pairs([("size", "gt,10,kB"), ("size", "lt,20,kB")]).unwrap();
    let node = registry
        .resolve(&query.to_locator(&Locator::from_local_path(tmp.path())))
        .unwrap();

    let found: Vec<Locator> = node
        .list()
        .await
        .unwrap()
        .iter()
        .map(|n| n.locator().clone())
        .collect();
    assert_eq!(names(&found), ["fifteen.bin"]);
}
