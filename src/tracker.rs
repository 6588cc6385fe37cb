//! Before/after content snapshots of a session folder.
//!
//! A [`FileChangeTracker`] hashes every non-excluded regular file under its
//! root before an agent invocation and again afterwards; the difference is
//! reported as session-relative paths in a [`FileChanges`].

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Names and `*.ext` patterns never tracked.
pub const DEFAULT_EXCLUDED_PATTERNS: &[&str] = &[
    "__pycache__",
    ".git",
    ".env",
    ".DS_Store",
    "Thumbs.db",
    "*.pyc",
    "*.pyo",
    "*.swp",
    ".vscode",
    ".idea",
    "node_modules",
    ".gitignore",
    ".gitmodules",
    ".hg",
    ".svn",
    ".bzr",
];

/// Files hashed concurrently per snapshot.
const HASH_CONCURRENCY: usize = 8;

/// Absolute path -> hex content hash.
pub type Snapshot = HashMap<PathBuf, String>;

/// Which paths a snapshot ignores.
///
/// A relative path is excluded when any component is hidden (starts with `.`)
/// or equals an excluded name, or when the file's extension is excluded.
#[derive(Debug, Clone, Default)]
pub struct ExcludePolicy {
    names: HashSet<String>,
    extensions: HashSet<String>,
}

impl ExcludePolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for pattern in patterns {
            policy.add_pattern(pattern.as_ref());
        }
        policy
    }

    /// Also exclude an exact file or directory name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.names.insert(name.to_string());
        self
    }

    fn add_pattern(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if let Some(ext) = pattern.strip_prefix("*.") {
            if !ext.is_empty() {
                self.extensions.insert(ext.to_ascii_lowercase());
            }
        } else if !pattern.is_empty() {
            self.names.insert(pattern.to_string());
        }
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        for component in relative.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if name.starts_with('.') || self.names.contains(name.as_ref()) {
                    return true;
                }
            }
        }
        relative
            .extension()
            .map(|ext| {
                self.extensions
                    .contains(&ext.to_string_lossy().to_ascii_lowercase())
            })
            .unwrap_or(false)
    }
}

/// Session-relative paths changed between two snapshots.
///
/// `created` and `modified` are disjoint and `all` is exactly their union.
/// All three lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub all: Vec<String>,
}

impl FileChanges {
    /// Build from created/modified sets. A path in both counts as created.
    pub fn new<C, M>(created: C, modified: M) -> Self
    where
        C: IntoIterator<Item = String>,
        M: IntoIterator<Item = String>,
    {
        let created: BTreeSet<String> = created.into_iter().collect();
        let modified: BTreeSet<String> = modified
            .into_iter()
            .filter(|p| !created.contains(p))
            .collect();
        let all = created.union(&modified).cloned().collect();
        Self {
            created: created.into_iter().collect(),
            modified: modified.into_iter().collect(),
            all,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }
}

pub struct FileChangeTracker {
    root: PathBuf,
    policy: ExcludePolicy,
    before: Option<Snapshot>,
}

impl FileChangeTracker {
    pub fn new(root: impl Into<PathBuf>, policy: ExcludePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            before: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn take_before_snapshot(&mut self) {
        let snapshot = snapshot_dir(&self.root, &self.policy).await;
        log::debug!(
            "Before snapshot of {}: {} files",
            self.root.display(),
            snapshot.len()
        );
        self.before = Some(snapshot);
    }

    /// Diff against the before-snapshot, which is consumed.
    pub async fn take_after_snapshot(&mut self) -> FileChanges {
        self.take_after_snapshot_with_reported(&[]).await
    }

    /// Diff against the before-snapshot and fold in session-relative paths the
    /// agent reported producing. A reported path the diff did not catch is
    /// `modified` if it existed before the invocation, otherwise `created`.
    pub async fn take_after_snapshot_with_reported(&mut self, reported: &[String]) -> FileChanges {
        let before = self.before.take().unwrap_or_default();
        let after = snapshot_dir(&self.root, &self.policy).await;

        let mut created = BTreeSet::new();
        let mut modified = BTreeSet::new();
        for (path, hash) in &after {
            let Some(relative) = self.relative(path) else {
                continue;
            };
            match before.get(path) {
                None => {
                    created.insert(relative);
                }
                Some(previous) if previous != hash => {
                    modified.insert(relative);
                }
                Some(_) => {}
            }
        }

        for relative in reported {
            if created.contains(relative) || modified.contains(relative) {
                continue;
            }
            if self.policy.is_excluded(Path::new(relative)) {
                continue;
            }
            if before.contains_key(&self.root.join(relative)) {
                modified.insert(relative.clone());
            } else {
                created.insert(relative.clone());
            }
        }

        let changes = FileChanges::new(created, modified);
        log::debug!(
            "After snapshot of {}: {} created, {} modified",
            self.root.display(),
            changes.created.len(),
            changes.modified.len()
        );
        changes
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root).ok().map(relative_string)
    }
}

/// Render a relative path with `/` separators.
pub fn relative_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Hash every tracked regular file under `root`. A missing root is empty.
pub async fn snapshot_dir(root: &Path, policy: &ExcludePolicy) -> Snapshot {
    let walk_root = root.to_path_buf();
    let walk_policy = policy.clone();
    let files = match tokio::task::spawn_blocking(move || collect_files(&walk_root, &walk_policy))
        .await
    {
        Ok(files) => files,
        Err(e) => {
            log::warn!("Directory walk of {} failed: {}", root.display(), e);
            return Snapshot::new();
        }
    };

    stream::iter(files)
        .map(|path| async move {
            let hash_path = path.clone();
            match tokio::task::spawn_blocking(move || hash_file(&hash_path)).await {
                Ok(Ok(hash)) => Some((path, hash)),
                Ok(Err(e)) => {
                    log::warn!("Skipping unreadable file {}: {}", path.display(), e);
                    None
                }
                Err(e) => {
                    log::warn!("Hashing {} failed: {}", path.display(), e);
                    None
                }
            }
        })
        .buffer_unordered(HASH_CONCURRENCY)
        .filter_map(|entry| async move { entry })
        .collect()
        .await
}

fn collect_files(root: &Path, policy: &ExcludePolicy) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    // Prune excluded directories instead of descending into them.
    let entries = walker.filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(root)
            .map(|rel| rel.as_os_str().is_empty() || !policy.is_excluded(rel))
            .unwrap_or(false)
    });
    for entry in entries {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => log::warn!("Skipping unreadable entry under {}: {}", root.display(), e),
        }
    }
    files
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn default_policy() -> ExcludePolicy {
        ExcludePolicy::new(DEFAULT_EXCLUDED_PATTERNS)
    }

    // ── ExcludePolicy ────────────────────────────────────────────────────

    #[test]
    fn excludes_names_extensions_and_hidden_components() {
        let policy = default_policy();
        assert!(policy.is_excluded(Path::new(".git/config")));
        assert!(policy.is_excluded(Path::new("__pycache__/x.pyc")));
        assert!(policy.is_excluded(Path::new("pkg/mod.PYC")));
        assert!(policy.is_excluded(Path::new("src/.hidden/file.rs")));
        assert!(policy.is_excluded(Path::new("web/node_modules/a/index.js")));
        assert!(!policy.is_excluded(Path::new("src/main.py")));
        assert!(!policy.is_excluded(Path::new("environment.txt")));
    }

    #[test]
    fn with_name_adds_exact_name() {
        let policy = ExcludePolicy::new(Vec::<String>::new()).with_name("proc.md");
        assert!(policy.is_excluded(Path::new("proc.md")));
        assert!(!policy.is_excluded(Path::new("notes.md")));
    }

    // ── FileChanges ──────────────────────────────────────────────────────

    #[test]
    fn file_changes_all_is_disjoint_union() {
        let changes = FileChanges::new(
            vec!["b.py".to_string(), "a.py".to_string()],
            vec!["a.py".to_string(), "c.py".to_string()],
        );
        assert_eq!(changes.created, vec!["a.py", "b.py"]);
        assert_eq!(changes.modified, vec!["c.py"]);
        assert_eq!(changes.all, vec!["a.py", "b.py", "c.py"]);
    }

    // ── FileChangeTracker ────────────────────────────────────────────────

    #[tokio::test]
    async fn detects_created_and_modified_but_not_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "old").unwrap();
        fs::write(dir.path().join("c.txt"), "same").unwrap();

        let mut tracker = FileChangeTracker::new(dir.path(), default_policy());
        tracker.take_before_snapshot().await;

        fs::write(dir.path().join("a.txt"), "new").unwrap();
        fs::write(dir.path().join("b.txt"), "changed").unwrap();

        let changes = tracker.take_after_snapshot().await;
        assert_eq!(changes.created, vec!["a.txt"]);
        assert_eq!(changes.modified, vec!["b.txt"]);
        assert!(!changes.all.contains(&"c.txt".to_string()));
    }

    #[tokio::test]
    async fn excluded_files_never_appear() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileChangeTracker::new(dir.path(), default_policy());
        tracker.take_before_snapshot().await;

        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), "[core]").unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/x.pyc"), [0u8, 1, 2]).unwrap();
        fs::write(dir.path().join("app.py"), "print(1)").unwrap();

        let snapshot = snapshot_dir(dir.path(), &default_policy()).await;
        assert_eq!(snapshot.len(), 1);

        let changes = tracker.take_after_snapshot().await;
        assert_eq!(changes.all, vec!["app.py"]);
    }

    #[tokio::test]
    async fn nested_paths_are_relative_with_slashes() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileChangeTracker::new(dir.path(), default_policy());
        tracker.take_before_snapshot().await;

        fs::create_dir_all(dir.path().join("src/util")).unwrap();
        fs::write(dir.path().join("src/util/io.rs"), "fn main() {}").unwrap();

        let changes = tracker.take_after_snapshot().await;
        assert_eq!(changes.created, vec!["src/util/io.rs"]);
    }

    #[tokio::test]
    async fn before_snapshot_is_consumed_by_diff() {
        let dir = TempDir::new().unwrap();
        let mut tracker = FileChangeTracker::new(dir.path(), default_policy());
        tracker.take_before_snapshot().await;
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        assert_eq!(tracker.take_after_snapshot().await.created, vec!["a.txt"]);

        // Without a fresh before-snapshot everything present counts as new again,
        // never as a comparison against the stale one.
        assert!(tracker.before.is_none());
        let again = tracker.take_after_snapshot().await;
        assert_eq!(again.created, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn reported_files_are_merged_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("kept.txt"), "same").unwrap();

        let mut tracker = FileChangeTracker::new(dir.path(), default_policy());
        tracker.take_before_snapshot().await;
        fs::write(dir.path().join("moved.py"), "print(2)").unwrap();

        let reported = vec![
            "moved.py".to_string(),
            "kept.txt".to_string(),
            "gone.py".to_string(),
        ];
        let changes = tracker.take_after_snapshot_with_reported(&reported).await;
        assert_eq!(changes.created, vec!["gone.py", "moved.py"]);
        assert_eq!(changes.modified, vec!["kept.txt"]);
        assert_eq!(changes.all.len(), 3);
    }

    #[tokio::test]
    async fn missing_root_yields_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_dir(&dir.path().join("absent"), &default_policy()).await;
        assert!(snapshot.is_empty());
    }
}
