//! Line-oriented scope extraction for source code
//!
//! A deliberately language-loose adapter: it recognizes scope headers
//! (functions, types, classes) and import statements across the common
//! brace and indent languages with compiled patterns. Scope ids are
//! stable (`relative/path.ext::name`), so re-parsing an unchanged file
//! produces an identical delta and MERGE makes the ingest a no-op.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::delta::{keys, EdgeSpec, GraphDelta, NodeSpec, ParseStats};
use crate::error::Result;
use crate::parser::{GlobFilter, ParseRequest, SourceParser};

/// Scope headers: `fn name`, `function name`, `class Name`, `struct Name`,
/// `def name`, `interface Name`, `impl Name`, `trait Name`, `enum Name`.
static SCOPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(fn|function|class|struct|def|interface|impl|trait|enum)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("scope pattern is valid")
});

/// Import statements: `use a::b`, `import x from 'y'`, `import "z"`,
/// `require('w')`, `from m import n`.
static IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:use\s+([A-Za-z_][A-Za-z0-9_]*)|import\s+.*?from\s+['"]([^'"]+)['"]|import\s+['"]([^'"]+)['"]|from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import|.*?require\(\s*['"]([^'"]+)['"]\s*\))"#,
    )
    .expect("import pattern is valid")
});

/// Lines a scope body may span before it is cut off in the stored content
const MAX_SCOPE_LINES: usize = 60;
/// Files larger than this are indexed without content
const MAX_CONTENT_BYTES: u64 = 512 * 1024;

/// Built-in source-code parser
pub struct ScopeParser;

impl ScopeParser {
    /// Create the parser
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn parse_file(
        root: &Path,
        path: &Path,
        delta: &mut DeltaBuilder,
    ) -> std::io::Result<()> {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        let metadata = std::fs::metadata(path)?;
        let content = if metadata.len() > MAX_CONTENT_BYTES {
            trace!(path = %rel_str, "File too large, indexing without content");
            String::new()
        } else {
            match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(_) => {
                    // Binary or non-UTF-8; index the file node only.
                    delta.stats.skipped += 1;
                    String::new()
                }
            }
        };

        delta.add_dir_chain(&rel_str);

        let name = relative
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into());
        let extension = relative
            .extension()
            .map_or_else(String::new, |e| e.to_string_lossy().into());
        let line_count = content.lines().count();

        delta.add_node(
            keys::file(&rel_str),
            "File",
            [
                ("path".to_string(), json!(rel_str)),
                ("name".to_string(), json!(name)),
                ("extension".to_string(), json!(extension)),
                ("content".to_string(), json!(content)),
                ("line_count".to_string(), json!(line_count)),
                ("size".to_string(), json!(metadata.len())),
            ]
            .into_iter()
            .collect(),
        );

        if let Some(parent) = parent_rel(&rel_str) {
            delta.add_edge("CONTAINS_FILE", keys::dir(&parent), keys::file(&rel_str));
        }
        let project_key = keys::project(&delta.root_str);
        delta.add_edge("HAS_FILE", project_key, keys::file(&rel_str));

        Self::extract_scopes(&rel_str, &content, delta);
        Self::extract_imports(&rel_str, &content, delta);
        delta.files_processed += 1;
        Ok(())
    }

    fn extract_scopes(rel_path: &str, content: &str, delta: &mut DeltaBuilder) {
        let lines: Vec<&str> = content.lines().collect();

        for (index, line) in lines.iter().enumerate() {
            let Some(captures) = SCOPE_PATTERN.captures(line) else {
                continue;
            };
            let kind = &captures[1];
            let scope_name = &captures[2];
            let uuid = format!("{rel_path}::{scope_name}");

            let end = (index + MAX_SCOPE_LINES).min(lines.len());
            let body: String = lines[index..end].join("\n");

            delta.add_node(
                keys::scope(&uuid),
                "Scope",
                [
                    ("uuid".to_string(), json!(uuid)),
                    ("name".to_string(), json!(scope_name)),
                    ("kind".to_string(), json!(kind)),
                    ("path".to_string(), json!(rel_path)),
                    ("start_line".to_string(), json!(index + 1)),
                    ("content".to_string(), json!(body)),
                    ("parent".to_string(), json!(rel_path)),
                ]
                .into_iter()
                .collect(),
            );
            delta.add_edge("CONTAINS_SCOPE", keys::file(rel_path), keys::scope(&uuid));
            delta.stats.scopes += 1;
        }
    }

    fn extract_imports(rel_path: &str, content: &str, delta: &mut DeltaBuilder) {
        for line in content.lines() {
            let Some(captures) = IMPORT_PATTERN.captures(line) else {
                continue;
            };
            let Some(target) = (1..=5).find_map(|i| captures.get(i)) else {
                continue;
            };
            // Relative imports are wiring, not external dependencies.
            let name = target.as_str();
            if name.starts_with('.') || name.starts_with("crate") || name.starts_with("self") {
                continue;
            }
            let lib = name
                .split(['/', ':', '.'])
                .next()
                .unwrap_or(name)
                .to_string();
            if lib.is_empty() {
                continue;
            }

            delta.add_node(
                keys::lib(&lib),
                "ExternalLibrary",
                [("name".to_string(), json!(lib))].into_iter().collect(),
            );
            delta.add_edge("IMPORTS", keys::file(rel_path), keys::lib(&lib));
            delta.stats.libraries += 1;
        }
    }
}

impl Default for ScopeParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceParser for ScopeParser {
    fn name(&self) -> &str {
        "scope"
    }

    async fn parse(&self, request: &ParseRequest) -> Result<GraphDelta> {
        let filter = GlobFilter::new(&request.include, &request.exclude)?;
        let root = request.root.clone();
        let root_str = root.to_string_lossy().to_string();
        let changed = request.changed.clone();

        // Parsing is pure filesystem + CPU; keep it off the async runtime.
        let delta = tokio::task::spawn_blocking(move || {
            let mut builder = DeltaBuilder::new(root_str.clone());
            builder.add_node(
                keys::project(&root_str),
                "Project",
                [
                    ("path".to_string(), json!(root_str)),
                    (
                        "name".to_string(),
                        json!(root
                            .file_name()
                            .map_or_else(|| root_str.clone(), |n| n.to_string_lossy().into())),
                    ),
                ]
                .into_iter()
                .collect(),
            );

            let files: Vec<PathBuf> = match &changed {
                Some(set) => set.iter().cloned().collect(),
                None => WalkDir::new(&root)
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .filter(|e| e.file_type().is_file())
                    .map(walkdir::DirEntry::into_path)
                    .collect(),
            };

            for path in files {
                let relative = path.strip_prefix(&root).unwrap_or(&path);
                if !filter.matches(relative) {
                    continue;
                }
                if let Err(e) = ScopeParser::parse_file(&root, &path, &mut builder) {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    builder.stats.skipped += 1;
                }
            }
            builder.finish()
        })
        .await
        .map_err(|e| crate::error::IngestError::Parse(format!("parse task panicked: {e}")))?;

        debug!(
            files = delta.files_processed,
            scopes = delta.stats.scopes,
            "Parse complete"
        );
        Ok(delta)
    }
}

fn parent_rel(rel_path: &str) -> Option<String> {
    let idx = rel_path.rfind('/')?;
    Some(rel_path[..idx].to_string())
}

/// Accumulates nodes/edges with key-level deduplication
struct DeltaBuilder {
    root_str: String,
    nodes: BTreeMap<String, NodeSpec>,
    edges: BTreeMap<(String, String, String), EdgeSpec>,
    files_processed: usize,
    stats: ParseStats,
}

impl DeltaBuilder {
    fn new(root_str: String) -> Self {
        Self {
            root_str,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            files_processed: 0,
            stats: ParseStats::default(),
        }
    }

    fn add_node(&mut self, key: String, label: &str, properties: Map<String, Value>) {
        self.nodes.entry(key.clone()).or_insert_with(|| NodeSpec {
            key,
            label: label.to_string(),
            properties,
        });
    }

    fn add_edge(&mut self, edge_type: &str, from: String, to: String) {
        let id = (edge_type.to_string(), from.clone(), to.clone());
        self.edges.entry(id).or_insert_with(|| EdgeSpec {
            edge_type: edge_type.to_string(),
            from,
            to,
            properties: Map::new(),
        });
    }

    /// Emit Directory nodes and HAS_CHILD edges for every ancestor of a file
    fn add_dir_chain(&mut self, rel_path: &str) {
        let mut current = parent_rel(rel_path);
        let mut child: Option<String> = None;

        while let Some(dir) = current {
            let dir_name = dir.rsplit('/').next().unwrap_or(&dir).to_string();
            let is_new = !self.nodes.contains_key(&keys::dir(&dir));
            self.add_node(
                keys::dir(&dir),
                "Directory",
                [
                    ("path".to_string(), json!(dir)),
                    ("name".to_string(), json!(dir_name)),
                ]
                .into_iter()
                .collect(),
            );
            if is_new {
                self.stats.directories += 1;
            }
            if let Some(child_dir) = child {
                self.add_edge("HAS_CHILD", keys::dir(&dir), keys::dir(&child_dir));
            }
            child = Some(dir.clone());
            current = parent_rel(&dir);
        }
    }

    fn finish(self) -> GraphDelta {
        GraphDelta {
            nodes: self.nodes.into_values().collect(),
            edges: self.edges.into_values().collect(),
            files_processed: self.files_processed,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn parse_fixture(files: &[(&str, &str)]) -> GraphDelta {
        let tmp = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = tmp.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }

        ScopeParser::new()
            .parse(&ParseRequest {
                root: tmp.path().to_path_buf(),
                include: vec!["**/*.rs".to_string(), "**/*.ts".to_string()],
                exclude: vec!["**/target/**".to_string()],
                changed: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_extracts_scopes_and_files() {
        let delta = parse_fixture(&[(
            "src/lib.rs",
            "pub fn alpha() {}\n\nstruct Beta {\n    x: u32,\n}\n",
        )])
        .await;

        assert_eq!(delta.files_processed, 1);
        let scopes: Vec<_> = delta
            .nodes
            .iter()
            .filter(|n| n.label == "Scope")
            .collect();
        assert_eq!(scopes.len(), 2);
        assert!(scopes
            .iter()
            .any(|s| s.properties["uuid"] == json!("src/lib.rs::alpha")));
        assert!(delta
            .edges
            .iter()
            .any(|e| e.edge_type == "CONTAINS_SCOPE"));
    }

    #[tokio::test]
    async fn test_directory_chain_and_edges() {
        let delta = parse_fixture(&[("src/deep/mod.rs", "fn inner() {}\n")]).await;

        let dirs: HashSet<_> = delta
            .nodes
            .iter()
            .filter(|n| n.label == "Directory")
            .map(|n| n.properties["path"].as_str().unwrap().to_string())
            .collect();
        assert!(dirs.contains("src"));
        assert!(dirs.contains("src/deep"));
        assert!(delta
            .edges
            .iter()
            .any(|e| e.edge_type == "HAS_CHILD" && e.from == "dir:src"));
    }

    #[tokio::test]
    async fn test_imports_become_libraries() {
        let delta = parse_fixture(&[(
            "src/main.rs",
            "use tokio::sync::Mutex;\nuse crate::internal;\nfn main() {}\n",
        )])
        .await;

        let libs: Vec<_> = delta
            .nodes
            .iter()
            .filter(|n| n.label == "ExternalLibrary")
            .collect();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].properties["name"], json!("tokio"));
    }

    #[tokio::test]
    async fn test_excluded_files_skipped() {
        let delta = parse_fixture(&[
            ("src/a.rs", "fn a() {}\n"),
            ("target/gen.rs", "fn generated() {}\n"),
        ])
        .await;
        assert_eq!(delta.files_processed, 1);
    }

    #[tokio::test]
    async fn test_changed_set_restricts_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        for rel in ["a.rs", "b.rs"] {
            std::fs::write(tmp.path().join(rel), "fn x() {}\n").unwrap();
        }

        let mut changed = HashSet::new();
        changed.insert(tmp.path().join("a.rs"));

        let delta = ScopeParser::new()
            .parse(&ParseRequest {
                root: tmp.path().to_path_buf(),
                include: vec!["**/*.rs".to_string()],
                exclude: vec![],
                changed: Some(changed),
            })
            .await
            .unwrap();
        assert_eq!(delta.files_processed, 1);
    }

    #[tokio::test]
    async fn test_reparse_is_identical() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn stable() {}\n").unwrap();
        let request = ParseRequest {
            root: tmp.path().to_path_buf(),
            include: vec!["**/*.rs".to_string()],
            exclude: vec![],
            changed: None,
        };

        let first = ScopeParser::new().parse(&request).await.unwrap();
        let second = ScopeParser::new().parse(&request).await.unwrap();
        let first_keys: Vec<_> = first.nodes.iter().map(|n| &n.key).collect();
        let second_keys: Vec<_> = second.nodes.iter().map(|n| &n.key).collect();
        assert_eq!(first_keys, second_keys);
    }
}
