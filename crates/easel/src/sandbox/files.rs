//! Capabilities over the workspace files area.
//!
//! Paths are relative to the area root. Absolute paths and `..` segments are
//! rejected before anything touches the filesystem; the normalized path is
//! then checked against the access policy.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::CapabilityError;
use crate::policy::{Operation, PolicyHandler};

/// Extensions that are refused as text and pointed at the `python` tool.
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "ods"];
const MAX_GLOB_RESULTS: usize = 1000;
const MAX_SEARCH_MATCHES: usize = 200;
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

/// A confined path: where it lives on disk and how the policy sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaPath {
    /// Host path under the area root.
    pub host: PathBuf,
    /// Normalized path relative to the root, `/`-separated, no leading slash.
    pub relative: String,
}

impl AreaPath {
    /// The path as the policy sees it, rooted at `/`.
    pub fn policy_path(&self) -> String {
        format!("/{}", self.relative)
    }
}

/// The workspace files directory plus its access policy.
#[derive(Clone)]
pub struct FileArea {
    root: PathBuf,
    policy: Arc<dyn PolicyHandler>,
}

impl std::fmt::Debug for FileArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileArea").field("root", &self.root).finish_non_exhaustive()
    }
}

impl FileArea {
    /// Confine capability calls to `root` under `policy`.
    pub fn new(root: impl Into<PathBuf>, policy: Arc<dyn PolicyHandler>) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    /// Area root on the host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Confine `path` to the area. An empty path or `.` is the root itself.
    pub fn resolve(&self, path: &str) -> Result<AreaPath, CapabilityError> {
        if path.contains('\0') {
            return Err(CapabilityError::InvalidPath(format!("{path:?} contains a NUL byte")));
        }
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(CapabilityError::InvalidPath(format!("absolute paths are not allowed: {path}")));
        }

        let mut parts = Vec::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(CapabilityError::InvalidPath(format!("'..' is not allowed: {path}")));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(CapabilityError::InvalidPath(format!("absolute paths are not allowed: {path}")));
                }
            }
        }

        let relative = parts.join("/");
        let host = parts.iter().fold(self.root.clone(), |acc, part| acc.join(part));

        // A symlink inside the area must not lead out of it.
        if let (Ok(real), Ok(root)) = (host.canonicalize(), self.root.canonicalize())
            && !real.starts_with(&root)
        {
            return Err(CapabilityError::InvalidPath(format!("{path} resolves outside the workspace")));
        }

        Ok(AreaPath { host, relative })
    }

    /// Confine `path` and check `operation` against the policy.
    pub fn authorize(
        &self,
        path: &str,
        operation: Operation,
        capability: &str,
    ) -> Result<AreaPath, CapabilityError> {
        let resolved = self.resolve(path)?;
        let decision = self
            .policy
            .check_access(&resolved.policy_path(), operation, capability);
        if let Some(reason) = decision.denial_reason() {
            tracing::debug!(path = %resolved.policy_path(), capability, reason, "policy denied");
            return Err(CapabilityError::Policy(reason.to_string()));
        }
        Ok(resolved)
    }

    /// Read a file as text for `read("file:...")`.
    ///
    /// PDFs are text-extracted; spreadsheets yield a refusal message.
    pub async fn read_text(&self, path: &str, max_bytes: usize) -> Result<String, CapabilityError> {
        let target = self.authorize(path, Operation::Read, "read")?;
        let extension = target
            .host
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if SPREADSHEET_EXTENSIONS.contains(&extension.as_str()) {
            return Ok(format!(
                "{} is a spreadsheet (.{extension}) and cannot be read as text here. \
                 Use the `python` tool to load it, e.g. with pandas.read_excel(\"{}\").",
                target.relative, target.relative
            ));
        }

        if !tokio::fs::try_exists(&target.host).await? {
            return Err(CapabilityError::NotFound(format!("file {}", target.relative)));
        }

        let text = if extension == "pdf" {
            let host = target.host.clone();
            tokio::task::spawn_blocking(move || pdf_extract::extract_text(&host))
                .await
                .map_err(|e| CapabilityError::Io(std::io::Error::other(e)))?
                .map_err(|e| CapabilityError::InvalidArgument(format!("could not extract text from {}: {e}", target.relative)))?
        } else {
            let bytes = tokio::fs::read(&target.host).await?;
            String::from_utf8_lossy(&bytes).into_owned()
        };

        Ok(truncate(text, max_bytes))
    }

    /// Write a string verbatim, anything else as pretty JSON.
    pub async fn write(&self, path: &str, data: &Value, capability: &str) -> Result<String, CapabilityError> {
        let target = self.authorize(path, Operation::Write, capability)?;
        if target.relative.is_empty() {
            return Err(CapabilityError::InvalidPath("a file name is required".to_string()));
        }

        let bytes = match data {
            Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec_pretty(other)
                .map_err(|e| CapabilityError::InvalidArgument(e.to_string()))?,
        };
        if let Some(parent) = target.host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target.host, bytes).await?;
        Ok(target.relative)
    }

    /// Save `data` as `downloads/<filename>`.
    pub async fn download(&self, data: &Value, filename: &str) -> Result<String, CapabilityError> {
        let single = Path::new(filename).components().count() == 1
            && matches!(Path::new(filename).components().next(), Some(Component::Normal(_)));
        if !single {
            return Err(CapabilityError::InvalidPath(format!(
                "download filename must be a plain file name: {filename}"
            )));
        }
        self.write(&format!("downloads/{filename}"), data, "download").await
    }

    /// Paths of files matching a glob pattern, relative to the root.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, CapabilityError> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid glob {pattern:?}: {e}")))?;
        self.authorize("", Operation::List, "glob")?;

        let mut matches = self
            .walk(move |relative| matcher.matches(relative))
            .await?;
        matches.truncate(MAX_GLOB_RESULTS);
        Ok(matches)
    }

    /// Lines matching `pattern`, optionally limited to files matching a glob.
    pub async fn search(
        &self,
        pattern: &str,
        file_glob: Option<&str>,
    ) -> Result<Vec<SearchMatch>, CapabilityError> {
        let regex = regex::Regex::new(pattern)
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid regex {pattern:?}: {e}")))?;
        let matcher = file_glob
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid glob: {e}")))?;
        self.authorize("", Operation::List, "search")?;

        let files = self
            .walk(move |relative| matcher.as_ref().is_none_or(|m| m.matches(relative)))
            .await?;

        let mut results = Vec::new();
        for relative in files {
            let target = self.resolve(&relative)?;
            let decision = self
                .policy
                .check_access(&target.policy_path(), Operation::Read, "search");
            if !decision.is_allowed() {
                continue;
            }
            let metadata = tokio::fs::metadata(&target.host).await?;
            if metadata.len() > MAX_SEARCH_FILE_BYTES {
                continue;
            }
            let bytes = tokio::fs::read(&target.host).await?;
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            for (index, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(SearchMatch {
                        path: relative.clone(),
                        line: index + 1,
                        text: line.to_string(),
                    });
                    if results.len() >= MAX_SEARCH_MATCHES {
                        return Ok(results);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Replace the single occurrence of `old` with `new`.
    pub async fn edit(&self, path: &str, old: &str, new: &str) -> Result<String, CapabilityError> {
        if old.is_empty() {
            return Err(CapabilityError::InvalidArgument("text to replace must not be empty".to_string()));
        }
        let target = self.authorize(path, Operation::Write, "edit")?;
        let content = match tokio::fs::read_to_string(&target.host).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapabilityError::NotFound(format!("file {}", target.relative)));
            }
            Err(e) => return Err(e.into()),
        };

        match content.matches(old).count() {
            0 => Err(CapabilityError::NotFound(format!(
                "text to replace was not found in {}",
                target.relative
            ))),
            1 => {
                tokio::fs::write(&target.host, content.replacen(old, new, 1)).await?;
                Ok(target.relative)
            }
            n => Err(CapabilityError::InvalidArgument(format!(
                "text to replace occurs {n} times in {}; include more context",
                target.relative
            ))),
        }
    }

    /// Entries of one directory.
    pub async fn list(&self, dir: &str) -> Result<Vec<FileEntry>, CapabilityError> {
        let target = self.authorize(dir, Operation::List, "listFiles")?;
        let mut entries = match tokio::fs::read_dir(&target.host).await {
            Ok(entries) => entries,
            // An untouched files area has no directory yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && target.relative.is_empty() => {
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapabilityError::NotFound(format!("directory {}", target.relative)));
            }
            Err(e) => return Err(e.into()),
        };

        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if target.relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{name}", target.relative)
            };
            listing.push(FileEntry {
                name,
                path,
                kind: if metadata.is_dir() { EntryKind::Directory } else { EntryKind::File },
                size: metadata.len(),
            });
        }
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    /// Delete one file.
    pub async fn delete(&self, path: &str) -> Result<String, CapabilityError> {
        let target = self.authorize(path, Operation::Delete, "deleteFile")?;
        match tokio::fs::metadata(&target.host).await {
            Ok(metadata) if metadata.is_dir() => Err(CapabilityError::InvalidPath(format!(
                "{} is a directory",
                target.relative
            ))),
            Ok(_) => {
                tokio::fs::remove_file(&target.host).await?;
                Ok(target.relative)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CapabilityError::NotFound(format!("file {}", target.relative)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Relative paths of every file under the root accepted by `keep`.
    async fn walk<F>(&self, keep: F) -> Result<Vec<String>, CapabilityError>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if !root.is_dir() {
                return Vec::new();
            }
            let mut found: Vec<String> = ignore::WalkBuilder::new(&root)
                .hidden(false)
                .git_ignore(false)
                .git_global(false)
                .git_exclude(false)
                .parents(false)
                .follow_links(false)
                .build()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(&root).ok()?;
                    let relative = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keep(&relative).then_some(relative)
                })
                .collect();
            found.sort();
            found
        })
        .await
        .map_err(|e| CapabilityError::Io(std::io::Error::other(e)))
    }
}

/// One line matched by `search`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    /// File path relative to the root.
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    /// The matching line.
    pub text: String,
}

/// Whether a listing entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One entry returned by `listFiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// File name.
    pub name: String,
    /// Path relative to the root.
    pub path: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
}

fn truncate(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let total = text.len();
    text.truncate(cut);
    text.push_str(&format!("\n... [truncated: showing {cut} of {total} bytes] ..."));
    text
}
