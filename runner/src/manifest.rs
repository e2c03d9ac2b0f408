
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::info;

/// A generated script and the line that submits it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub script: PathBuf,
    pub invocation: String,
}

/// Append-only collection of entries, written once on `finish`
#[derive(Debug)]
pub struct ManifestBuilder {
    path: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl ManifestBuilder {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// write all invocations, one per line, replacing the file atomically
    pub fn finish(self) -> io::Result<Manifest> {
        let mut content = String::new();
        for entry in self.entries.iter() {
            content.push_str(&entry.invocation);
            content.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut partial = self.path.clone().into_os_string();
        partial.push(".partial");
        fs::write(&partial, content)?;
        fs::rename(&partial, &self.path)?;

        info!(manifest = ?self.path, entries = self.entries.len(), "Wrote manifest");

        Ok(Manifest {
            path: self.path,
            entries: self.entries,
        })
    }
}

/// A manifest as it was written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// non-empty lines of a manifest file
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}
