
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read list {path:?}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No search path was given")]
    NoPaths,
}

/// Where instance catalogs come from
#[derive(Debug, Clone)]
pub enum CollectorConfig {
    /// a file with one path per line
    List(PathBuf),
    /// every file below `paths` whose name matches `glob`
    Glob { paths: Vec<PathBuf>, glob: String },
}

#[derive(Debug)]
/// All possible collector variants
/// These should be initialized from `Collector::load`
pub enum Collector {
    List { paths: Vec<PathBuf> },
    Glob { paths: Vec<PathBuf> },
    Grouped { collectors: Vec<Collector> },
}

impl Collector {
    pub fn load(config: &CollectorConfig) -> Result<Self, CollectorError> {
        match config {
            CollectorConfig::List(list) => {
                let content = fs::read_to_string(list).map_err(|source| CollectorError::List {
                    path: list.clone(),
                    source,
                })?;
                // relative entries are relative to the list itself
                let base = list.parent().unwrap_or_else(|| Path::new(""));

                let paths = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(|line| base.join(line))
                    .collect_vec();

                debug!(list = ?list, count = paths.len(), "Read catalog list");

                Ok(Self::List { paths })
            }
            CollectorConfig::Glob { paths, glob } => {
                let matcher = GlobBuilder::new(glob.as_str()).build()?.compile_matcher();
                let (first, others) = paths.split_first().ok_or(CollectorError::NoPaths)?;
                let mut builder = WalkBuilder::new(first);

                debug!("Filtering with glob: {glob:?}");
                builder.standard_filters(false);
                // add other paths
                others.iter().for_each(|path| {
                    builder.add(path);
                });

                let paths = builder
                    .build()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("Failed to search for instance catalogs: {e}");
                            None
                        }
                    })
                    .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
                    .filter(|entry| matcher.is_match(entry.file_name()))
                    .map(DirEntry::into_path)
                    .sorted()
                    .collect_vec();

                Ok(Self::Glob { paths })
            }
        }
    }

    /// join multiple collectors into a single grouped collector
    /// this will if possible reuse existing grouped collectors
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Grouped { mut collectors }, Self::Grouped { collectors: others }) => {
                collectors.extend(others);
                Self::Grouped { collectors }
            }
            (Self::Grouped { mut collectors }, other) => {
                collectors.push(other);
                Self::Grouped { collectors }
            }
            (first, Self::Grouped { mut collectors }) => {
                collectors.insert(0, first);
                Self::Grouped { collectors }
            }
            (first, second) => Self::Grouped {
                collectors: vec![first, second],
            },
        }
    }
}

impl Iterator for Collector {
    type Item = PathBuf;

    /// return accurate size for underlying iterator
    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::List { paths } | Self::Glob { paths } => (paths.len(), Some(paths.len())),
            Self::Grouped { collectors } => {
                let len = collectors
                    .iter()
                    .fold(0, |acc, collector| acc + collector.size_hint().0);

                (len, Some(len))
            }
        }
    }

    /// return the next catalog in collection order
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::List { paths } | Self::Glob { paths } => {
                if paths.is_empty() {
                    None
                } else {
                    Some(paths.remove(0))
                }
            }
            Self::Grouped { collectors } => collectors.iter_mut().find_map(|collector| collector.next()),
        }
    }
}
