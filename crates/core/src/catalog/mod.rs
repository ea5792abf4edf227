use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{LoggerError, Result};

/// File extension of clips picked up by directory scans.
const CLIP_EXTENSION: &str = "wav";

/// Opaque handle to the bytes of a clip. The playback engine decides how to
/// open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipSource {
    pub path: PathBuf,
}

impl ClipSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// One playable audio clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub source: ClipSource,
    pub display_name: String,
}

impl Clip {
    pub fn new(
        id: impl Into<String>,
        source: ClipSource,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            display_name: display_name.into(),
        }
    }
}

/// Ordered, immutable list of clips. Indices stay valid for the lifetime of
/// the catalog.
#[derive(Debug, Clone, Default)]
pub struct ClipCatalog {
    clips: Vec<Clip>,
}

impl ClipCatalog {
    pub fn new(clips: Vec<Clip>) -> Self {
        Self { clips }
    }

    /// Scans `root/<group>` for each group in order. Clips within a group are
    /// sorted by file name and named `<group>_<stem>`.
    pub fn from_groups<S: AsRef<str>>(root: &Path, groups: &[S]) -> Result<Self> {
        let mut clips = Vec::new();

        for group in groups {
            let group = group.as_ref();
            let dir = root.join(group);
            if !dir.is_dir() {
                tracing::warn!(?dir, "clip group directory missing, skipping");
                continue;
            }

            let mut files = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_clip = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case(CLIP_EXTENSION))
                    .unwrap_or(false);
                if path.is_file() && is_clip {
                    files.push(path);
                }
            }
            files.sort();

            for path in files {
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| LoggerError::msg(format!("non UTF-8 clip name {path:?}")))?
                    .to_string();
                let stem = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(&file_name)
                    .to_string();

                let clip = Clip::new(
                    format!("{group}/{file_name}"),
                    ClipSource::new(path),
                    format!("{group}_{stem}"),
                );
                tracing::debug!(clip = %clip.display_name, "clip added");
                clips.push(clip);
            }
        }

        Ok(Self::new(clips))
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Clip> {
        self.clips.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Clip> {
        self.clips.iter()
    }
}
