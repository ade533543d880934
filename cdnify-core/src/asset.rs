use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::discover::DiscoveredFile;
use crate::stage::{write_staged, StageContext, StageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetContent {
    Text(String),
    /// Non UTF-8 inputs (images, fonts) are staged verbatim.
    Binary(Vec<u8>),
}

/// One input file on its way to the staging directory.
#[derive(Debug, Clone)]
pub struct AssetFile {
    pub relative_path: PathBuf,
    pub source_path: PathBuf,
    pub content: AssetContent,
    pub staged: bool,
}

impl AssetFile {
    pub fn read(file: &DiscoveredFile) -> io::Result<Self> {
        let bytes = fs::read(&file.path)?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => AssetContent::Text(text),
            Err(e) => AssetContent::Binary(e.into_bytes()),
        };
        Ok(Self {
            relative_path: file.relative_path.clone(),
            source_path: file.path.clone(),
            content,
            staged: false,
        })
    }

    /// Normalizes then rewrites text content in place.
    pub fn transform(&mut self, ctx: &StageContext<'_>) {
        if let AssetContent::Text(text) = &self.content {
            self.content = AssetContent::Text(ctx.transform(text));
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.content {
            AssetContent::Text(text) => text.as_bytes(),
            AssetContent::Binary(bytes) => bytes,
        }
    }

    pub fn stage(&mut self, staging_dir: &Path) -> Result<PathBuf, StageError> {
        let written = write_staged(staging_dir, &self.relative_path, self.bytes())?;
        self.staged = true;
        Ok(written)
    }

    /// Overwrites the original source file with the rewritten text.
    pub fn write_back(&self) -> Result<(), StageError> {
        if let AssetContent::Text(text) = &self.content {
            fs::write(&self.source_path, text).map_err(|source| StageError::Write {
                path: self.source_path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
