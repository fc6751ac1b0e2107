//! Reader for `docker save` style image archives.
//!
//! The archive is unpacked into a private temporary directory that lives as
//! long as the [`ImageArchive`] value. Its `manifest.json` names the config
//! file and the ordered layer files of each saved image.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{ArchiveImage, is_gzip};

const INDEX_FILE: &str = "manifest.json";
const VCS_DIR: &str = ".git";

/// An extracted image archive.
#[derive(Debug)]
pub struct ImageArchive {
    dir: TempDir,
    config: PathBuf,
    layers: Vec<PathBuf>,
    repo_tags: Vec<String>,
}

impl ImageArchive {
    /// Extract `archive_path` and resolve the first image in its index.
    ///
    /// This does blocking file I/O; async callers should run it on a blocking
    /// thread.
    pub fn open(archive_path: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("ociclient-archive-").tempdir()?;
        debug!(
            archive = %archive_path.display(),
            target = %dir.path().display(),
            "Extracting image archive"
        );

        extract(archive_path, dir.path())?;
        let image = read_index(dir.path())?;

        let config = resolve_member(dir.path(), &image.config)?;
        let layers = image
            .layers
            .iter()
            .map(|layer| resolve_member(dir.path(), layer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dir,
            config,
            layers,
            repo_tags: image.repo_tags.unwrap_or_default(),
        })
    }

    /// Directory the archive was extracted into
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the image config file
    pub fn config(&self) -> &Path {
        &self.config
    }

    /// Paths of the layer files in index order
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Tags recorded in the archive index
    pub fn repo_tags(&self) -> &[String] {
        &self.repo_tags
    }

    /// Delete the extraction directory, reporting any failure.
    ///
    /// Dropping the archive also deletes it, silently.
    pub fn close(self) -> Result<()> {
        Ok(self.dir.close()?)
    }
}

fn extract(archive_path: &Path, target: &Path) -> Result<()> {
    let mut file = File::open(archive_path).map_err(|e| {
        Error::ArchiveFormat(format!("cannot open {}: {}", archive_path.display(), e))
    })?;

    let mut magic = Vec::with_capacity(2);
    (&mut file).take(2).read_to_end(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if is_gzip(&magic) {
        debug!("Archive is gzip compressed");
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let unreadable =
        |e: std::io::Error| Error::ArchiveFormat(format!("cannot read {}: {}", archive_path.display(), e));

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(unreadable)? {
        let mut entry = entry.map_err(unreadable)?;
        let path = entry.path().map_err(unreadable)?.into_owned();

        if path.components().any(|c| c.as_os_str() == OsStr::new(VCS_DIR)) {
            debug!(path = %path.display(), "Skipping version control entry");
            continue;
        }

        if !entry.unpack_in(target).map_err(unreadable)? {
            warn!(path = %path.display(), "Skipping archive entry outside the extraction directory");
        }
    }

    Ok(())
}

fn read_index(root: &Path) -> Result<ArchiveImage> {
    let index_path = root.join(INDEX_FILE);
    if !index_path.is_file() {
        return Err(Error::ArchiveFormat(format!("archive has no {}", INDEX_FILE)));
    }

    let index: Vec<ArchiveImage> = serde_json::from_slice(&fs::read(&index_path)?)
        .map_err(|e| Error::ArchiveFormat(format!("{} is not valid: {}", INDEX_FILE, e)))?;

    if index.len() > 1 {
        warn!(images = index.len(), "Archive contains several images, using the first");
    }

    index
        .into_iter()
        .next()
        .ok_or_else(|| Error::ArchiveFormat(format!("{} lists no images", INDEX_FILE)))
}

fn resolve_member(root: &Path, member: &str) -> Result<PathBuf> {
    let relative = Path::new(member);
    let contained = !member.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(Error::ArchiveFormat(format!(
            "index references {:?} outside the archive",
            member
        )));
    }

    let path = root.join(relative);
    if !path.is_file() {
        return Err(Error::ArchiveFormat(format!(
            "index references {:?} but the archive does not contain it",
            member
        )));
    }
    Ok(path)
}
