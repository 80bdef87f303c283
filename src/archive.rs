//! Zip assembly for finished jobs.
//!
//! One flat entry per converted file, deflated at level 9. Entries are
//! streamed from disk; nothing is buffered whole in memory.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

pub const ARCHIVE_NAME: &str = "converted_images.zip";

/// Highest deflate level.
const COMPRESSION_LEVEL: i64 = 9;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error while archiving {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `entries` (file names inside `work_dir`) to `archive_path`.
///
/// Returns the archive size in bytes. Any missing entry is an error.
pub fn write_archive(
    work_dir: &Path,
    entries: &[String],
    archive_path: &Path,
) -> Result<u64, ArchiveError> {
    let file = File::create(archive_path).map_err(io_error(archive_path))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL));

    for name in entries {
        let path = work_dir.join(name);
        let mut source = File::open(&path).map_err(io_error(&path))?;
        zip.start_file(name.as_str(), options)?;
        io::copy(&mut source, &mut zip).map_err(io_error(&path))?;
        debug!(entry = %name, "archived");
    }

    let writer = zip.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .map_err(io_error(archive_path))?;
    file.sync_all().map_err(io_error(archive_path))?;
    let size = file.metadata().map_err(io_error(archive_path))?.len();
    Ok(size)
}
