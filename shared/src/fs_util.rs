//! Filesystem primitives used around the simulation working directories.
//!
//! Removal helpers are explicit about absence: [`remove_if_exists`] reports
//! whether anything was deleted and only a missing file is tolerated, every
//! other IO failure still surfaces.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Delete a file if it is present.
///
/// Returns `Ok(true)` if the file was deleted, `Ok(false)` if it didn't exist.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create a directory and all of its parents.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Remove a directory with its contents and create it again empty.
pub fn recreate_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        log::warn!("Replacing {}, deleting its contents", path.display());
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}

/// Move a file, falling back to copy and delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

/// Copy a file into `dir`, keeping its file name. Returns the destination.
pub fn copy_into(file: &Path, dir: &Path) -> io::Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", file.display()),
        )
    })?;
    let dest = dir.join(name);
    std::fs::copy(file, &dest)?;
    Ok(dest)
}

/// Move a file into `dir`, keeping its file name. Returns the destination.
pub fn move_into(file: &Path, dir: &Path) -> io::Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", file.display()),
        )
    })?;
    let dest = dir.join(name);
    move_file(file, &dest)?;
    Ok(dest)
}

/// Gzip `path` into `path.gz`, replacing any previous archive, and delete the
/// uncompressed original. Returns the archive path.
pub fn gzip_file(path: &Path) -> io::Result<PathBuf> {
    let mut archive_name = path.as_os_str().to_owned();
    archive_name.push(".gz");
    let archive = PathBuf::from(archive_name);

    {
        let mut reader = BufReader::new(File::open(path)?);
        let writer = BufWriter::new(File::create(&archive)?);
        let mut encoder = GzEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
    }

    std::fs::remove_file(path)?;
    Ok(archive)
}

/// Files in `dir` whose names match a shell glob `pattern`, sorted.
pub fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{escaped}/{pattern}");
    let mut matches: Vec<PathBuf> = glob::glob(&full)?.filter_map(Result::ok).collect();
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_remove_if_exists_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scratch.pars");
        std::fs::write(&path, "x 1\n").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_if_exists_surfaces_other_errors() {
        let dir = TempDir::new().unwrap();
        // Removing a directory with remove_file is not a not-found condition
        assert!(remove_if_exists(dir.path()).is_err());
    }

    #[test]
    fn test_recreate_dir_empties_contents() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("old.pars"), "a 1\n").unwrap();

        recreate_dir(&work).unwrap();
        assert!(work.is_dir());
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn test_move_and_copy_into() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        ensure_dir(&out).unwrap();
        let src = dir.path().join("opd.fits");
        std::fs::write(&src, b"data").unwrap();

        let copied = copy_into(&src, &out).unwrap();
        assert!(src.exists());
        assert_eq!(std::fs::read(&copied).unwrap(), b"data");

        std::fs::remove_file(&copied).unwrap();
        let moved = move_into(&src, &out).unwrap();
        assert!(!src.exists());
        assert_eq!(moved, out.join("opd.fits"));
    }

    #[test]
    fn test_gzip_file_replaces_original() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("lsst_e_1_R22_S11_E000.fits");
        std::fs::write(&image, b"SIMPLE  =                    T").unwrap();

        let archive = gzip_file(&image).unwrap();
        assert!(!image.exists());
        assert!(archive.to_string_lossy().ends_with(".fits.gz"));

        let mut decoded = String::new();
        GzDecoder::new(File::open(&archive).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.starts_with("SIMPLE"));
    }

    #[test]
    fn test_glob_in_matches_only_pattern() {
        let dir = TempDir::new().unwrap();
        for name in ["cloudscreen_9_1.fits", "cloudscreen_9_2.fits", "cloudscreen_8_1.fits"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = glob_in(dir.path(), "cloudscreen_9_*").unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("cloudscreen_9_1.fits"));
    }
}
