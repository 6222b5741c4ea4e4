// backuptool/src/backup/archive.rs
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::backup::compress::copy_in_chunks;
use crate::errors::{BackupError, IoResultExt, Result};

/// Archive folder holding the database dump inside a bundle.
pub const BUNDLE_DB_DIR: &str = "db";
/// Archive folder holding the media archive inside a bundle.
pub const BUNDLE_STORAGE_DIR: &str = "storage";

/// Turns a relative path into a `/`-separated archive entry name.
fn entry_name(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(BackupError::Config(format!(
                    "refusing to archive path outside the source tree: {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

fn file_options(method: CompressionMethod, size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(method)
        .large_file(size >= u64::from(u32::MAX))
}

fn append_file(
    zip: &mut ZipWriter<BufWriter<File>>,
    source: &Path,
    name: String,
    method: CompressionMethod,
) -> Result<()> {
    let size = fs::metadata(source).at(source)?.len();
    let mut input = File::open(source).at(source)?;
    zip.start_file(name, file_options(method, size))?;
    copy_in_chunks(&mut input, zip).at(source)?;
    Ok(())
}

/// Creates a zip of everything under `source_dir`.
///
/// Entry names are relative to `source_dir` and always use `/`. Empty
/// directories get an explicit entry so they survive extraction. Symlinks
/// are skipped.
pub fn zip_directory(source_dir: &Path, dest_zip: &Path) -> Result<u64> {
    if !source_dir.is_dir() {
        return Err(BackupError::Config(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    info!(source = %source_dir.display(), dest = %dest_zip.display(), "creating zip archive");

    let output = File::create(dest_zip).at(dest_zip)?;
    let mut zip = ZipWriter::new(BufWriter::new(output));
    let mut files = 0u64;

    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source_dir).to_path_buf();
            let source = e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("filesystem loop while walking directory")
            });
            BackupError::io(path, source)
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).map_err(|_| {
            BackupError::Config(format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            ))
        })?;
        let name = entry_name(relative)?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let is_empty = fs::read_dir(path).at(path)?.next().is_none();
            if is_empty {
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
                zip.add_directory(format!("{}/", name), options)?;
            }
        } else if file_type.is_file() {
            append_file(&mut zip, path, name, CompressionMethod::Deflated)?;
            files += 1;
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }

    let writer = zip.finish()?;
    writer
        .into_inner()
        .map_err(|e| BackupError::io(dest_zip, e.into_error()))?
        .sync_all()
        .at(dest_zip)?;

    info!(dest = %dest_zip.display(), files, "zip archive created");
    Ok(files)
}

/// Writes a bundle: `db/<dump>` plus `storage/<media zip>`. Members are
/// already compressed, so they are stored as-is.
pub fn build_bundle(dest_zip: &Path, db_dump: &Path, media_zip: &Path) -> Result<()> {
    let output = File::create(dest_zip).at(dest_zip)?;
    let mut zip = ZipWriter::new(BufWriter::new(output));

    for (folder, member) in [(BUNDLE_DB_DIR, db_dump), (BUNDLE_STORAGE_DIR, media_zip)] {
        let file_name = member.file_name().ok_or_else(|| {
            BackupError::Config(format!("bundle member has no file name: {}", member.display()))
        })?;
        let name = format!("{}/{}", folder, file_name.to_string_lossy());
        append_file(&mut zip, member, name, CompressionMethod::Stored)?;
    }

    let writer = zip.finish()?;
    writer
        .into_inner()
        .map_err(|e| BackupError::io(dest_zip, e.into_error()))?
        .sync_all()
        .at(dest_zip)?;
    Ok(())
}

/// Extracts a whole archive into `dest_dir`.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).at(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(dest_dir).at(dest_dir)?;
    archive.extract(dest_dir)?;
    Ok(())
}

/// Copies the first file stored under `folder/` into `dest_dir`, keeping its
/// base name. Returns `None` when the archive has no such entry.
pub fn extract_member(
    archive_path: &Path,
    folder: &str,
    dest_dir: &Path,
) -> Result<Option<PathBuf>> {
    let file = File::open(archive_path).at(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let prefix = format!("{}/", folder.trim_end_matches('/'));

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || !entry.name().starts_with(&prefix) {
            continue;
        }
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        else {
            continue;
        };

        let target = dest_dir.join(file_name);
        let mut output = File::create(&target).at(&target)?;
        copy_in_chunks(&mut entry, &mut output).at(&target)?;
        output.sync_all().at(&target)?;
        return Ok(Some(target));
    }
    Ok(None)
}

/// Entry names in archive order.
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>> {
    let file = File::open(archive_path).at(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        names.push(archive.by_index(index)?.name().to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_media_tree(root: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(root.join("uploads/2026/10"))?;
        fs::create_dir_all(root.join("exports/empty"))?;
        fs::create_dir_all(root.join("avatars"))?;
        fs::write(root.join("uploads/2026/10/inspection report.pdf"), b"%PDF-1.7 fake")?;
        fs::write(root.join("avatars/worker-17.png"), vec![0x89u8; 70_000])?;
        fs::write(root.join("readme.txt"), b"media store")?;
        Ok(())
    }

    fn snapshot(root: &Path) -> anyhow::Result<Vec<(String, Option<Vec<u8>>)>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let rel = entry_name(entry.path().strip_prefix(root)?)?;
            if entry.file_type().is_dir() {
                out.push((rel, None));
            } else {
                out.push((rel, Some(fs::read(entry.path())?)));
            }
        }
        Ok(out)
    }

    #[test]
    fn test_zip_directory_round_trip_keeps_empty_dirs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let media = dir.path().join("media");
        build_media_tree(&media)?;

        let zip_path = dir.path().join("storage.zip");
        assert_eq!(zip_directory(&media, &zip_path)?, 3);

        let restored = dir.path().join("restored");
        extract_zip(&zip_path, &restored)?;

        assert_eq!(snapshot(&media)?, snapshot(&restored)?);
        assert!(restored.join("exports/empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_entry_names_use_forward_slashes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let media = dir.path().join("media");
        build_media_tree(&media)?;
        let zip_path = dir.path().join("storage.zip");
        zip_directory(&media, &zip_path)?;

        let names = list_entries(&zip_path)?;
        assert!(names.contains(&"uploads/2026/10/inspection report.pdf".to_string()));
        assert!(names.contains(&"exports/empty/".to_string()));
        assert!(names.iter().all(|n| !n.contains('\\') && !n.starts_with('/')));
        Ok(())
    }

    #[test]
    fn test_zip_empty_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let media = dir.path().join("media");
        fs::create_dir_all(&media)?;
        let zip_path = dir.path().join("storage.zip");
        assert_eq!(zip_directory(&media, &zip_path)?, 0);
        assert!(list_entries(&zip_path)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_zip_directory_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let result = zip_directory(&dir.path().join("nope"), &dir.path().join("x.zip"));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_bundle_layout_and_member_extraction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("20261019_120000_sqlite_app.sqlite.gz");
        let media = dir.path().join("storage_20261019_120000.zip");
        fs::write(&dump, b"\x1f\x8bfake gzip")?;
        fs::write(&media, b"PK\x03\x04fake zip")?;

        let bundle = dir.path().join("full_backup_20261019_120000.zip");
        build_bundle(&bundle, &dump, &media)?;

        assert_eq!(
            list_entries(&bundle)?,
            vec![
                "db/20261019_120000_sqlite_app.sqlite.gz".to_string(),
                "storage/storage_20261019_120000.zip".to_string(),
            ]
        );

        let out = dir.path().join("out");
        fs::create_dir_all(&out)?;
        let extracted = extract_member(&bundle, BUNDLE_DB_DIR, &out)?.expect("db member");
        assert_eq!(extracted, out.join("20261019_120000_sqlite_app.sqlite.gz"));
        assert_eq!(fs::read(&extracted)?, b"\x1f\x8bfake gzip");

        assert!(extract_member(&bundle, "missing", &out)?.is_none());
        Ok(())
    }
}
