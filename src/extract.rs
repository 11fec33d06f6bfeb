use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Resolves an archive entry name under `dest`, or `None` if it would land outside it.
fn resolve_entry(dest: &Path, name: &str) -> Option<PathBuf> {
    let name = name.replace('\\', "/");
    let mut relative = PathBuf::new();
    let mut depth = 0usize;
    for component in Path::new(&name).components() {
        match component {
            Component::Normal(part) => {
                relative.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1)?;
                relative.pop();
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(dest.join(relative))
}

fn extract_blocking(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| EngineError::extraction(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(io::BufReader::new(file)).map_err(|e| EngineError::extraction(archive_path, e))?;

    // Refuse the whole archive before anything is written.
    if let Some(bad) = archive.file_names().find(|name| resolve_entry(dest, name).is_none()) {
        return Err(EngineError::extraction(
            archive_path,
            format!("entry {:?} escapes the destination directory", bad),
        ));
    }

    fs::create_dir_all(dest).map_err(|e| EngineError::disk(dest, e))?;
    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EngineError::extraction(archive_path, e))?;
        let Some(target) = resolve_entry(dest, entry.name()) else {
            return Err(EngineError::extraction(
                archive_path,
                format!("entry {:?} escapes the destination directory", entry.name()),
            ));
        };
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| EngineError::disk(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::disk(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| EngineError::disk(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                EngineError::extraction(archive_path, format!("{}: {}", entry.name(), e))
            }
            _ => EngineError::disk(&target, e),
        })?;
        written += 1;
    }
    debug!(?archive_path, files = written, "unpacked");
    Ok(written)
}

/// Unpacks `archive` into `dest` and deletes it. On failure the archive stays
/// in place so extraction can be retried without downloading again.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let archive_path = archive.to_path_buf();
    let dest_path = dest.to_path_buf();
    let files = tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &dest_path)).await??;
    tokio::fs::remove_file(archive)
        .await
        .map_err(|e| EngineError::disk(archive, e))?;
    info!(?archive, ?dest, files, "extracted");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn resolve_entry_rejects_escapes() {
        let dest = Path::new("/data/coco");
        assert_eq!(
            resolve_entry(dest, "val2017/0001.jpg"),
            Some(PathBuf::from("/data/coco/val2017/0001.jpg"))
        );
        assert_eq!(
            resolve_entry(dest, "a/../b.txt"),
            Some(PathBuf::from("/data/coco/b.txt"))
        );
        assert_eq!(resolve_entry(dest, "../evil.txt"), None);
        assert_eq!(resolve_entry(dest, "a/../../evil.txt"), None);
        assert_eq!(resolve_entry(dest, "/etc/passwd"), None);
        assert_eq!(resolve_entry(dest, "..\\evil.txt"), None);
    }

    #[tokio::test]
    async fn extracts_tree_and_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("annotations.zip");
        build_zip(
            &archive,
            &[
                ("annotations/", b""),
                ("annotations/instances_val2017.json", b"{}"),
                ("annotations/captions_val2017.json", b"[]"),
            ],
        );
        let dest = dir.path().join("coco");
        let files = extract_archive(&archive, &dest).await.unwrap();
        assert_eq!(files, 2);
        assert_eq!(
            std::fs::read(dest.join("annotations/instances_val2017.json")).unwrap(),
            b"{}"
        );
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn traversal_entry_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        build_zip(&archive, &[("ok.txt", b"fine"), ("../evil.txt", b"gotcha")]);
        let dest = dir.path().join("out");
        let err = extract_archive(&archive, &dest).await.unwrap_err();
        assert!(matches!(err, EngineError::Extraction { .. }));
        assert!(!dir.path().join("evil.txt").exists());
        assert!(!dest.join("ok.txt").exists());
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"definitely not a zip file").unwrap();
        let err = extract_archive(&archive, &dir.path().join("out")).await.unwrap_err();
        assert!(matches!(err, EngineError::Extraction { .. }));
        assert!(archive.exists());
    }
}
