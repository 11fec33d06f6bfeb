use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::progress::TransferId;
use crate::utils::{get_filename_from_url, sanitize_filename};

/// One archive of the dataset and where it ends up.
#[derive(Clone, Debug)]
pub struct DatasetFile {
    pub id: TransferId,
    pub url: String,
    /// Expected digest, `md5:<hex>` or `sha256:<hex>`.
    pub checksum: Option<String>,
    /// Path relative to the destination root whose presence means the archive
    /// was already downloaded and unpacked.
    pub extracted_marker: Option<PathBuf>,
}

impl DatasetFile {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: TransferId::new(id),
            url: url.to_string(),
            checksum: None,
            extracted_marker: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.extracted_marker = Some(marker.into());
        self
    }

    /// Where the downloaded archive is stored under `root`. Always the same path
    /// for the same file, so later runs find the partial state.
    pub fn archive_path(&self, root: &Path) -> PathBuf {
        let name = get_filename_from_url(&self.url)
            .map(|n| sanitize_filename(&n))
            .unwrap_or_else(|| format!("{}.zip", sanitize_filename(self.id.as_str())));
        root.join(name)
    }

    pub fn is_extracted(&self, root: &Path) -> bool {
        self.extracted_marker
            .as_ref()
            .map(|m| root.join(m).exists())
            .unwrap_or(false)
    }
}

pub const TRAIN: &str = "train2017";
pub const VAL: &str = "val2017";
pub const ANNOTATIONS: &str = "annotations";

/// The COCO 2017 archives with their published MD5 digests.
pub fn coco2017() -> Vec<DatasetFile> {
    vec![
        DatasetFile::new(
            ANNOTATIONS,
            "http://images.cocodataset.org/annotations/annotations_trainval2017.zip",
        )
        .with_checksum("md5:113a836d90195ee1f884e704da6304df")
        .with_marker("annotations/instances_val2017.json"),
        DatasetFile::new(TRAIN, "http://images.cocodataset.org/zips/train2017.zip")
            .with_checksum("md5:cced6f7f71b7629d05e9705b32467183")
            .with_marker("train2017"),
        DatasetFile::new(VAL, "http://images.cocodataset.org/zips/val2017.zip")
            .with_checksum("md5:442b8da7639aecaf257c1dceb8ba8c80")
            .with_marker("val2017"),
    ]
}

/// Annotations are always fetched; `--train-only` / `--val-only` drop the other image set.
pub fn select(train_only: bool, val_only: bool) -> Result<Vec<DatasetFile>> {
    if train_only && val_only {
        bail!("--train-only and --val-only are mutually exclusive");
    }
    Ok(coco2017()
        .into_iter()
        .filter(|f| match f.id.as_str() {
            TRAIN => !val_only,
            VAL => !train_only,
            _ => true,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_named_after_url() {
        let files = coco2017();
        let root = Path::new("/data");
        assert_eq!(
            files[0].archive_path(root),
            Path::new("/data/annotations_trainval2017.zip")
        );
        assert_eq!(files[1].archive_path(root), Path::new("/data/train2017.zip"));
    }

    #[test]
    fn every_archive_has_a_valid_checksum() {
        for file in coco2017() {
            let checksum = file.checksum.as_deref().unwrap();
            assert!(
                matches!(crate::verify::Checksum::parse(checksum), Some(crate::verify::Checksum::Md5(_))),
                "{}",
                file.id
            );
        }
    }

    #[test]
    fn url_without_file_name_falls_back_to_id() {
        let file = DatasetFile::new("extra set", "http://example.com/");
        let root = Path::new("/data");
        assert_eq!(file.archive_path(root), Path::new("/data/extra_set.zip"));
        assert_eq!(file.archive_path(root), file.archive_path(root));
    }

    #[test]
    fn selection_keeps_annotations() {
        let ids: Vec<String> = select(false, true)
            .unwrap()
            .iter()
            .map(|f| f.id.to_string())
            .collect();
        assert_eq!(ids, vec![ANNOTATIONS, VAL]);
        assert_eq!(select(false, false).unwrap().len(), 3);
        assert!(select(true, true).is_err());
    }

    #[test]
    fn marker_detects_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let val = &coco2017()[2];
        assert!(!val.is_extracted(dir.path()));
        std::fs::create_dir(dir.path().join("val2017")).unwrap();
        assert!(val.is_extracted(dir.path()));
    }
}
