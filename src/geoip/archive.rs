use crate::geoip::error::ExtractError;

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(alias = "zip")]
    Zip,
    #[serde(alias = "tar.gz", alias = "tgz")]
    TarGz,
}

impl ArchiveFormat {
    /// Value of the download URL `suffix` parameter
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Join an archive entry name onto `dest`, refusing anything that is not a
/// strict descendant of `dest`.
pub fn entry_path(dest: &Path, name: &str) -> Result<PathBuf, ExtractError> {
    let traversal = || ExtractError::PathTraversal(name.to_owned());
    let mut relative = PathBuf::new();
    let mut depth = 0_usize;
    // Archives written on Windows may use backslashes
    for component in Path::new(&name.replace('\\', "/")).components() {
        match component {
            Component::Normal(part) => {
                relative.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(traversal());
                }
                relative.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    if depth == 0 {
        return Err(traversal());
    }
    Ok(dest.join(relative))
}

fn create_dir_all(path: &Path) -> Result<(), ExtractError> {
    std::fs::create_dir_all(path).map_err(|error| ExtractError::Io {
        path: path.to_owned(),
        error,
    })
}

fn write_file<R: std::io::Read>(path: &Path, reader: &mut R) -> Result<(), ExtractError> {
    let io_error = |error| ExtractError::Io {
        path: path.to_owned(),
        error,
    };
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut file = File::create(path).map_err(io_error)?;
    std::io::copy(reader, &mut file).map_err(io_error)?;
    Ok(())
}

/// Unpack every entry of `archive` into `dest`.
///
/// The first entry escaping `dest` stops extraction, nothing after it is
/// written.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive).map_err(|error| ExtractError::Io {
        path: archive.to_owned(),
        error,
    })?;
    create_dir_all(dest)?;
    match format {
        ArchiveFormat::Zip => extract_zip(BufReader::new(file), dest),
        ArchiveFormat::TarGz => extract_tar_gz(BufReader::new(file), dest),
    }
}

fn extract_zip(reader: BufReader<File>, dest: &Path) -> Result<(), ExtractError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let path = entry_path(dest, entry.name())?;
        if entry.is_dir() {
            create_dir_all(&path)?;
        } else {
            write_file(&path, &mut entry)?;
        }
    }
    Ok(())
}

#[cfg(feature = "tar-gz")]
fn extract_tar_gz(reader: BufReader<File>, dest: &Path) -> Result<(), ExtractError> {
    let gz_reader = flate2::bufread::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz_reader);
    for entry in archive.entries().map_err(ExtractError::TarIo)? {
        let mut entry = entry.map_err(ExtractError::TarIo)?;
        let name = entry
            .path()
            .map_err(ExtractError::TarIo)?
            .to_string_lossy()
            .into_owned();
        let path = entry_path(dest, &name)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            create_dir_all(&path)?;
        } else if entry_type.is_file() {
            write_file(&path, &mut entry)?;
        } else {
            log::debug!(r#"skipping archive entry "{name}" of type {entry_type:?}"#);
        }
    }
    Ok(())
}

#[cfg(not(feature = "tar-gz"))]
fn extract_tar_gz(_reader: BufReader<File>, _dest: &Path) -> Result<(), ExtractError> {
    Err(ExtractError::Unsupported)
}

/// Find a file by name anywhere below `root`
pub fn find_file(root: &Path, name: &str) -> Result<PathBuf, ExtractError> {
    let mut found: Option<PathBuf> = None;
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        let io_error = |error| ExtractError::Io {
            path: dir.clone(),
            error,
        };
        for entry in std::fs::read_dir(&dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let file_type = entry.file_type().map_err(io_error)?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() && entry.file_name() == name {
                if let Some(first) = found {
                    return Err(ExtractError::DuplicateFile {
                        name: name.to_owned(),
                        first,
                        second: path,
                    });
                }
                found = Some(path);
            }
        }
    }
    found.ok_or_else(|| ExtractError::MissingFile(name.to_owned()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    /// Build a zip archive in memory, `None` content marks a directory
    pub(crate) fn zip_bytes(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            match content {
                Some(content) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(content).unwrap();
                }
                None => writer.add_directory(*name, options).unwrap(),
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn entry_path_accepts_descendants() {
        let dest = Path::new("/tmp/dest");
        assert_eq!(
            entry_path(dest, "a/b.csv").unwrap(),
            PathBuf::from("/tmp/dest/a/b.csv")
        );
        assert_eq!(
            entry_path(dest, "./a/../b.csv").unwrap(),
            PathBuf::from("/tmp/dest/b.csv")
        );
        assert_eq!(
            entry_path(dest, "dir/").unwrap(),
            PathBuf::from("/tmp/dest/dir")
        );
    }

    #[test]
    fn entry_path_rejects_escapes() {
        let dest = Path::new("/tmp/dest");
        for name in [
            "../evil.csv",
            "a/../../evil.csv",
            "/etc/passwd",
            "..\\evil.csv",
            "",
            ".",
            "a/..",
        ] {
            assert!(
                matches!(entry_path(dest, name), Err(ExtractError::PathTraversal(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn extract_zip_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = write_archive(
            tmp.path(),
            "db.zip",
            &zip_bytes(&[
                ("GeoLite2-Country-CSV_20240101/", None),
                ("GeoLite2-Country-CSV_20240101/a.csv", Some(b"1,2,3\n")),
                ("nested/deeper/b.csv", Some(b"")),
            ]),
        );
        let dest = tmp.path().join("out");
        extract(&archive, ArchiveFormat::Zip, &dest).unwrap();
        assert_eq!(
            std::fs::read(dest.join("GeoLite2-Country-CSV_20240101/a.csv")).unwrap(),
            b"1,2,3\n"
        );
        assert!(dest.join("nested/deeper/b.csv").is_file());
    }

    #[test]
    fn zip_traversal_aborts_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = write_archive(
            tmp.path(),
            "db.zip",
            &zip_bytes(&[
                ("first.csv", Some(b"ok")),
                ("../evil.csv", Some(b"evil")),
                ("last.csv", Some(b"never")),
            ]),
        );
        let dest = tmp.path().join("out");
        let error = extract(&archive, ArchiveFormat::Zip, &dest).unwrap_err();
        assert!(matches!(error, ExtractError::PathTraversal(name) if name == "../evil.csv"));
        assert!(dest.join("first.csv").is_file());
        assert!(!tmp.path().join("evil.csv").exists());
        assert!(!dest.join("last.csv").exists());
    }

    #[test]
    fn corrupted_zip() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = write_archive(tmp.path(), "db.zip", b"definitely not a zip archive");
        let error = extract(&archive, ArchiveFormat::Zip, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(error, ExtractError::Zip(_)));
    }

    #[cfg(feature = "tar-gz")]
    pub(crate) fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_old();
            // Raw name bytes, set_path() would refuse ".." components
            header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[cfg(feature = "tar-gz")]
    #[test]
    fn extract_tar_gz_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = write_archive(
            tmp.path(),
            "db.tar.gz",
            &tar_gz_bytes(&[("dir/a.csv", b"a"), ("b.csv", b"b")]),
        );
        let dest = tmp.path().join("out");
        extract(&archive, ArchiveFormat::TarGz, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("dir/a.csv")).unwrap(), b"a");
        assert_eq!(std::fs::read(dest.join("b.csv")).unwrap(), b"b");
    }

    #[cfg(feature = "tar-gz")]
    #[test]
    fn tar_gz_traversal_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = write_archive(
            tmp.path(),
            "db.tar.gz",
            &tar_gz_bytes(&[("../evil.csv", b"evil"), ("b.csv", b"b")]),
        );
        let dest = tmp.path().join("out");
        let error = extract(&archive, ArchiveFormat::TarGz, &dest).unwrap_err();
        assert!(matches!(error, ExtractError::PathTraversal(_)));
        assert!(!tmp.path().join("evil.csv").exists());
        assert!(!dest.join("b.csv").exists());
    }

    #[test]
    fn find_file_in_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("GeoLite2-Country-CSV_20240101");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.csv"), b"").unwrap();
        assert_eq!(find_file(tmp.path(), "a.csv").unwrap(), nested.join("a.csv"));
        assert!(matches!(
            find_file(tmp.path(), "b.csv"),
            Err(ExtractError::MissingFile(_))
        ));
        std::fs::write(tmp.path().join("a.csv"), b"").unwrap();
        assert!(matches!(
            find_file(tmp.path(), "a.csv"),
            Err(ExtractError::DuplicateFile { .. })
        ));
    }
}
