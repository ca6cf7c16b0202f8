//! Zip archiving of whole directories.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::Result;
use crate::utils::fs::{ensure_parent_dir_sync, io_error};

/// Zip every file below `src_dir` into `dest_file`.
///
/// Entry names are relative to `src_dir` and use `/` separators. Empty
/// directories are recorded as directory entries. Returns the number of
/// files written.
pub fn zip_directory(src_dir: &Path, dest_file: &Path) -> Result<usize> {
    ensure_parent_dir_sync(dest_file)?;

    let file = File::create(dest_file).map_err(|e| io_error("creating archive", dest_file, e))?;
    let mut zip = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut written = 0;
    add_dir(&mut zip, src_dir, "", options, &mut written)?;
    zip.finish()?;

    debug!(
        source = %src_dir.display(),
        archive = %dest_file.display(),
        files = written,
        "Directory archived"
    );
    Ok(written)
}

fn add_dir(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
    written: &mut usize,
) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| io_error("reading directory", dir, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| io_error("reading directory", dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = format!("{prefix}{}", entry.file_name().to_string_lossy());
        let file_type = entry
            .file_type()
            .map_err(|e| io_error("reading metadata of", &path, e))?;

        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
            add_dir(zip, &path, &format!("{name}/"), options, written)?;
        } else {
            let data = std::fs::read(&path).map_err(|e| io_error("reading", &path, e))?;
            zip.start_file(name, options)?;
            zip.write_all(&data)
                .map_err(|e| io_error("writing archive entry for", &path, e))?;
            *written += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_zip_directory_relative_entries() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("site");
        std::fs::create_dir_all(src.join("css")).unwrap();
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::write(src.join("index.html"), b"<html/>").unwrap();
        std::fs::write(src.join("css/main.css"), b"body{}").unwrap();

        let dest = temp.path().join("out/site.zip");
        let count = zip_directory(&src, &dest).unwrap();
        assert_eq!(count, 2);

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&"index.html".to_string()));
        assert!(names.contains(&"css/main.css".to_string()));
        assert!(names.contains(&"empty/".to_string()));

        let mut content = String::new();
        archive
            .by_name("css/main.css")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "body{}");
    }

    #[test]
    fn test_zip_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let result = zip_directory(&temp.path().join("missing"), &temp.path().join("a.zip"));
        assert!(result.is_err());
    }
}
