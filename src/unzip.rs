use crate::error::ExtractError;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Lists the ZIP archives in `dir`, sorted by file name.
///
/// The extension check is case-insensitive, so `ABP_01.ZIP` is picked up too.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn find_archives(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut archives = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_zip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));

        if is_zip {
            archives.push(path);
        }
    }

    archives.sort();
    Ok(archives)
}

fn progress_bar(total_bytes: u64, archive: &Path) -> ProgressBar {
    let pb = ProgressBar::new(total_bytes);
    let style = ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(format!("Extracting {}", archive.display()));
    pb
}

/// Copies one ZIP entry's contents to `file_path`, replacing any existing file.
///
/// Returns the number of bytes written.
fn extract_entry<R: Read>(entry: &mut R, file_path: &Path, pb: &ProgressBar) -> std::io::Result<u64> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if file_path.exists() {
        fs::remove_file(file_path)?;
    }

    let mut output_file = File::create(file_path)?;
    let mut total_written = 0u64;
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let bytes_read = entry.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }

        output_file.write_all(&buffer[..bytes_read])?;
        total_written += bytes_read as u64;
        pb.inc(bytes_read as u64);
    }

    output_file.flush()?;
    Ok(total_written)
}

/// Extracts every file in `archive` into `destination`.
///
/// Files already present under the same name are overwritten. Directory
/// entries are created but not returned, and entries whose names would land
/// outside `destination` are skipped.
///
/// # Returns
///
/// The paths of the extracted files, in archive order.
///
/// # Errors
///
/// Returns an [`ExtractError`] if the archive cannot be opened or read, or if
/// an entry cannot be written.
///
/// # Example
///
/// ```no_run
/// use abp_process::unzip::extract_archive;
/// use std::path::Path;
///
/// let extracted = extract_archive(Path::new("AddressBasePremium_FULL_001.zip"), Path::new("unpacked"))?;
/// for path in extracted {
///     println!("{}", path.display());
/// }
/// # Ok::<(), abp_process::error::ExtractError>(())
/// ```
pub fn extract_archive(archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let entry_error = |entry: &str, source: std::io::Error| ExtractError::Entry {
        archive: archive.to_path_buf(),
        entry: entry.to_string(),
        source,
    };

    fs::create_dir_all(destination).map_err(|source| entry_error("", source))?;

    let file = File::open(archive).map_err(|source| ExtractError::Open {
        path: archive.to_path_buf(),
        source,
    })?;

    let mut zip = zip::ZipArchive::new(file).map_err(|source| ExtractError::Archive {
        path: archive.to_path_buf(),
        source,
    })?;

    let mut total_size = 0u64;
    for i in 0..zip.len() {
        if let Ok(entry) = zip.by_index(i) {
            total_size += entry.size();
        }
    }

    info!(archive = %archive.display(), entries = zip.len(), bytes = total_size, "Extracting archive");
    let pb = progress_bar(total_size, archive);

    let mut extracted = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|source| ExtractError::Archive {
            path: archive.to_path_buf(),
            source,
        })?;
        let name = entry.name().to_string();

        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(archive = %archive.display(), entry = %name, "Skipping entry with unsafe path");
            continue;
        };
        let file_path = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&file_path).map_err(|source| entry_error(&name, source))?;
            continue;
        }

        let written = extract_entry(&mut entry, &file_path, &pb).map_err(|source| entry_error(&name, source))?;
        info!(entry = %name, path = %file_path.display(), bytes = written, "Extracted entry");
        extracted.push(file_path);
    }

    pb.finish_and_clear();
    Ok(extracted)
}
