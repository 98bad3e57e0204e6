use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::TellusError;

/// Archive deliveries arrive as bare files or wrapped in a container; the
/// wire never says which, so the payload is sniffed by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Gzip,
    Plain,
}

pub fn detect_container(path: &Path) -> Result<ContainerKind, TellusError> {
    let mut file = fs::File::open(path)
        .map_err(|err| TellusError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut magic = [0u8; 4];
    let read = file
        .read(&mut magic)
        .map_err(|err| TellusError::Filesystem(err.to_string()))?;

    if read >= 4 && magic[0] == b'P' && magic[1] == b'K' && matches!(magic[2], 3 | 5 | 7) {
        return Ok(ContainerKind::Zip);
    }
    if read >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(ContainerKind::Gzip);
    }
    Ok(ContainerKind::Plain)
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), TellusError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| TellusError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(TellusError::ContainerExtraction(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
    }
    Ok(())
}

pub fn extract_gzip(gz_path: &Path, dest: &Path) -> Result<(), TellusError> {
    let file = fs::File::open(gz_path)
        .map_err(|err| TellusError::Filesystem(format!("open gzip {}: {err}", gz_path.display())))?;
    let mut decoder = GzDecoder::new(file);
    let mut outfile = fs::File::create(dest)
        .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
    io::copy(&mut decoder, &mut outfile)
        .map_err(|err| TellusError::ContainerExtraction(err.to_string()))?;
    Ok(())
}

/// The data file delivered inside a container. Exactly one `.nc` entry is
/// accepted; anything else means the delivery cannot be attributed to the
/// task that requested it.
pub fn sole_netcdf_file(dir: &Path) -> Result<PathBuf, TellusError> {
    let mut candidates = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| TellusError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| TellusError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.is_file() && path.extension().map(|ext| ext == "nc").unwrap_or(false) {
            candidates.push(path);
        }
    }
    match candidates.len() {
        0 => Err(TellusError::ContainerExtraction(
            "no .nc file found in container".to_string(),
        )),
        1 => Ok(candidates.remove(0)),
        n => Err(TellusError::ContainerExtraction(format!(
            "expected exactly one .nc file in container, found {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn detects_by_signature() {
        let dir = tempfile::tempdir().unwrap();

        let zip_path = dir.path().join("payload.bin");
        write_zip(&zip_path, &[("data.nc", b"x")]);
        assert_eq!(detect_container(&zip_path).unwrap(), ContainerKind::Zip);

        let gz_path = dir.path().join("payload.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(fs::File::create(&gz_path).unwrap(), Default::default());
        encoder.write_all(b"payload").unwrap();
        encoder.finish().unwrap();
        assert_eq!(detect_container(&gz_path).unwrap(), ContainerKind::Gzip);

        let plain_path = dir.path().join("plain.nc");
        fs::write(&plain_path, b"CDF\x01rest").unwrap();
        assert_eq!(detect_container(&plain_path).unwrap(), ContainerKind::Plain);
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("delivery.zip");
        write_zip(&zip_path, &[("data.nc", b"netcdf-bytes")]);

        let out_dir = dir.path().join("extracted");
        fs::create_dir_all(&out_dir).unwrap();
        extract_zip(&zip_path, &out_dir).unwrap();

        let inner = sole_netcdf_file(&out_dir).unwrap();
        assert_eq!(fs::read(inner).unwrap(), b"netcdf-bytes");
    }

    #[test]
    fn gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("delivery.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(fs::File::create(&gz_path).unwrap(), Default::default());
        encoder.write_all(b"netcdf-bytes").unwrap();
        encoder.finish().unwrap();

        let dest = dir.path().join("data.nc");
        extract_gzip(&gz_path, &dest).unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"netcdf-bytes");
    }

    #[test]
    fn container_must_hold_exactly_one_data_file() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert_matches!(
            sole_netcdf_file(&empty),
            Err(TellusError::ContainerExtraction(_))
        );

        let crowded = dir.path().join("crowded");
        fs::create_dir_all(&crowded).unwrap();
        fs::write(crowded.join("a.nc"), b"a").unwrap();
        fs::write(crowded.join("b.nc"), b"b").unwrap();
        assert_matches!(
            sole_netcdf_file(&crowded),
            Err(TellusError::ContainerExtraction(_))
        );

        let single = dir.path().join("single");
        fs::create_dir_all(&single).unwrap();
        fs::write(single.join("only.nc"), b"only").unwrap();
        fs::write(single.join("readme.txt"), b"notes").unwrap();
        let found = sole_netcdf_file(&single).unwrap();
        assert!(found.ends_with("only.nc"));
    }
}
