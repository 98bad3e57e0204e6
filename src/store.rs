use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::DownloadTask;
use crate::error::TellusError;

/// On-disk layout under the output directory:
/// final `.nc` files at the root, `logs/` for the status file and the
/// verification log, `temp/` for in-flight downloads.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, TellusError> {
        let cwd = std::env::current_dir().map_err(|err| TellusError::Filesystem(err.to_string()))?;
        let output_root = Utf8PathBuf::from_path_buf(cwd.join("ERA5_Land_data"))
            .map_err(|_| TellusError::Filesystem("invalid output path".to_string()))?;
        Ok(Self { output_root })
    }

    pub fn at(output_root: Utf8PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.output_root.join("logs")
    }

    pub fn temp_dir(&self) -> Utf8PathBuf {
        self.output_root.join("temp")
    }

    pub fn status_path(&self) -> Utf8PathBuf {
        self.logs_dir().join("download_status.json")
    }

    pub fn verification_log_path(&self) -> Utf8PathBuf {
        self.logs_dir().join("verification_log.txt")
    }

    pub fn task_path(&self, task: &DownloadTask) -> Utf8PathBuf {
        self.output_root.join(task.output_filename())
    }

    pub fn merged_path(&self, name: &str) -> Utf8PathBuf {
        self.output_root.join(name)
    }

    pub fn ensure_layout(&self) -> Result<(), TellusError> {
        for dir in [
            self.output_root.clone(),
            self.logs_dir(),
            self.temp_dir(),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn clear_temp(&self) -> Result<usize, TellusError> {
        let temp = self.temp_dir();
        if !temp.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries = fs::read_dir(temp.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| TellusError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(|err| TellusError::Filesystem(err.to_string()))?;
            } else {
                fs::remove_file(&path).map_err(|err| TellusError::Filesystem(err.to_string()))?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), TellusError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), TellusError> {
        let parent = dest
            .parent()
            .ok_or_else(|| TellusError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("tellus-cm-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        }
        temp.persist(dest.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Move a finished download into place. Rename when source and
    /// destination share a filesystem, atomic copy otherwise.
    pub fn promote_file(source: &Utf8Path, dest: &Utf8Path) -> Result<(), TellusError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        }
        if fs::rename(source.as_std_path(), dest.as_std_path()).is_ok() {
            return Ok(());
        }
        Self::copy_file_atomic(source, dest)?;
        fs::remove_file(source.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn append_line(path: &Utf8Path, line: &str) -> Result<(), TellusError> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        writeln!(file, "{line}").map_err(|err| TellusError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
