use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use super::{EntryWriter, Sink};
use crate::entry::Entry;
use crate::error::{Error, Result};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Extracts into a directory on the local filesystem.
pub struct FolderSink {
    directory: PathBuf,
}

impl FolderSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resolve an entry path inside the destination, refusing anything that
    /// would land outside of it.
    fn entry_path(&self, entry: &Entry) -> Result<PathBuf> {
        let mut path = self.directory.clone();
        let mut depth = 0;
        for component in Path::new(&entry.canonical_path).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::UnsafePath(entry.canonical_path.clone()));
                }
            }
        }
        if depth == 0 {
            return Err(Error::UnsafePath(entry.canonical_path.clone()));
        }
        Ok(path)
    }

    /// [`FolderSink::entry_path`], also refusing to go through a symlink
    /// already on disk below the destination. Only a symlink entry may find
    /// one at its own path, which it replaces.
    async fn checked_path(&self, entry: &Entry, link_leaf: bool) -> Result<PathBuf> {
        let path = self.entry_path(entry)?;
        let relative = path
            .strip_prefix(&self.directory)
            .map_err(|_| Error::UnsafePath(entry.canonical_path.clone()))?;

        let mut current = self.directory.clone();
        let mut parts = relative.components().peekable();
        while let Some(part) = parts.next() {
            current.push(part);
            let is_leaf = parts.peek().is_none();
            match fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() && !(is_leaf && link_leaf) => {
                    return Err(Error::UnsafePath(entry.canonical_path.clone()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(path)
    }

    async fn open_file(&self, entry: &Entry) -> Result<(PathBuf, File)> {
        let path = self.checked_path(entry, false).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        make_owner_writable(&path).await?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        Ok((path, file))
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// A file left read-only by an earlier extraction gets owner write back.
#[cfg(unix)]
async fn make_owner_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o200 == 0 => {
            set_mode(path, (meta.permissions().mode() & 0o7777) | 0o200).await
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
async fn make_owner_writable(_path: &Path) -> Result<()> {
    Ok(())
}

fn or_default(mode: u32, default: u32) -> u32 {
    if mode & 0o777 == 0 { default } else { mode & 0o7777 }
}

#[async_trait]
impl Sink for FolderSink {
    async fn preallocate(&mut self, entry: &Entry) -> Result<()> {
        let (path, file) = self.open_file(entry).await?;
        file.set_len(entry.uncompressed_size).await?;
        drop(file);
        // keep the owner able to write until the entry is done
        set_mode(&path, or_default(entry.mode, DEFAULT_FILE_MODE) | 0o200).await
    }

    async fn mkdir(&mut self, entry: &Entry) -> Result<()> {
        let path = self.checked_path(entry, false).await?;
        fs::create_dir_all(&path).await?;
        set_mode(&path, or_default(entry.mode, DEFAULT_DIR_MODE) | 0o700).await
    }

    async fn symlink(&mut self, entry: &Entry, target: &str) -> Result<()> {
        let path = self.checked_path(entry, true).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::symlink_metadata(&path).await {
            Ok(_) => fs::remove_file(&path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        #[cfg(unix)]
        fs::symlink(target, &path).await?;

        #[cfg(not(unix))]
        fs::write(&path, target.as_bytes()).await?;

        Ok(())
    }

    async fn get_writer(&mut self, entry: &Entry) -> Result<Box<dyn EntryWriter>> {
        let (path, mut file) = self.open_file(entry).await?;
        let len = file.metadata().await?.len();
        if len < entry.write_offset {
            return Err(Error::corrupt(format!(
                "{}: existing file too small ({} bytes), can't resume from offset {}",
                entry.canonical_path, len, entry.write_offset
            )));
        }
        file.seek(SeekFrom::Start(entry.write_offset)).await?;
        Ok(Box::new(FolderWriter {
            file: BufWriter::new(file),
            path,
            mode: or_default(entry.mode, DEFAULT_FILE_MODE),
        }))
    }
}

struct FolderWriter {
    file: BufWriter<File>,
    path: PathBuf,
    /// Final permissions, applied once the content is complete
    mode: u32,
}

#[async_trait]
impl EntryWriter for FolderWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_data().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        set_mode(&self.path, self.mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn entry(kind: EntryKind, path: &str, size: u64) -> Entry {
        Entry {
            kind,
            canonical_path: path.to_string(),
            compressed_size: size,
            uncompressed_size: size,
            mode: 0o640,
            write_offset: 0,
            crc32: 0,
            write_crc32: 0,
        }
    }

    #[tokio::test]
    async fn writer_resumes_at_write_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FolderSink::new(dir.path());
        let mut file = entry(EntryKind::File, "nested/data.bin", 8);

        sink.preallocate(&file).await.unwrap();
        let on_disk = dir.path().join("nested/data.bin");
        assert_eq!(std::fs::metadata(&on_disk).unwrap().len(), 8);

        let mut writer = sink.get_writer(&file).await.unwrap();
        writer.write_all(b"abcd").await.unwrap();
        writer.sync().await.unwrap();
        drop(writer);
        file.advance(b"abcd");

        let mut writer = sink.get_writer(&file).await.unwrap();
        writer.write_all(b"efgh").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&on_disk).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn refuses_to_resume_past_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FolderSink::new(dir.path());
        let mut file = entry(EntryKind::File, "short.bin", 8);
        file.write_offset = 4;
        let err = sink.get_writer(&file).await.err().unwrap();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FolderSink::new(dir.path().join("out"));
        for path in ["../evil", "/etc/passwd", "a/../../b", ""] {
            let err = sink
                .preallocate(&entry(EntryKind::File, path, 1))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnsafePath(_)), "{path}: {err}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn creates_dirs_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FolderSink::new(dir.path());
        sink.mkdir(&entry(EntryKind::Dir, "b/", 0)).await.unwrap();
        sink.symlink(&entry(EntryKind::Symlink, "b/link", 0), "../a.txt")
            .await
            .unwrap();
        // replacing an existing link is fine
        sink.symlink(&entry(EntryKind::Symlink, "b/link", 0), "../c.bin")
            .await
            .unwrap();

        assert!(dir.path().join("b").is_dir());
        let target = std::fs::read_link(dir.path().join("b/link")).unwrap();
        assert_eq!(target, Path::new("../c.bin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refuses_to_write_through_links() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        let mut sink = FolderSink::new(dir.path().join("out"));

        let target = outside.to_str().unwrap();
        sink.symlink(&entry(EntryKind::Symlink, "up", 0), target)
            .await
            .unwrap();
        for path in ["up", "up/x.txt", "up/deeper/x.txt"] {
            let err = sink
                .preallocate(&entry(EntryKind::File, path, 4))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnsafePath(_)), "{path}: {err}");
        }
        let err = sink
            .mkdir(&entry(EntryKind::Dir, "up/sub/", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsafePath(_)));
        assert_eq!(std::fs::read_dir(&outside).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reopens_files_left_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut sink = FolderSink::new(dir.path());
        let mut file = entry(EntryKind::File, "ro.txt", 2);
        file.mode = 0o444;

        sink.preallocate(&file).await.unwrap();
        let mut writer = sink.get_writer(&file).await.unwrap();
        writer.write_all(b"ok").await.unwrap();
        writer.close().await.unwrap();
        let on_disk = dir.path().join("ro.txt");
        let mode = std::fs::metadata(&on_disk).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        // a second, fresh extraction over the first
        sink.preallocate(&file).await.unwrap();
        let mut writer = sink.get_writer(&file).await.unwrap();
        writer.write_all(b"OK").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"OK");
    }
}
