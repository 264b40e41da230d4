use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait WriteSeek: Write + Seek + Send {}
impl<T: Write + Seek + Send> WriteSeek for T {}

/// A named resource that block and column data is read from and written to.
///
/// Each call to [`Channel::reader`] / [`Channel::writer`] opens an independent handle; callers
/// hold it for the duration of one operation and drop it afterwards, so no descriptor outlives
/// the read or write it was opened for.
pub trait Channel: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn exists(&self) -> bool;
    fn reader(&self) -> io::Result<Box<dyn ReadSeek>>;
    /// Open for writing without truncating existing content.
    fn writer(&self) -> io::Result<Box<dyn WriteSeek>>;
    /// Cut the resource down to `len` bytes.
    fn truncate(&self, len: u64) -> io::Result<()>;
}

/// [`Channel`] backed by a local file.
#[derive(Clone, Debug)]
pub struct FileChannel {
    path: PathBuf,
    name: String,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file if present.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl Channel for FileChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn reader(&self) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(io::BufReader::new(File::open(&self.path)?)))
    }

    fn writer(&self) -> io::Result<Box<dyn WriteSeek>> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn positioned_writes_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::new(dir.path().join("nested").join("block.bin"));
        assert!(!channel.exists());

        {
            let mut w = channel.writer().unwrap();
            w.write_all(b"hello world").unwrap();
            w.seek(SeekFrom::Start(6)).unwrap();
            w.write_all(b"WORLD").unwrap();
            w.flush().unwrap();
        }
        assert!(channel.exists());

        let mut r = channel.reader().unwrap();
        r.seek(SeekFrom::Start(6)).unwrap();
        let mut buf = String::new();
        r.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "WORLD");

        channel.truncate(5).unwrap();
        let mut r = channel.reader().unwrap();
        let mut buf = String::new();
        r.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");

        channel.delete().unwrap();
        channel.delete().unwrap();
        assert!(!channel.exists());
    }
}
