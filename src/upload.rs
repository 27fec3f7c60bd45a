//! Content sources whose bytes are only produced when they are sent.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// A lazily opened source of known size.
///
/// `size` must be answerable without opening the source. Each call to `open`
/// yields a fresh reader positioned at the start of the content.
pub trait Uploadable: Send + Sync {
    fn size(&self) -> u64;

    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    fn file_name(&self) -> Option<&str> {
        None
    }

    fn mime_type(&self) -> Option<&str> {
        None
    }
}

/// In-memory content presented as an upload.
#[derive(Debug, Clone)]
pub struct ByteArrayUploadable {
    content: Bytes,
    file_name: Option<String>,
    mime_type: Option<String>,
}

impl ByteArrayUploadable {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            file_name: None,
            mime_type: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl Uploadable for ByteArrayUploadable {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.content.clone())))
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
}

/// A file on disk. The size is taken from metadata when constructed; the file
/// itself is opened only when its content is written.
#[derive(Debug, Clone)]
pub struct FileUploadable {
    path: PathBuf,
    size: u64,
    file_name: Option<String>,
    mime_type: String,
}

impl FileUploadable {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            path,
            size,
            file_name,
            mime_type,
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Uploadable for FileUploadable {
    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn mime_type(&self) -> Option<&str> {
        Some(&self.mime_type)
    }
}
