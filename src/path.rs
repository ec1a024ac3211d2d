//! Locating class bytes by dotted class name.
//!
//! A `ClassPath` maps a fully-qualified name like `java.lang.String` to the
//! bytes of its class file, searching a single file, a directory tree, a
//! zip-format archive, or an ordered combination of those.

use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read};
use std::path::PathBuf;

use zip::result::ZipError;
use zip::ZipArchive;

use crate::class::class_file::ClassFile;
use crate::error::Result;

/// A source of class bytes keyed by dotted class name.
pub trait ClassPath {
    /// Returns the class bytes, or `None` when this source does not hold the
    /// named class. I/O failures other than absence are errors.
    fn find_class(&mut self, name: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Dotted name to the internal slash-separated form used on disk and in
/// archives.
fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

/// Looks up and parses a class in one step.
pub fn find_class_file(class_path: &mut dyn ClassPath, name: &str) -> Result<Option<ClassFile>> {
    match class_path.find_class(name)? {
        Some(bytes) => Ok(Some(ClassFile::read(&mut Cursor::new(bytes))?)),
        None => Ok(None),
    }
}

/// A single class file on disk, answering only to its configured name.
pub struct FileClassPath {
    name: String,
    path: PathBuf,
}

impl FileClassPath {
    pub fn new<N: Into<String>, P: Into<PathBuf>>(name: N, path: P) -> FileClassPath {
        FileClassPath {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl ClassPath for FileClassPath {
    fn find_class(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        if self.name != name || !self.path.is_file() {
            return Ok(None);
        }
        fs::read(&self.path).map(Some)
    }
}

/// A directory holding `.class` files laid out by internal name.
pub struct DirectoryClassPath {
    dir: PathBuf,
}

impl DirectoryClassPath {
    pub fn new<P: Into<PathBuf>>(dir: P) -> DirectoryClassPath {
        DirectoryClassPath { dir: dir.into() }
    }
}

impl ClassPath for DirectoryClassPath {
    fn find_class(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.dir.join(format!("{}.class", internal_name(name)));
        if !path.is_file() {
            return Ok(None);
        }
        fs::read(&path).map(Some)
    }
}

/// A jar (zip) archive holding `.class` members by internal path.
pub struct JarClassPath {
    archive: ZipArchive<BufReader<File>>,
}

impl JarClassPath {
    pub fn open<P: Into<PathBuf>>(path: P) -> io::Result<JarClassPath> {
        let file = BufReader::new(File::open(path.into())?);
        let archive = ZipArchive::new(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(JarClassPath { archive })
    }
}

impl ClassPath for JarClassPath {
    fn find_class(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match self.archive.by_name(&format!("{}.class", internal_name(name))) {
            Ok(mut member) => {
                let mut bytes = Vec::with_capacity(member.size() as usize);
                member.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(ZipError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

/// Searches multiple class paths in order; the first hit wins.
#[derive(Default)]
pub struct CompositeClassPath {
    class_paths: Vec<Box<dyn ClassPath>>,
}

impl CompositeClassPath {
    pub fn new(class_paths: Vec<Box<dyn ClassPath>>) -> CompositeClassPath {
        CompositeClassPath { class_paths }
    }

    pub fn push(&mut self, class_path: Box<dyn ClassPath>) {
        self.class_paths.push(class_path);
    }
}

impl ClassPath for CompositeClassPath {
    fn find_class(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        for class_path in &mut self.class_paths {
            if let Some(bytes) = class_path.find_class(name)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}
