//! A library for reading compiled JVM class files (format versions 45 and
//! up) and deriving higher-level views over the parsed representation: a
//! cross-validated constant pool, parsed type descriptors, an instruction
//! iterator over method code, decoded stack map frames, and a per-method
//! control-flow graph.
//!
//! This crate reads class files; it does not verify bytecode, write class
//! files, or link references across classes.

// Ensure each result error is either unwrapped or returned
#![deny(unused_must_use)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod class;
pub mod descriptor;
pub mod error;
pub mod flow;
pub mod instruction;
pub mod path;
mod read;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub use class::attribute::{
    AttributeInfo, CodeAttribute, StackMapFrame, StackMapTable, UnknownAttribute,
    VerificationType,
};
pub use class::class_file::{AccessFlags, ClassFile, FieldInfo, MethodInfo};
pub use class::constant::{Constant, ConstantPool};
pub use class::version::ClassVersion;
pub use class::PoolDisplay;
pub use descriptor::{BaseType, Descriptor, MethodDescriptor};
pub use error::{CorruptKind, Error, Result};
pub use flow::{AbsoluteStackMapFrame, BasicBlock, ControlFlowGraph};
pub use instruction::CodeIterator;
pub use path::{
    find_class_file, ClassPath, CompositeClassPath, DirectoryClassPath, FileClassPath,
    JarClassPath,
};

/// Reads and parses a class file from disk.
pub fn open_class<P: AsRef<Path>>(path: P) -> Result<ClassFile> {
    let mut file = BufReader::new(File::open(path)?);
    ClassFile::read(&mut file)
}
