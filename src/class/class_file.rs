//! The top-level class file structure: header, hierarchy, members.

use std::fmt::{self, Display, Formatter};
use std::io::{Read, Seek};

use crate::class::attribute::{AttributeInfo, CodeAttribute};
use crate::class::constant::ConstantPool;
use crate::class::version::ClassVersion;
use crate::class::PoolDisplay;
use crate::descriptor::{Descriptor, MethodDescriptor};
use crate::error::{CorruptKind, Result};
use crate::read::ByteRead;

const MAGIC: u32 = 0xCAFE_BABE;

bitflags! {
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const BRIDGE = 0x0040;
        const TRANSIENT = 0x0080;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

impl AccessFlags {
    fn read<R: ByteRead>(r: &mut R) -> Result<AccessFlags> {
        Ok(AccessFlags::from_bits_truncate(r.u16()?))
    }
}

/// A parsed class file.
///
/// Owns the constant pool and everything parsed from it. Names surface in
/// dotted form; the raw slash-separated spellings stay behind in the pool's
/// Utf8 entries.
#[derive(Debug, Clone)]
pub struct ClassFile {
    version: ClassVersion,
    constant_pool: ConstantPool,
    access_flags: AccessFlags,
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    /// Reads a class file front to back. No partial result survives a
    /// malformed input.
    pub fn read<R: Read + Seek>(r: &mut R) -> Result<ClassFile> {
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(CorruptKind::BadMagic(magic).into());
        }

        let version = ClassVersion::read(r)?;
        trace!("class version {}", version);

        let constant_pool = ConstantPool::read(r)?;
        trace!("read {} constant pool slots", constant_pool.count() - 1);

        let access_flags = AccessFlags::read(r)?;

        let this_class = r.u16()?;
        let name = constant_pool
            .class_name(this_class)
            .map_err(|_| CorruptKind::BadIndex(this_class))?
            .to_owned();
        trace!("this class: {}", name);

        let super_class = r.u16()?;
        let super_name = if super_class == 0 {
            if name != "java.lang.Object" {
                return Err(CorruptKind::InvalidSuperclass.into());
            }
            None
        } else {
            Some(
                constant_pool
                    .class_name(super_class)
                    .map_err(|_| CorruptKind::BadIndex(super_class))?
                    .to_owned(),
            )
        };

        let interfaces_count = r.u16()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            let index = r.u16()?;
            interfaces.push(
                constant_pool
                    .class_name(index)
                    .map_err(|_| CorruptKind::BadIndex(index))?
                    .to_owned(),
            );
        }

        let fields_count = r.u16()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            fields.push(FieldInfo::read(r, &constant_pool)?);
        }
        trace!("read {} field(s)", fields.len());

        let methods_count = r.u16()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            methods.push(MethodInfo::read(r, &constant_pool)?);
        }
        trace!("read {} method(s)", methods.len());

        let attributes = AttributeInfo::read_list(r, &constant_pool)?;
        trace!("read {} class attribute(s)", attributes.len());

        Ok(ClassFile {
            version,
            constant_pool,
            access_flags,
            name,
            super_name,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn version(&self) -> ClassVersion {
        self.version
    }

    pub fn minor_version(&self) -> u16 {
        self.version.minor()
    }

    pub fn major_version(&self) -> u16 {
        self.version.major()
    }

    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Dotted fully-qualified name, e.g. `java.lang.String`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted superclass name; absent only for `java.lang.Object`.
    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    /// Finds a field by name and raw descriptor string.
    pub fn find_field(&self, name: &str, raw_type: &str) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .find(|field| field.name() == name && field.raw_type() == raw_type)
    }

    /// Finds a method by name and raw descriptor string.
    pub fn find_method(&self, name: &str, raw_type: &str) -> Option<&MethodInfo> {
        self.methods
            .iter()
            .find(|method| method.name() == name && method.raw_type() == raw_type)
    }
}

impl Display for ClassFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Minor version: {}", self.version.minor())?;
        writeln!(f, "Major version: {}", self.version.major())?;
        writeln!(f, "{}", self.constant_pool)?;
        writeln!(f, "Access flags: {}", self.access_flags.bits())?;
        writeln!(f, "Name: {}", self.name)?;
        if let Some(super_name) = &self.super_name {
            writeln!(f, "Super name: {}", super_name)?;
        }

        writeln!(f, "Interfaces: {}", self.interfaces.join(", "))?;

        write!(f, "Fields:")?;
        for field in &self.fields {
            writeln!(f)?;
            field.tabbed_fmt(f, &self.constant_pool, 1)?;
        }
        writeln!(f)?;

        write!(f, "Methods:")?;
        for method in &self.methods {
            writeln!(f)?;
            method.tabbed_fmt(f, &self.constant_pool, 1)?;
        }
        writeln!(f)?;

        write!(f, "Attributes:")?;
        for attribute in &self.attributes {
            writeln!(f)?;
            attribute.tabbed_fmt(f, &self.constant_pool, 1)?;
        }
        Ok(())
    }
}

/// A field declaration: flags, name, descriptor, attributes.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    access_flags: AccessFlags,
    name: String,
    raw_type: String,
    descriptor: Descriptor,
    attributes: Vec<AttributeInfo>,
}

impl FieldInfo {
    fn read<R: ByteRead>(r: &mut R, pool: &ConstantPool) -> Result<FieldInfo> {
        let access_flags = AccessFlags::read(r)?;
        let name_index = r.u16()?;
        let name = pool
            .utf8(name_index)
            .map_err(|_| CorruptKind::BadIndex(name_index))?
            .to_owned();
        let descriptor_index = r.u16()?;
        let raw_type = pool
            .utf8(descriptor_index)
            .map_err(|_| CorruptKind::BadIndex(descriptor_index))?
            .to_owned();
        let descriptor = Descriptor::parse(&raw_type)?;
        let attributes = AttributeInfo::read_list(r, pool)?;

        Ok(FieldInfo {
            access_flags,
            name,
            raw_type,
            descriptor,
            attributes,
        })
    }

    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor string exactly as it appears in the class file.
    pub fn raw_type(&self) -> &str {
        &self.raw_type
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }
}

impl PoolDisplay for FieldInfo {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        write!(f, "Field: {} {}", self.name, self.raw_type)?;
        for attribute in &self.attributes {
            writeln!(f)?;
            attribute.tabbed_fmt(f, pool, 1)?;
        }
        Ok(())
    }
}

/// A method declaration. The position of the Code attribute, if any, is
/// memoized at read.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    access_flags: AccessFlags,
    name: String,
    raw_type: String,
    descriptor: MethodDescriptor,
    code: Option<usize>,
    attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    fn read<R: ByteRead>(r: &mut R, pool: &ConstantPool) -> Result<MethodInfo> {
        let access_flags = AccessFlags::read(r)?;
        let name_index = r.u16()?;
        let name = pool
            .utf8(name_index)
            .map_err(|_| CorruptKind::BadIndex(name_index))?
            .to_owned();
        let descriptor_index = r.u16()?;
        let raw_type = pool
            .utf8(descriptor_index)
            .map_err(|_| CorruptKind::BadIndex(descriptor_index))?
            .to_owned();
        let descriptor = MethodDescriptor::parse(&raw_type)?;
        let attributes = AttributeInfo::read_list(r, pool)?;
        let code = attributes
            .iter()
            .position(|attr| matches!(attr, AttributeInfo::Code(_)));

        Ok(MethodInfo {
            access_flags,
            name,
            raw_type,
            descriptor,
            code,
            attributes,
        })
    }

    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor string exactly as it appears in the class file.
    pub fn raw_type(&self) -> &str {
        &self.raw_type
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    /// The method's Code attribute, absent for abstract and native methods.
    pub fn code(&self) -> Option<&CodeAttribute> {
        match self.attributes.get(self.code?) {
            Some(AttributeInfo::Code(code)) => Some(code),
            _ => None,
        }
    }
}

impl PoolDisplay for MethodInfo {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        write!(f, "Method: {} {}", self.name, self.raw_type)?;
        for attribute in &self.attributes {
            writeln!(f)?;
            attribute.tabbed_fmt(f, pool, 1)?;
        }
        Ok(())
    }
}
