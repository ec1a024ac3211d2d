//! The constant pool: a 1-based table of typed constants.
//!
//! Reading is two-phase. The parse pass decodes each tagged entry, leaving a
//! `Placeholder` in the second slot of every Long and Double. The post-parse
//! pass verifies that every cross-index points at an entry of the required
//! tag, resolves Class names to dotted form, and parses-and-caches the
//! descriptor of every Field/Method/InterfaceMethod ref.

use std::fmt::{self, Display, Formatter};
use std::io::{Read, Seek};

use crate::class::PoolDisplay;
use crate::descriptor::{Descriptor, MethodDescriptor};
use crate::error::{CorruptKind, Error, Result};
use crate::read::ByteRead;

#[derive(Debug, Clone)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
        /// Dotted fully-qualified name, resolved at post-parse.
        name: String,
    },
    String {
        string_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
        /// Parsed from the referenced NameAndType at post-parse.
        descriptor: Option<Descriptor>,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
        descriptor: Option<MethodDescriptor>,
    },
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
        descriptor: Option<MethodDescriptor>,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    /// Second slot of a Long or Double entry. Never directly addressable.
    Placeholder,
}

impl Constant {
    /// The numeric tag as it appears on the wire. Placeholder slots have no
    /// tag and report 0.
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class { .. } => 7,
            Constant::String { .. } => 8,
            Constant::FieldRef { .. } => 9,
            Constant::MethodRef { .. } => 10,
            Constant::InterfaceMethodRef { .. } => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType { .. } => 16,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Placeholder => 0,
        }
    }

    fn read<R: ByteRead>(r: &mut R) -> Result<Constant> {
        Ok(match r.u8()? {
            1 => {
                let length = r.u16()? as usize;
                let bytes = r.read_bytes(length)?;
                let text = cesu8::from_java_cesu8(&bytes).map_err(|_| CorruptKind::BadUtf8)?;
                Constant::Utf8(text.into_owned())
            }
            3 => Constant::Integer(r.i32()?),
            4 => Constant::Float(r.f32()?),
            5 => Constant::Long(r.i64()?),
            6 => Constant::Double(r.f64()?),
            7 => Constant::Class {
                name_index: r.u16()?,
                name: String::new(),
            },
            8 => Constant::String {
                string_index: r.u16()?,
            },
            9 => Constant::FieldRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
                descriptor: None,
            },
            10 => Constant::MethodRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
                descriptor: None,
            },
            11 => Constant::InterfaceMethodRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
                descriptor: None,
            },
            12 => Constant::NameAndType {
                name_index: r.u16()?,
                descriptor_index: r.u16()?,
            },
            15 => Constant::MethodHandle {
                reference_kind: r.u8()?,
                reference_index: r.u16()?,
            },
            16 => Constant::MethodType {
                descriptor_index: r.u16()?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            x => return Err(CorruptKind::BadTag(x).into()),
        })
    }
}

/// Post-parse mutations, collected while the pool is borrowed for validation
/// and applied afterwards.
enum Resolved {
    ClassName(usize, String),
    FieldDesc(usize, Descriptor),
    MethodDesc(usize, MethodDescriptor),
    InterfaceDesc(usize, MethodDescriptor),
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn read<R: Read + Seek>(r: &mut R) -> Result<ConstantPool> {
        let count = r.u16()?;
        if count == 0 {
            return Err(CorruptKind::BadIndex(0).into());
        }

        let mut entries = Vec::with_capacity(count as usize - 1);
        let mut index = 1u16;
        while index < count {
            let entry = Constant::read(r)?;
            trace!("constant {}/{}: tag {}", index, count, entry.tag());

            if matches!(entry, Constant::Long(_) | Constant::Double(_)) {
                entries.push(entry);
                entries.push(Constant::Placeholder);
                index += 2;
            } else {
                entries.push(entry);
                index += 1;
            }
        }
        // A Long or Double in the final slot may have pushed its placeholder
        // past the declared count.
        entries.truncate(count as usize - 1);

        let mut pool = ConstantPool { entries };
        pool.post_parse()?;
        Ok(pool)
    }

    fn post_parse(&mut self) -> Result<()> {
        let mut resolved = Vec::new();

        for (slot, entry) in self.entries.iter().enumerate() {
            match entry {
                Constant::Class { name_index, .. } => {
                    let name = self.cross_utf8(*name_index)?;
                    resolved.push(Resolved::ClassName(slot, name.replace('/', ".")));
                }
                Constant::String { string_index } => {
                    self.cross_utf8(*string_index)?;
                }
                Constant::FieldRef {
                    class_index,
                    name_and_type_index,
                    ..
                } => {
                    self.cross_check(*class_index, 7)?;
                    self.cross_check(*name_and_type_index, 12)?;
                    let desc = Descriptor::parse(self.referenced_type(*name_and_type_index)?)?;
                    resolved.push(Resolved::FieldDesc(slot, desc));
                }
                Constant::MethodRef {
                    class_index,
                    name_and_type_index,
                    ..
                } => {
                    self.cross_check(*class_index, 7)?;
                    self.cross_check(*name_and_type_index, 12)?;
                    let desc =
                        MethodDescriptor::parse(self.referenced_type(*name_and_type_index)?)?;
                    resolved.push(Resolved::MethodDesc(slot, desc));
                }
                Constant::InterfaceMethodRef {
                    class_index,
                    name_and_type_index,
                    ..
                } => {
                    self.cross_check(*class_index, 7)?;
                    self.cross_check(*name_and_type_index, 12)?;
                    let desc =
                        MethodDescriptor::parse(self.referenced_type(*name_and_type_index)?)?;
                    resolved.push(Resolved::InterfaceDesc(slot, desc));
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    self.cross_utf8(*name_index)?;
                    self.cross_utf8(*descriptor_index)?;
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    if !(1..=9).contains(reference_kind) {
                        return Err(CorruptKind::MethodHandleKind(*reference_kind).into());
                    }
                    if !matches!(self.cross_tag(*reference_index)?, 9 | 10 | 11) {
                        return Err(CorruptKind::BadIndex(*reference_index).into());
                    }
                }
                Constant::MethodType { descriptor_index } => {
                    self.cross_utf8(*descriptor_index)?;
                }
                Constant::InvokeDynamic {
                    name_and_type_index,
                    ..
                } => {
                    self.cross_check(*name_and_type_index, 12)?;
                }
                _ => {}
            }
        }

        for patch in resolved {
            match patch {
                Resolved::ClassName(slot, value) => {
                    if let Constant::Class { name, .. } = &mut self.entries[slot] {
                        *name = value;
                    }
                }
                Resolved::FieldDesc(slot, value) => {
                    if let Constant::FieldRef { descriptor, .. } = &mut self.entries[slot] {
                        *descriptor = Some(value);
                    }
                }
                Resolved::MethodDesc(slot, value) => {
                    if let Constant::MethodRef { descriptor, .. } = &mut self.entries[slot] {
                        *descriptor = Some(value);
                    }
                }
                Resolved::InterfaceDesc(slot, value) => {
                    if let Constant::InterfaceMethodRef { descriptor, .. } =
                        &mut self.entries[slot]
                    {
                        *descriptor = Some(value);
                    }
                }
            }
        }

        Ok(())
    }

    /// Looks up an entry by 1-based index. `None` for index 0, out-of-range
    /// indices, and placeholder slots.
    fn entry(&self, index: u16) -> Option<&Constant> {
        if index == 0 {
            return None;
        }
        match self.entries.get(index as usize - 1) {
            Some(Constant::Placeholder) | None => None,
            entry => entry,
        }
    }

    // Cross-reference checks used during post-parse. Failures here are file
    // corruption, unlike the accessor errors below.

    fn cross_tag(&self, index: u16) -> Result<u8> {
        self.entry(index)
            .map(Constant::tag)
            .ok_or_else(|| CorruptKind::BadIndex(index).into())
    }

    fn cross_check(&self, index: u16, tag: u8) -> Result<()> {
        if self.cross_tag(index)? != tag {
            return Err(CorruptKind::BadIndex(index).into());
        }
        Ok(())
    }

    fn cross_utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(CorruptKind::BadIndex(index).into()),
        }
    }

    /// The raw descriptor string behind a NameAndType entry.
    fn referenced_type(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::NameAndType {
                descriptor_index, ..
            }) => self.cross_utf8(*descriptor_index),
            _ => Err(CorruptKind::BadIndex(index).into()),
        }
    }

    fn mismatch(&self, index: u16, expected: &'static str) -> Error {
        Error::InvalidIndex { index, expected }
    }

    /// The wire-format count: one more than the number of slots.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16 + 1
    }

    /// Iterates non-placeholder entries with their 1-based indices.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry, Constant::Placeholder))
            .map(|(i, entry)| (i as u16 + 1, entry))
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entry(index)
    }

    pub fn tag(&self, index: u16) -> Result<u8> {
        self.entry(index)
            .map(Constant::tag)
            .ok_or(Error::InvalidIndex {
                index,
                expected: "a constant",
            })
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(self.mismatch(index, "Utf8")),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32> {
        match self.entry(index) {
            Some(Constant::Integer(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "Integer")),
        }
    }

    pub fn float(&self, index: u16) -> Result<f32> {
        match self.entry(index) {
            Some(Constant::Float(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "Float")),
        }
    }

    pub fn long(&self, index: u16) -> Result<i64> {
        match self.entry(index) {
            Some(Constant::Long(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "Long")),
        }
    }

    pub fn double(&self, index: u16) -> Result<f64> {
        match self.entry(index) {
            Some(Constant::Double(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "Double")),
        }
    }

    /// The dotted fully-qualified name of a Class entry.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::Class { name, .. }) => Ok(name),
            _ => Err(self.mismatch(index, "Class")),
        }
    }

    pub fn string(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::String { string_index }) => self.utf8(*string_index),
            _ => Err(self.mismatch(index, "String")),
        }
    }

    /// The name half of a NameAndType entry.
    pub fn name(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::NameAndType { name_index, .. }) => self.utf8(*name_index),
            _ => Err(self.mismatch(index, "NameAndType")),
        }
    }

    /// The raw descriptor half of a NameAndType entry.
    pub fn type_descriptor(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::NameAndType {
                descriptor_index, ..
            }) => self.utf8(*descriptor_index),
            _ => Err(self.mismatch(index, "NameAndType")),
        }
    }

    pub fn field_ref_class(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::FieldRef { class_index, .. }) => self.class_name(*class_index),
            _ => Err(self.mismatch(index, "FieldRef")),
        }
    }

    pub fn field_ref_name(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::FieldRef {
                name_and_type_index,
                ..
            }) => self.name(*name_and_type_index),
            _ => Err(self.mismatch(index, "FieldRef")),
        }
    }

    pub fn field_ref_type(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::FieldRef {
                name_and_type_index,
                ..
            }) => self.type_descriptor(*name_and_type_index),
            _ => Err(self.mismatch(index, "FieldRef")),
        }
    }

    pub fn field_ref_desc(&self, index: u16) -> Result<&Descriptor> {
        match self.entry(index) {
            Some(Constant::FieldRef {
                descriptor: Some(desc),
                ..
            }) => Ok(desc),
            _ => Err(self.mismatch(index, "FieldRef")),
        }
    }

    pub fn method_ref_class(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::MethodRef { class_index, .. }) => self.class_name(*class_index),
            _ => Err(self.mismatch(index, "MethodRef")),
        }
    }

    pub fn method_ref_name(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::MethodRef {
                name_and_type_index,
                ..
            }) => self.name(*name_and_type_index),
            _ => Err(self.mismatch(index, "MethodRef")),
        }
    }

    pub fn method_ref_type(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::MethodRef {
                name_and_type_index,
                ..
            }) => self.type_descriptor(*name_and_type_index),
            _ => Err(self.mismatch(index, "MethodRef")),
        }
    }

    pub fn method_ref_desc(&self, index: u16) -> Result<&MethodDescriptor> {
        match self.entry(index) {
            Some(Constant::MethodRef {
                descriptor: Some(desc),
                ..
            }) => Ok(desc),
            _ => Err(self.mismatch(index, "MethodRef")),
        }
    }

    pub fn interface_method_ref_class(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::InterfaceMethodRef { class_index, .. }) => {
                self.class_name(*class_index)
            }
            _ => Err(self.mismatch(index, "InterfaceMethodRef")),
        }
    }

    pub fn interface_method_ref_name(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::InterfaceMethodRef {
                name_and_type_index,
                ..
            }) => self.name(*name_and_type_index),
            _ => Err(self.mismatch(index, "InterfaceMethodRef")),
        }
    }

    pub fn interface_method_ref_type(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Constant::InterfaceMethodRef {
                name_and_type_index,
                ..
            }) => self.type_descriptor(*name_and_type_index),
            _ => Err(self.mismatch(index, "InterfaceMethodRef")),
        }
    }

    pub fn interface_method_ref_desc(&self, index: u16) -> Result<&MethodDescriptor> {
        match self.entry(index) {
            Some(Constant::InterfaceMethodRef {
                descriptor: Some(desc),
                ..
            }) => Ok(desc),
            _ => Err(self.mismatch(index, "InterfaceMethodRef")),
        }
    }
}

impl PoolDisplay for Constant {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        match self {
            Constant::Utf8(s) => write!(f, "Utf8: \"{}\"", s.escape_default()),
            Constant::Integer(v) => write!(f, "Integer: {}", v),
            Constant::Float(v) => write!(f, "Float: {}", v),
            Constant::Long(v) => write!(f, "Long: {}", v),
            Constant::Double(v) => write!(f, "Double: {}", v),
            Constant::Class { name, .. } => write!(f, "Class: {}", name),
            Constant::String { string_index } => write!(
                f,
                "String: \"{}\"",
                pool.utf8(*string_index).unwrap_or("<invalid>").escape_default()
            ),
            Constant::FieldRef {
                class_index,
                name_and_type_index,
                ..
            } => write!(
                f,
                "FieldRef: {} {} {}",
                pool.class_name(*class_index).unwrap_or("<invalid>"),
                pool.name(*name_and_type_index).unwrap_or("<invalid>"),
                pool.type_descriptor(*name_and_type_index).unwrap_or("<invalid>"),
            ),
            Constant::MethodRef {
                class_index,
                name_and_type_index,
                ..
            } => write!(
                f,
                "MethodRef: {} {} {}",
                pool.class_name(*class_index).unwrap_or("<invalid>"),
                pool.name(*name_and_type_index).unwrap_or("<invalid>"),
                pool.type_descriptor(*name_and_type_index).unwrap_or("<invalid>"),
            ),
            Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
                ..
            } => write!(
                f,
                "InterfaceMethodRef: {} {} {}",
                pool.class_name(*class_index).unwrap_or("<invalid>"),
                pool.name(*name_and_type_index).unwrap_or("<invalid>"),
                pool.type_descriptor(*name_and_type_index).unwrap_or("<invalid>"),
            ),
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => write!(
                f,
                "NameAndType: {} {}",
                pool.utf8(*name_index).unwrap_or("<invalid>"),
                pool.utf8(*descriptor_index).unwrap_or("<invalid>"),
            ),
            Constant::MethodHandle {
                reference_index, ..
            } => write!(f, "MethodHandle: {}", reference_index),
            Constant::MethodType { descriptor_index } => write!(
                f,
                "MethodType: {}",
                pool.utf8(*descriptor_index).unwrap_or("<invalid>")
            ),
            Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => write!(
                f,
                "InvokeDynamic: {} {} {}",
                bootstrap_method_attr_index,
                pool.name(*name_and_type_index).unwrap_or("<invalid>"),
                pool.type_descriptor(*name_and_type_index).unwrap_or("<invalid>"),
            ),
            Constant::Placeholder => Ok(()),
        }
    }
}

impl Display for ConstantPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Constant pool:")?;
        for (index, entry) in self.iter() {
            write!(f, "\n  {} {}", index, entry.display(self))?;
        }
        Ok(())
    }
}
