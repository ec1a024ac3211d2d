//! Attributes: named, length-prefixed payloads on classes, members, and code.
//!
//! Dispatch is name-driven through the constant pool. Only `Code` and
//! `StackMapTable` are decoded structurally; everything else is retained as
//! an unknown attribute with its raw bytes.

use std::fmt::{self, Display, Formatter};

use once_cell::sync::OnceCell;

use crate::class::constant::ConstantPool;
use crate::class::PoolDisplay;
use crate::error::{CorruptKind, Result};
use crate::flow::ControlFlowGraph;
use crate::instruction::CodeIterator;
use crate::read::ByteRead;

#[derive(Debug, Clone)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    StackMapTable(StackMapTable),
    Unknown(UnknownAttribute),
}

impl AttributeInfo {
    pub(crate) fn read_list<R: ByteRead>(
        r: &mut R,
        pool: &ConstantPool,
    ) -> Result<Vec<AttributeInfo>> {
        let count = r.u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            attributes.push(AttributeInfo::read(r, pool)?);
        }
        Ok(attributes)
    }

    fn read<R: ByteRead>(r: &mut R, pool: &ConstantPool) -> Result<AttributeInfo> {
        let name_index = r.u16()?;
        let name = pool
            .utf8(name_index)
            .map_err(|_| CorruptKind::BadIndex(name_index))?;
        let length = r.u32()?;
        let start = r.position()?;

        trace!("attribute {:?} ({} bytes)", name, length);

        let attribute = match name {
            "Code" => AttributeInfo::Code(CodeAttribute::read(r, pool)?),
            "StackMapTable" => AttributeInfo::StackMapTable(StackMapTable::read(r)?),
            _ => AttributeInfo::Unknown(UnknownAttribute {
                name_index,
                data: r.read_bytes(length as usize)?,
            }),
        };

        if r.position()? != start + length as u64 {
            return Err(CorruptKind::AttributeLengthMismatch.into());
        }
        Ok(attribute)
    }

    /// The attribute name as stored in the pool.
    pub fn name<'a>(&'a self, pool: &'a ConstantPool) -> &'a str {
        match self {
            AttributeInfo::Code(_) => "Code",
            AttributeInfo::StackMapTable(_) => "StackMapTable",
            AttributeInfo::Unknown(attr) => pool.utf8(attr.name_index).unwrap_or("<invalid>"),
        }
    }
}

impl PoolDisplay for AttributeInfo {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        match self {
            AttributeInfo::Code(attr) => attr.fmt(f, pool),
            AttributeInfo::StackMapTable(attr) => attr.fmt(f, pool),
            AttributeInfo::Unknown(attr) => attr.fmt(f, pool),
        }
    }
}

/// The `Code` attribute of a method.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    /// Position of the first nested StackMapTable, memoized at read.
    stack_map: Option<usize>,
    attributes: Vec<AttributeInfo>,
    cfg: OnceCell<ControlFlowGraph>,
}

impl CodeAttribute {
    fn read<R: ByteRead>(r: &mut R, pool: &ConstantPool) -> Result<CodeAttribute> {
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;

        let code_length = r.u32()?;
        let code = r.read_bytes(code_length as usize)?;

        let exception_table_length = r.u16()?;
        r.skip(exception_table_length as u64 * 8)?;

        let attributes = AttributeInfo::read_list(r, pool)?;
        let stack_map = attributes
            .iter()
            .position(|attr| matches!(attr, AttributeInfo::StackMapTable(_)));

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            stack_map,
            attributes,
            cfg: OnceCell::new(),
        })
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    pub fn stack_map(&self) -> Option<&StackMapTable> {
        match self.attributes.get(self.stack_map?) {
            Some(AttributeInfo::StackMapTable(table)) => Some(table),
            _ => None,
        }
    }

    /// An iterator positioned at the start of the code array.
    pub fn iterator(&self) -> CodeIterator<'_> {
        CodeIterator::new(&self.code)
    }

    /// Builds the control-flow graph on first use and caches it.
    pub fn cfg(&self) -> Result<&ControlFlowGraph> {
        self.cfg.get_or_try_init(|| ControlFlowGraph::build(self))
    }
}

impl PoolDisplay for CodeAttribute {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        write!(f, "Code Attribute:")?;
        write!(f, "\n  Max Stack: {}", self.max_stack)?;
        write!(f, "\n  Max Locals: {}", self.max_locals)?;
        write!(f, "\n  Code:")?;

        let mut iterator = self.iterator();
        while !iterator.eof() {
            let index = match iterator.next() {
                Ok(index) => index,
                Err(_) => {
                    write!(f, "\n    <undecodable>")?;
                    break;
                }
            };
            let text = iterator
                .render(index)
                .unwrap_or_else(|_| String::from("<undecodable>"));
            write!(f, "\n    {}: {}", index, text.replace('\n', "\n    "))?;
        }

        for attribute in &self.attributes {
            writeln!(f)?;
            attribute.tabbed_fmt(f, pool, 1)?;
        }
        Ok(())
    }
}

/// An attribute this parser does not decode: name plus raw payload.
#[derive(Debug, Clone)]
pub struct UnknownAttribute {
    name_index: u16,
    data: Vec<u8>,
}

impl UnknownAttribute {
    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.name_index)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PoolDisplay for UnknownAttribute {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result {
        write!(
            f,
            "Unknown Attribute: {}",
            pool.utf8(self.name_index).unwrap_or("<invalid>")
        )?;
        for (i, byte) in self.data.iter().enumerate() {
            if i % 8 == 0 {
                write!(f, "\n  ")?;
            }
            write!(f, "{:02x} ", byte)?;
        }
        Ok(())
    }
}

/// A verification-type slot in a stack map frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of the class.
    Object(u16),
    /// Code offset of the `new` instruction.
    Uninitialized(u16),
}

impl VerificationType {
    fn read<R: ByteRead>(r: &mut R) -> Result<VerificationType> {
        Ok(match r.u8()? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(r.u16()?),
            8 => VerificationType::Uninitialized(r.u16()?),
            x => return Err(CorruptKind::InvalidVerificationTag(x).into()),
        })
    }
}

impl Display for VerificationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VerificationType::Top => write!(f, "Top"),
            VerificationType::Integer => write!(f, "Integer"),
            VerificationType::Float => write!(f, "Float"),
            VerificationType::Double => write!(f, "Double"),
            VerificationType::Long => write!(f, "Long"),
            VerificationType::Null => write!(f, "Null"),
            VerificationType::UninitializedThis => write!(f, "UninitializedThis"),
            VerificationType::Object(index) => write!(f, "Object [{}]", index),
            VerificationType::Uninitialized(offset) => write!(f, "Uninitialized {}", offset),
        }
    }
}

/// A delta-encoded stack map frame.
///
/// The extended forms collapse into their base variants once the offset
/// delta has been read; only the delta and shape-specific payload matter for
/// reconstruction.
#[derive(Debug, Clone)]
pub enum StackMapFrame {
    Same {
        offset_delta: u16,
    },
    SameLocals1StackItem {
        offset_delta: u16,
        stack: VerificationType,
    },
    Chop {
        offset_delta: u16,
        chopped: u8,
    },
    Append {
        offset_delta: u16,
        locals: Vec<VerificationType>,
    },
    Full {
        offset_delta: u16,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

impl StackMapFrame {
    fn read<R: ByteRead>(r: &mut R) -> Result<StackMapFrame> {
        let raw_type = r.u8()?;
        Ok(match raw_type {
            0..=63 => StackMapFrame::Same {
                offset_delta: raw_type as u16,
            },
            64..=127 => StackMapFrame::SameLocals1StackItem {
                offset_delta: (raw_type - 64) as u16,
                stack: VerificationType::read(r)?,
            },
            128..=246 => return Err(CorruptKind::ReservedStackMapTag(raw_type).into()),
            247 => StackMapFrame::SameLocals1StackItem {
                offset_delta: r.u16()?,
                stack: VerificationType::read(r)?,
            },
            248..=250 => StackMapFrame::Chop {
                offset_delta: r.u16()?,
                chopped: 251 - raw_type,
            },
            251 => StackMapFrame::Same {
                offset_delta: r.u16()?,
            },
            252..=254 => {
                let offset_delta = r.u16()?;
                let mut locals = Vec::with_capacity((raw_type - 251) as usize);
                for _ in 0..raw_type - 251 {
                    locals.push(VerificationType::read(r)?);
                }
                StackMapFrame::Append {
                    offset_delta,
                    locals,
                }
            }
            255 => {
                let offset_delta = r.u16()?;
                let num_locals = r.u16()?;
                let mut locals = Vec::with_capacity(num_locals as usize);
                for _ in 0..num_locals {
                    locals.push(VerificationType::read(r)?);
                }
                let num_stack = r.u16()?;
                let mut stack = Vec::with_capacity(num_stack as usize);
                for _ in 0..num_stack {
                    stack.push(VerificationType::read(r)?);
                }
                StackMapFrame::Full {
                    offset_delta,
                    locals,
                    stack,
                }
            }
        })
    }

    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

impl Display for StackMapFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StackMapFrame::Same { offset_delta } => {
                write!(f, "Same: offset_delta={}", offset_delta)
            }
            StackMapFrame::SameLocals1StackItem {
                offset_delta,
                stack,
            } => write!(
                f,
                "Same Locals 1 Stack Item: offset_delta={}, info={}",
                offset_delta, stack
            ),
            StackMapFrame::Chop {
                offset_delta,
                chopped,
            } => write!(f, "Chop: offset_delta={}, chopped={}", offset_delta, chopped),
            StackMapFrame::Append {
                offset_delta,
                locals,
            } => {
                write!(f, "Append: offset_delta={}", offset_delta)?;
                for local in locals {
                    write!(f, "\n  {}", local)?;
                }
                Ok(())
            }
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                write!(f, "Full: offset_delta={}", offset_delta)?;
                for local in locals {
                    write!(f, "\n  {}", local)?;
                }
                for entry in stack {
                    write!(f, "\n  {}", entry)?;
                }
                Ok(())
            }
        }
    }
}

/// The `StackMapTable` attribute: an ordered list of frame deltas.
#[derive(Debug, Clone)]
pub struct StackMapTable {
    entries: Vec<StackMapFrame>,
}

impl StackMapTable {
    fn read<R: ByteRead>(r: &mut R) -> Result<StackMapTable> {
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(StackMapFrame::read(r)?);
        }
        Ok(StackMapTable { entries })
    }

    pub fn entries(&self) -> &[StackMapFrame] {
        &self.entries
    }
}

impl PoolDisplay for StackMapTable {
    fn fmt(&self, f: &mut Formatter<'_>, _pool: &ConstantPool) -> fmt::Result {
        write!(f, "Stack Map Table Attribute:")?;
        for entry in &self.entries {
            write!(f, "\n  {}", format!("{}", entry).replace('\n', "\n  "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::class::constant::tests::{class_entry, pool_bytes, utf8_entry};
    use crate::error::Error;

    fn test_pool() -> ConstantPool {
        let bytes = pool_bytes(
            5,
            &[
                &utf8_entry("Code"),
                &utf8_entry("StackMapTable"),
                &utf8_entry("Deprecated"),
                &class_entry(3),
            ],
        );
        ConstantPool::read(&mut Cursor::new(bytes)).unwrap()
    }

    /// Encodes an attribute list with one attribute.
    fn attribute_bytes(name_index: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = 1u16.to_be_bytes().to_vec();
        bytes.extend_from_slice(&name_index.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn code_payload(code: &[u8], attributes: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes()); // max_stack
        payload.extend_from_slice(&3u16.to_be_bytes()); // max_locals
        payload.extend_from_slice(&(code.len() as u32).to_be_bytes());
        payload.extend_from_slice(code);
        payload.extend_from_slice(&0u16.to_be_bytes()); // exception table
        payload.extend_from_slice(attributes);
        payload
    }

    #[test]
    fn unknown_attribute_keeps_raw_bytes() {
        let pool = test_pool();
        let bytes = attribute_bytes(3, &[0xDE, 0xAD]);
        let attributes =
            AttributeInfo::read_list(&mut Cursor::new(bytes), &pool).unwrap();
        assert_eq!(attributes.len(), 1);
        match &attributes[0] {
            AttributeInfo::Unknown(attr) => {
                assert_eq!(attr.name(&pool).unwrap(), "Deprecated");
                assert_eq!(attr.data(), &[0xDE, 0xAD]);
            }
            other => panic!("expected unknown attribute, got {:?}", other),
        }
    }

    #[test]
    fn code_attribute_parses_and_skips_exception_table() {
        let pool = test_pool();
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&[0x10, 0x2A, 0xAC]); // bipush 42; ireturn
        payload.extend_from_slice(&1u16.to_be_bytes()); // one exception entry
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(&0u16.to_be_bytes()); // no nested attributes

        let bytes = attribute_bytes(1, &payload);
        let attributes =
            AttributeInfo::read_list(&mut Cursor::new(bytes), &pool).unwrap();
        match &attributes[0] {
            AttributeInfo::Code(code) => {
                assert_eq!(code.max_stack(), 1);
                assert_eq!(code.max_locals(), 2);
                assert_eq!(code.code(), &[0x10, 0x2A, 0xAC]);
                assert!(code.stack_map().is_none());
            }
            other => panic!("expected code attribute, got {:?}", other),
        }
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        let pool = test_pool();
        // Declared length one byte longer than the Code payload consumes.
        let payload = code_payload(&[0xAC], &0u16.to_be_bytes());
        let mut bytes = 1u16.to_be_bytes().to_vec();
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        bytes.extend_from_slice(&payload);
        bytes.push(0);

        let err = AttributeInfo::read_list(&mut Cursor::new(bytes), &pool).unwrap_err();
        assert!(matches!(
            err,
            Error::Corrupt(CorruptKind::AttributeLengthMismatch)
        ));
    }

    #[test]
    fn nested_stack_map_is_memoized() {
        let pool = test_pool();
        // StackMapTable with a single Same frame, delta 0.
        let table_payload = {
            let mut bytes = 1u16.to_be_bytes().to_vec();
            bytes.push(0);
            bytes
        };
        let nested = attribute_bytes(2, &table_payload);
        let payload = code_payload(&[0xA7, 0x00, 0x00], &nested); // goto 0
        let bytes = attribute_bytes(1, &payload);

        let attributes =
            AttributeInfo::read_list(&mut Cursor::new(bytes), &pool).unwrap();
        match &attributes[0] {
            AttributeInfo::Code(code) => {
                let table = code.stack_map().expect("stack map memoized");
                assert_eq!(table.entries().len(), 1);
                assert!(matches!(
                    table.entries()[0],
                    StackMapFrame::Same { offset_delta: 0 }
                ));
            }
            other => panic!("expected code attribute, got {:?}", other),
        }
    }

    #[test]
    fn frame_shapes_decode() {
        // same(5), same_locals_1_stack_item(64+2, Integer),
        // chop 2 (249, delta 7), append 2 (253, delta 1, Long Top),
        // full (255, delta 4, 1 local Object[2], 1 stack Null)
        let bytes = vec![
            5u8, // Same, delta 5
            66, 1, // SameLocals1StackItem, delta 2, Integer
            249, 0, 7, // Chop 2, delta 7
            253, 0, 1, 4, 0, // Append, delta 1, [Long, Top]
            255, 0, 4, 0, 1, 7, 0, 2, 0, 1, 5, // Full, delta 4
        ];
        let mut data = 5u16.to_be_bytes().to_vec();
        data.extend_from_slice(&bytes);

        let table = StackMapTable::read(&mut Cursor::new(data)).unwrap();
        let entries = table.entries();
        assert!(matches!(entries[0], StackMapFrame::Same { offset_delta: 5 }));
        assert!(matches!(
            entries[1],
            StackMapFrame::SameLocals1StackItem {
                offset_delta: 2,
                stack: VerificationType::Integer,
            }
        ));
        assert!(matches!(
            entries[2],
            StackMapFrame::Chop {
                offset_delta: 7,
                chopped: 2,
            }
        ));
        match &entries[3] {
            StackMapFrame::Append {
                offset_delta: 1,
                locals,
            } => assert_eq!(
                locals.as_slice(),
                &[VerificationType::Long, VerificationType::Top]
            ),
            other => panic!("expected append, got {:?}", other),
        }
        match &entries[4] {
            StackMapFrame::Full {
                offset_delta: 4,
                locals,
                stack,
            } => {
                assert_eq!(locals.as_slice(), &[VerificationType::Object(2)]);
                assert_eq!(stack.as_slice(), &[VerificationType::Null]);
            }
            other => panic!("expected full, got {:?}", other),
        }
    }

    #[test]
    fn reserved_frame_type_rejected() {
        let mut data = 1u16.to_be_bytes().to_vec();
        data.push(200);
        let err = StackMapTable::read(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(
            err,
            Error::Corrupt(CorruptKind::ReservedStackMapTag(200))
        ));
    }

    #[test]
    fn invalid_verification_tag_rejected() {
        let mut data = 1u16.to_be_bytes().to_vec();
        data.extend_from_slice(&[64, 9]); // SameLocals1StackItem with tag 9
        let err = StackMapTable::read(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(
            err,
            Error::Corrupt(CorruptKind::InvalidVerificationTag(9))
        ));
    }
}
