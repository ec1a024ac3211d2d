//! Instruction-level access to the code array of a method.
//!
//! `CodeIterator` walks a raw code array opcode by opcode. Most widths come
//! from a fixed 256-entry table; `tableswitch` and `lookupswitch` have
//! payload-dependent widths that start at the next 4-byte-aligned offset
//! after the opcode.

use std::fmt::Write as _;

use byteorder::{BigEndian, ByteOrder};

use crate::descriptor::Descriptor;
use crate::error::{CorruptKind, Error, Result};

pub mod opcode;

/// Fixed instruction widths in bytes, indexed by opcode. Zero marks the
/// variable-width switches, `wide`, and every undefined opcode.
#[rustfmt::skip]
const WIDTHS: [u8; 256] = [
    // 0x00: nop .. dconst_1
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x10: bipush, sipush, ldc family, loads
    2, 3, 2, 3, 3, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1,
    // 0x20: loads
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x30: array loads, stores
    1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1,
    // 0x40: stores
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x50: array stores, stack ops
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x60: arithmetic
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x70: arithmetic, shifts
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x80: logic, iinc, conversions
    1, 1, 1, 1, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x90: conversions, comparisons, branches
    1, 1, 1, 1, 1, 1, 1, 1, 1, 3, 3, 3, 3, 3, 3, 3,
    // 0xa0: branches, ret, switches, returns
    3, 3, 3, 3, 3, 3, 3, 3, 3, 2, 0, 0, 1, 1, 1, 1,
    // 0xb0: returns, field/method access
    1, 1, 3, 3, 3, 3, 3, 3, 3, 5, 5, 3, 2, 3, 1, 1,
    // 0xc0: checkcast .. jsr_w
    3, 3, 1, 1, 0, 4, 3, 3, 5, 5, 0, 0, 0, 0, 0, 0,
    // 0xd0 and up: undefined
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Walks a code array instruction by instruction.
#[derive(Debug, Clone)]
pub struct CodeIterator<'a> {
    code: &'a [u8],
    position: u32,
}

impl<'a> CodeIterator<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        CodeIterator { code, position: 0 }
    }

    /// Returns the offset of the instruction at the current position and
    /// advances past it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<u32> {
        if self.eof() {
            return Err(CorruptKind::UnexpectedEof.into());
        }

        let result = self.position;
        let op = self.byte_at(result)?;
        match WIDTHS[op as usize] {
            0 => match op {
                opcode::TABLESWITCH => {
                    let padded = (result + 4) & !3;
                    let low = self.read_i32(padded + 4)? as i64;
                    let high = self.read_i32(padded + 8)? as i64;
                    self.position = checked_offset(padded as i64 + 12 + (high - low + 1) * 4)?;
                }
                opcode::LOOKUPSWITCH => {
                    let padded = (result + 4) & !3;
                    let npairs = self.read_i32(padded + 4)? as i64;
                    self.position = checked_offset(padded as i64 + 8 + npairs * 8)?;
                }
                opcode::WIDE => return Err(Error::Unsupported("wide")),
                x => return Err(CorruptKind::UnknownOpcode(x).into()),
            },
            width => self.position = result + width as u32,
        }

        Ok(result)
    }

    /// Current position without advancing.
    pub fn peek(&self) -> u32 {
        self.position
    }

    /// Repositions the iterator. The offset is not checked against
    /// instruction boundaries.
    pub fn move_to(&mut self, position: u32) {
        self.position = position;
    }

    pub fn eof(&self) -> bool {
        self.position as usize >= self.code.len()
    }

    pub fn byte_at(&self, index: u32) -> Result<u8> {
        self.code
            .get(index as usize)
            .copied()
            .ok_or_else(|| CorruptKind::UnexpectedEof.into())
    }

    fn slice_at(&self, index: u32, len: usize) -> Result<&[u8]> {
        let start = index as usize;
        start
            .checked_add(len)
            .and_then(|end| self.code.get(start..end))
            .ok_or_else(|| CorruptKind::UnexpectedEof.into())
    }

    pub fn read_u16(&self, index: u32) -> Result<u16> {
        Ok(BigEndian::read_u16(self.slice_at(index, 2)?))
    }

    pub fn read_i16(&self, index: u32) -> Result<i16> {
        Ok(BigEndian::read_i16(self.slice_at(index, 2)?))
    }

    pub fn read_i32(&self, index: u32) -> Result<i32> {
        Ok(BigEndian::read_i32(self.slice_at(index, 4)?))
    }

    fn branch16(&self, index: u32) -> Result<i64> {
        Ok(index as i64 + self.read_i16(index + 1)? as i64)
    }

    fn branch32(&self, index: u32) -> Result<i64> {
        Ok(index as i64 + self.read_i32(index + 1)? as i64)
    }

    /// Renders the instruction at `index` in canonical textual form:
    /// lowercase mnemonic, decimal immediates, pool references as `[n]`,
    /// branch targets as `@absolute`. Switches render one case per line.
    pub fn render(&self, index: u32) -> Result<String> {
        use opcode::*;

        let op = self.byte_at(index)?;
        Ok(match op {
            NOP => "nop".into(),
            ACONST_NULL => "aconst_null".into(),
            ICONST_M1 => "iconst_m1".into(),
            ICONST_0 => "iconst_0".into(),
            ICONST_1 => "iconst_1".into(),
            ICONST_2 => "iconst_2".into(),
            ICONST_3 => "iconst_3".into(),
            ICONST_4 => "iconst_4".into(),
            ICONST_5 => "iconst_5".into(),
            LCONST_0 => "lconst_0".into(),
            LCONST_1 => "lconst_1".into(),
            FCONST_0 => "fconst_0".into(),
            FCONST_1 => "fconst_1".into(),
            FCONST_2 => "fconst_2".into(),
            DCONST_0 => "dconst_0".into(),
            DCONST_1 => "dconst_1".into(),
            BIPUSH => format!("bipush {}", self.byte_at(index + 1)?),
            SIPUSH => format!("sipush {}", self.read_u16(index + 1)?),
            LDC => format!("ldc [{}]", self.byte_at(index + 1)?),
            LDC_W => format!("ldc_w [{}]", self.read_u16(index + 1)?),
            LDC2_W => format!("ldc2_w [{}]", self.read_u16(index + 1)?),
            ILOAD => format!("iload {}", self.byte_at(index + 1)?),
            LLOAD => format!("lload {}", self.byte_at(index + 1)?),
            FLOAD => format!("fload {}", self.byte_at(index + 1)?),
            DLOAD => format!("dload {}", self.byte_at(index + 1)?),
            ALOAD => format!("aload {}", self.byte_at(index + 1)?),
            ILOAD_0 => "iload_0".into(),
            ILOAD_1 => "iload_1".into(),
            ILOAD_2 => "iload_2".into(),
            ILOAD_3 => "iload_3".into(),
            LLOAD_0 => "lload_0".into(),
            LLOAD_1 => "lload_1".into(),
            LLOAD_2 => "lload_2".into(),
            LLOAD_3 => "lload_3".into(),
            FLOAD_0 => "fload_0".into(),
            FLOAD_1 => "fload_1".into(),
            FLOAD_2 => "fload_2".into(),
            FLOAD_3 => "fload_3".into(),
            DLOAD_0 => "dload_0".into(),
            DLOAD_1 => "dload_1".into(),
            DLOAD_2 => "dload_2".into(),
            DLOAD_3 => "dload_3".into(),
            ALOAD_0 => "aload_0".into(),
            ALOAD_1 => "aload_1".into(),
            ALOAD_2 => "aload_2".into(),
            ALOAD_3 => "aload_3".into(),
            IALOAD => "iaload".into(),
            LALOAD => "laload".into(),
            FALOAD => "faload".into(),
            DALOAD => "daload".into(),
            AALOAD => "aaload".into(),
            BALOAD => "baload".into(),
            CALOAD => "caload".into(),
            SALOAD => "saload".into(),
            ISTORE => format!("istore {}", self.byte_at(index + 1)?),
            LSTORE => format!("lstore {}", self.byte_at(index + 1)?),
            FSTORE => format!("fstore {}", self.byte_at(index + 1)?),
            DSTORE => format!("dstore {}", self.byte_at(index + 1)?),
            ASTORE => format!("astore {}", self.byte_at(index + 1)?),
            ISTORE_0 => "istore_0".into(),
            ISTORE_1 => "istore_1".into(),
            ISTORE_2 => "istore_2".into(),
            ISTORE_3 => "istore_3".into(),
            LSTORE_0 => "lstore_0".into(),
            LSTORE_1 => "lstore_1".into(),
            LSTORE_2 => "lstore_2".into(),
            LSTORE_3 => "lstore_3".into(),
            FSTORE_0 => "fstore_0".into(),
            FSTORE_1 => "fstore_1".into(),
            FSTORE_2 => "fstore_2".into(),
            FSTORE_3 => "fstore_3".into(),
            DSTORE_0 => "dstore_0".into(),
            DSTORE_1 => "dstore_1".into(),
            DSTORE_2 => "dstore_2".into(),
            DSTORE_3 => "dstore_3".into(),
            ASTORE_0 => "astore_0".into(),
            ASTORE_1 => "astore_1".into(),
            ASTORE_2 => "astore_2".into(),
            ASTORE_3 => "astore_3".into(),
            IASTORE => "iastore".into(),
            LASTORE => "lastore".into(),
            FASTORE => "fastore".into(),
            DASTORE => "dastore".into(),
            AASTORE => "aastore".into(),
            BASTORE => "bastore".into(),
            CASTORE => "castore".into(),
            SASTORE => "sastore".into(),
            POP => "pop".into(),
            POP2 => "pop2".into(),
            DUP => "dup".into(),
            DUP_X1 => "dup_x1".into(),
            DUP_X2 => "dup_x2".into(),
            DUP2 => "dup2".into(),
            DUP2_X1 => "dup2_x1".into(),
            DUP2_X2 => "dup2_x2".into(),
            SWAP => "swap".into(),
            IADD => "iadd".into(),
            LADD => "ladd".into(),
            FADD => "fadd".into(),
            DADD => "dadd".into(),
            ISUB => "isub".into(),
            LSUB => "lsub".into(),
            FSUB => "fsub".into(),
            DSUB => "dsub".into(),
            IMUL => "imul".into(),
            LMUL => "lmul".into(),
            FMUL => "fmul".into(),
            DMUL => "dmul".into(),
            IDIV => "idiv".into(),
            LDIV => "ldiv".into(),
            FDIV => "fdiv".into(),
            DDIV => "ddiv".into(),
            IREM => "irem".into(),
            LREM => "lrem".into(),
            FREM => "frem".into(),
            DREM => "drem".into(),
            INEG => "ineg".into(),
            LNEG => "lneg".into(),
            FNEG => "fneg".into(),
            DNEG => "dneg".into(),
            ISHL => "ishl".into(),
            LSHL => "lshl".into(),
            ISHR => "ishr".into(),
            LSHR => "lshr".into(),
            IUSHR => "iushr".into(),
            LUSHR => "lushr".into(),
            IAND => "iand".into(),
            LAND => "land".into(),
            IOR => "ior".into(),
            LOR => "lor".into(),
            IXOR => "ixor".into(),
            LXOR => "lxor".into(),
            IINC => format!(
                "iinc {} {}",
                self.byte_at(index + 1)?,
                self.byte_at(index + 2)?
            ),
            I2L => "i2l".into(),
            I2F => "i2f".into(),
            I2D => "i2d".into(),
            L2I => "l2i".into(),
            L2F => "l2f".into(),
            L2D => "l2d".into(),
            F2I => "f2i".into(),
            F2L => "f2l".into(),
            F2D => "f2d".into(),
            D2I => "d2i".into(),
            D2L => "d2l".into(),
            D2F => "d2f".into(),
            I2B => "i2b".into(),
            I2C => "i2c".into(),
            I2S => "i2s".into(),
            LCMP => "lcmp".into(),
            FCMPL => "fcmpl".into(),
            FCMPG => "fcmpg".into(),
            DCMPL => "dcmpl".into(),
            DCMPG => "dcmpg".into(),
            IFEQ => format!("ifeq @{}", self.branch16(index)?),
            IFNE => format!("ifne @{}", self.branch16(index)?),
            IFLT => format!("iflt @{}", self.branch16(index)?),
            IFGE => format!("ifge @{}", self.branch16(index)?),
            IFGT => format!("ifgt @{}", self.branch16(index)?),
            IFLE => format!("ifle @{}", self.branch16(index)?),
            IF_ICMPEQ => format!("if_icmpeq @{}", self.branch16(index)?),
            IF_ICMPNE => format!("if_icmpne @{}", self.branch16(index)?),
            IF_ICMPLT => format!("if_icmplt @{}", self.branch16(index)?),
            IF_ICMPGE => format!("if_icmpge @{}", self.branch16(index)?),
            IF_ICMPGT => format!("if_icmpgt @{}", self.branch16(index)?),
            IF_ICMPLE => format!("if_icmple @{}", self.branch16(index)?),
            IF_ACMPEQ => format!("if_acmpeq @{}", self.branch16(index)?),
            IF_ACMPNE => format!("if_acmpne @{}", self.branch16(index)?),
            GOTO => format!("goto @{}", self.branch16(index)?),
            JSR => format!("jsr @{}", self.branch16(index)?),
            RET => format!("ret {}", self.byte_at(index + 1)?),
            TABLESWITCH => {
                let padded = (index + 4) & !3;
                let default = index as i64 + self.read_i32(padded)? as i64;
                let low = self.read_i32(padded + 4)?;
                let high = self.read_i32(padded + 8)?;
                let mut result = format!(
                    "tableswitch {} to {} default @{}",
                    low, high, default
                );
                for i in 0..(high as i64 - low as i64 + 1).max(0) {
                    let address =
                        index as i64 + self.read_i32(padded + 12 + i as u32 * 4)? as i64;
                    let _ = write!(result, "\n  {}: @{}", low as i64 + i, address);
                }
                result
            }
            LOOKUPSWITCH => {
                let padded = (index + 4) & !3;
                let default = index as i64 + self.read_i32(padded)? as i64;
                let npairs = self.read_i32(padded + 4)?;
                let mut result = format!("lookupswitch default @{}", default);
                for i in 0..npairs.max(0) as u32 {
                    let matched = self.read_i32(padded + 8 + i * 8)?;
                    let address = index as i64 + self.read_i32(padded + 12 + i * 8)? as i64;
                    let _ = write!(result, "\n  {}: @{}", matched, address);
                }
                result
            }
            IRETURN => "ireturn".into(),
            LRETURN => "lreturn".into(),
            FRETURN => "freturn".into(),
            DRETURN => "dreturn".into(),
            ARETURN => "areturn".into(),
            RETURN => "return".into(),
            GETSTATIC => format!("getstatic [{}]", self.read_u16(index + 1)?),
            PUTSTATIC => format!("putstatic [{}]", self.read_u16(index + 1)?),
            GETFIELD => format!("getfield [{}]", self.read_u16(index + 1)?),
            PUTFIELD => format!("putfield [{}]", self.read_u16(index + 1)?),
            INVOKEVIRTUAL => format!("invokevirtual [{}]", self.read_u16(index + 1)?),
            INVOKESPECIAL => format!("invokespecial [{}]", self.read_u16(index + 1)?),
            INVOKESTATIC => format!("invokestatic [{}]", self.read_u16(index + 1)?),
            INVOKEINTERFACE => format!("invokeinterface [{}]", self.read_u16(index + 1)?),
            INVOKEDYNAMIC => format!("invokedynamic [{}]", self.read_u16(index + 1)?),
            NEW => format!("new [{}]", self.read_u16(index + 1)?),
            NEWARRAY => {
                let element = Descriptor::from_newarray_operand(self.byte_at(index + 1)?)?;
                format!("newarray {}[]", element)
            }
            ANEWARRAY => format!("anewarray [{}]", self.read_u16(index + 1)?),
            ARRAYLENGTH => "arraylength".into(),
            ATHROW => "athrow".into(),
            CHECKCAST => format!("checkcast [{}]", self.read_u16(index + 1)?),
            INSTANCEOF => format!("instanceof [{}]", self.read_u16(index + 1)?),
            MONITORENTER => "monitorenter".into(),
            MONITOREXIT => "monitorexit".into(),
            WIDE => "wide".into(),
            MULTIANEWARRAY => format!(
                "multianewarray [{}] {}",
                self.read_u16(index + 1)?,
                self.byte_at(index + 3)?
            ),
            IFNULL => format!("ifnull @{}", self.branch16(index)?),
            IFNONNULL => format!("ifnonnull @{}", self.branch16(index)?),
            GOTO_W => format!("goto_w @{}", self.branch32(index)?),
            JSR_W => format!("jsr_w @{}", self.branch32(index)?),
            BREAKPOINT => "breakpoint".into(),
            IMPDEP1 => "impdep1".into(),
            IMPDEP2 => "impdep2".into(),
            x => format!("Unknown opcode: 0x{:02X}", x),
        })
    }
}

fn checked_offset(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| CorruptKind::UnexpectedEof.into())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn offsets(code: &[u8]) -> Result<Vec<u32>> {
        let mut iterator = CodeIterator::new(code);
        let mut offsets = Vec::new();
        while !iterator.eof() {
            offsets.push(iterator.next()?);
        }
        Ok(offsets)
    }

    #[test]
    fn fixed_width_instructions() {
        // bipush 42; ireturn
        let code = [0x10, 0x2A, 0xAC];
        assert_eq!(offsets(&code).unwrap(), vec![0, 2]);

        let iterator = CodeIterator::new(&code);
        assert_eq!(iterator.render(0).unwrap(), "bipush 42");
        assert_eq!(iterator.render(2).unwrap(), "ireturn");
    }

    #[test]
    fn offsets_partition_the_code_array() {
        // iconst_0; istore_1; iload_1; sipush 300; if_icmplt -6; return
        let code = [
            0x03, 0x3C, 0x1B, 0x11, 0x01, 0x2C, 0xA1, 0xFF, 0xFA, 0xB1,
        ];
        let offsets = offsets(&code).unwrap();
        assert_eq!(offsets, vec![0, 1, 2, 3, 6, 9]);

        // Strictly increasing with no gaps: each next offset is the previous
        // plus the decoded width, and the last instruction ends at the array
        // length.
        let mut iterator = CodeIterator::new(&code);
        for &expected in &offsets {
            assert_eq!(iterator.next().unwrap(), expected);
        }
        assert_eq!(iterator.peek(), code.len() as u32);
        assert!(iterator.eof());
    }

    #[test]
    fn tableswitch_alignment_at_odd_offset() {
        // nop at 0 forces the tableswitch opcode to offset 1; the payload is
        // then aligned at (1 + 4) & !3 == 4.
        let mut code = vec![0x00, 0xAA, 0x00, 0x00];
        code.extend_from_slice(&10i32.to_be_bytes()); // default
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&2i32.to_be_bytes()); // high
        code.extend_from_slice(&4i32.to_be_bytes());
        code.extend_from_slice(&6i32.to_be_bytes());
        code.extend_from_slice(&8i32.to_be_bytes());

        let mut iterator = CodeIterator::new(&code);
        assert_eq!(iterator.next().unwrap(), 0);
        assert_eq!(iterator.next().unwrap(), 1);
        // 4 + 12 + 4 * 3
        assert_eq!(iterator.peek(), 28);
        assert!(iterator.eof());

        assert_eq!(
            iterator.render(1).unwrap(),
            "tableswitch 0 to 2 default @11\n  0: @5\n  1: @7\n  2: @9"
        );
    }

    #[test]
    fn lookupswitch_width_and_rendering() {
        // lookupswitch at 0: payload aligned at 4.
        let mut code = vec![0xAB, 0x00, 0x00, 0x00];
        code.extend_from_slice(&20i32.to_be_bytes()); // default
        code.extend_from_slice(&2i32.to_be_bytes()); // npairs
        code.extend_from_slice(&(-1i32).to_be_bytes());
        code.extend_from_slice(&8i32.to_be_bytes());
        code.extend_from_slice(&7i32.to_be_bytes());
        code.extend_from_slice(&12i32.to_be_bytes());

        let mut iterator = CodeIterator::new(&code);
        assert_eq!(iterator.next().unwrap(), 0);
        // 4 + 8 + 8 * 2
        assert_eq!(iterator.peek(), 28);
        assert_eq!(
            iterator.render(0).unwrap(),
            "lookupswitch default @20\n  -1: @8\n  7: @12"
        );
    }

    #[test]
    fn branch_targets_are_absolute() {
        // goto at offset 2 with displacement -2 branches back to 0.
        let code = [0x00, 0x00, 0xA7, 0xFF, 0xFE];
        let iterator = CodeIterator::new(&code);
        assert_eq!(iterator.render(2).unwrap(), "goto @0");
    }

    #[test]
    fn unknown_opcode_is_corrupt() {
        let mut iterator = CodeIterator::new(&[0xD0]);
        match iterator.next() {
            Err(Error::Corrupt(CorruptKind::UnknownOpcode(0xD0))) => {}
            other => panic!("expected unknown opcode, got {:?}", other),
        }
    }

    #[test]
    fn wide_is_unsupported() {
        let mut iterator = CodeIterator::new(&[0xC4, 0x15, 0x01, 0x00]);
        match iterator.next() {
            Err(Error::Unsupported("wide")) => {}
            other => panic!("expected unsupported wide, got {:?}", other),
        }
    }

    #[test]
    fn next_past_end_is_an_error() {
        let mut iterator = CodeIterator::new(&[0xB1]);
        assert_eq!(iterator.next().unwrap(), 0);
        assert!(iterator.eof());
        assert!(iterator.next().is_err());
    }

    #[test]
    fn truncated_operand_is_corrupt() {
        // sipush missing its second operand byte still decodes a width, but
        // rendering reads past the end.
        let iterator = CodeIterator::new(&[0x11, 0x01]);
        match iterator.render(0) {
            Err(Error::Corrupt(CorruptKind::UnexpectedEof)) => {}
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[test]
    fn newarray_renders_element_type() {
        let iterator = CodeIterator::new(&[0xBC, 10]);
        assert_eq!(iterator.render(0).unwrap(), "newarray int[]");

        let bad = CodeIterator::new(&[0xBC, 13]);
        match bad.render(0) {
            Err(Error::Corrupt(CorruptKind::BadNewArrayType(13))) => {}
            other => panic!("expected bad newarray type, got {:?}", other),
        }
    }

    #[test]
    fn pool_references_render_bracketed() {
        let iterator = CodeIterator::new(&[0xB6, 0x00, 0x2A]);
        assert_eq!(iterator.render(0).unwrap(), "invokevirtual [42]");

        let iterator = CodeIterator::new(&[0x12, 0x07]);
        assert_eq!(iterator.render(0).unwrap(), "ldc [7]");
    }
}
