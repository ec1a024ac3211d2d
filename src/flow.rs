//! Basic-block control flow reconstructed from code and stack map frames.
//!
//! Stack map frames are delta encoded: each frame states how the locals and
//! operand stack change relative to the previous frame, and where in the
//! code it applies via an offset delta. `AbsoluteStackMapFrame` is the
//! resolved form. The graph builder seeds one block per frame, splits blocks
//! that contain branch instructions mid-body, and then wires successor and
//! predecessor edges.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::class::attribute::{CodeAttribute, StackMapFrame, VerificationType};
use crate::error::{CorruptKind, Result};
use crate::instruction::{opcode, CodeIterator};

/// A stack map frame resolved to an absolute code offset.
///
/// Locals are shared behind an `Arc`: the Same-family frames reuse the
/// previous frame's locals unchanged, which dominates real stack map tables.
#[derive(Debug, Clone)]
pub struct AbsoluteStackMapFrame {
    start: u32,
    locals: Arc<Vec<VerificationType>>,
    stack: Vec<VerificationType>,
}

impl AbsoluteStackMapFrame {
    /// The implicit frame at the start of a method: offset 0, no locals, no
    /// stack.
    pub fn initial() -> Self {
        AbsoluteStackMapFrame {
            start: 0,
            locals: Arc::new(Vec::new()),
            stack: Vec::new(),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn locals(&self) -> &[VerificationType] {
        &self.locals
    }

    pub fn stack(&self) -> &[VerificationType] {
        &self.stack
    }

    /// The same frame shape re-anchored at a different offset, sharing
    /// locals with the original.
    fn at(&self, start: u32) -> AbsoluteStackMapFrame {
        AbsoluteStackMapFrame {
            start,
            locals: Arc::clone(&self.locals),
            stack: self.stack.clone(),
        }
    }
}

/// The first frame's offset is relative to the method start; every later
/// frame is relative to the byte after the previous frame's offset.
fn apply_offset_delta(start: u32, offset_delta: u16) -> u32 {
    start + offset_delta as u32 + if start == 0 { 0 } else { 1 }
}

impl StackMapFrame {
    /// Resolves this delta against the previous absolute frame.
    ///
    /// Chop, Same, and Append leave the operand stack empty.
    pub fn apply(&self, previous: &AbsoluteStackMapFrame) -> Result<AbsoluteStackMapFrame> {
        let start = apply_offset_delta(previous.start, self.offset_delta());
        Ok(match self {
            StackMapFrame::Same { .. } => AbsoluteStackMapFrame {
                start,
                locals: Arc::clone(&previous.locals),
                stack: Vec::new(),
            },
            StackMapFrame::SameLocals1StackItem { stack, .. } => AbsoluteStackMapFrame {
                start,
                locals: Arc::clone(&previous.locals),
                stack: vec![*stack],
            },
            StackMapFrame::Chop { chopped, .. } => {
                let retained = previous
                    .locals
                    .len()
                    .checked_sub(*chopped as usize)
                    .ok_or(CorruptKind::ChopUnderflow)?;
                AbsoluteStackMapFrame {
                    start,
                    locals: Arc::new(previous.locals[..retained].to_vec()),
                    stack: Vec::new(),
                }
            }
            StackMapFrame::Append { locals, .. } => {
                let mut combined = Vec::with_capacity(previous.locals.len() + locals.len());
                combined.extend_from_slice(&previous.locals);
                combined.extend_from_slice(locals);
                AbsoluteStackMapFrame {
                    start,
                    locals: Arc::new(combined),
                    stack: Vec::new(),
                }
            }
            StackMapFrame::Full { locals, stack, .. } => AbsoluteStackMapFrame {
                start,
                locals: Arc::new(locals.clone()),
                stack: stack.clone(),
            },
        })
    }
}

/// A maximal straight-line run of instructions: entered at `start`, exited
/// at the instruction before `end` by branch or fallthrough.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    frame: AbsoluteStackMapFrame,
    end: u32,
    successors: Vec<u32>,
    predecessors: Vec<u32>,
}

impl BasicBlock {
    fn new(frame: AbsoluteStackMapFrame, end: u32) -> Self {
        BasicBlock {
            frame,
            end,
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn start(&self) -> u32 {
        self.frame.start()
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn frame(&self) -> &AbsoluteStackMapFrame {
        &self.frame
    }

    /// Start offsets of blocks this block can transfer control to.
    pub fn successors(&self) -> &[u32] {
        &self.successors
    }

    /// Start offsets of blocks that can transfer control here.
    pub fn predecessors(&self) -> &[u32] {
        &self.predecessors
    }
}

/// Conditional and unconditional transfers, `jsr`, `ret`, `ifnull`, and
/// `ifnonnull`.
fn is_branch(op: u8) -> bool {
    (opcode::IFEQ..=opcode::RET).contains(&op) || op == opcode::IFNULL || op == opcode::IFNONNULL
}

fn branch_target16(iterator: &CodeIterator<'_>, index: u32) -> Result<u32> {
    Ok((index as i64 + iterator.read_i16(index + 1)? as i64) as u32)
}

fn branch_target32(iterator: &CodeIterator<'_>, index: u32) -> Result<u32> {
    Ok((index as i64 + iterator.read_i32(index + 1)? as i64) as u32)
}

/// Successor offsets of the instruction at `index`, with the iterator
/// positioned just past it (the fallthrough offset).
fn successors(iterator: &CodeIterator<'_>, index: u32) -> Result<Vec<u32>> {
    use opcode::*;

    let op = iterator.byte_at(index)?;
    Ok(match op {
        GOTO => vec![branch_target16(iterator, index)?],
        GOTO_W => vec![branch_target32(iterator, index)?],
        JSR => vec![branch_target16(iterator, index)?, index + 3],
        JSR_W => vec![branch_target32(iterator, index)?, index + 5],
        IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
            vec![branch_target16(iterator, index)?, index + 3]
        }
        IRETURN..=RETURN | ATHROW => Vec::new(),
        TABLESWITCH => {
            let padded = (index + 4) & !3;
            let low = iterator.read_i32(padded + 4)? as i64;
            let high = iterator.read_i32(padded + 8)? as i64;
            let mut targets = vec![(index as i64 + iterator.read_i32(padded)? as i64) as u32];
            for i in 0..(high - low + 1).max(0) {
                let offset = iterator.read_i32(padded + 12 + i as u32 * 4)? as i64;
                targets.push((index as i64 + offset) as u32);
            }
            targets
        }
        LOOKUPSWITCH => {
            let padded = (index + 4) & !3;
            let npairs = iterator.read_i32(padded + 4)?.max(0) as u32;
            let mut targets = vec![(index as i64 + iterator.read_i32(padded)? as i64) as u32];
            for i in 0..npairs {
                let offset = iterator.read_i32(padded + 12 + i * 8)? as i64;
                targets.push((index as i64 + offset) as u32);
            }
            targets
        }
        _ => vec![iterator.peek()],
    })
}

/// Map from block start offset to basic block, sorted by start.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    blocks: BTreeMap<u32, BasicBlock>,
}

impl ControlFlowGraph {
    /// Builds the graph for a Code attribute.
    ///
    /// Without a StackMapTable the whole code array is one block with no
    /// edges. With one, blocks are seeded from the decoded absolute frames,
    /// split after every branch instruction that ends mid-block, and then
    /// linked.
    pub fn build(code: &CodeAttribute) -> Result<ControlFlowGraph> {
        let code_len = code.code().len() as u32;
        let mut blocks = BTreeMap::new();

        let table = match code.stack_map() {
            None => {
                blocks.insert(0, BasicBlock::new(AbsoluteStackMapFrame::initial(), code_len));
                return Ok(ControlFlowGraph { blocks });
            }
            Some(table) => table,
        };

        // Seed one block per absolute frame; each ends where the next frame
        // starts. A frame landing on an already-seeded start replaces that
        // block.
        let mut frame = AbsoluteStackMapFrame::initial();
        for entry in table.entries() {
            let next = entry.apply(&frame)?;
            blocks.insert(frame.start(), BasicBlock::new(frame, next.start()));
            frame = next;
        }
        blocks.insert(frame.start(), BasicBlock::new(frame, code_len));

        // Walk each block; a branch instruction that ends before the block
        // does forces a split at the next instruction.
        let mut iterator = code.iterator();
        let mut worklist: VecDeque<u32> = blocks.keys().copied().collect();
        while let Some(start) = worklist.pop_front() {
            let block_end = match blocks.get(&start) {
                Some(block) => block.end(),
                None => continue,
            };

            iterator.move_to(start);
            let mut last = None;
            let mut split = None;
            while !iterator.eof() && iterator.peek() < block_end {
                let index = iterator.next()?;
                last = Some(index);
                if !is_branch(iterator.byte_at(index)?) {
                    continue;
                }

                let next_index = iterator.peek();
                if next_index < block_end {
                    split = Some(next_index);
                    break;
                }
            }

            if let Some(split_at) = split {
                let parent = blocks
                    .get_mut(&start)
                    .ok_or(CorruptKind::UnexpectedEof)?;
                let child_frame = parent.frame.at(split_at);
                parent.end = split_at;
                blocks.insert(split_at, BasicBlock::new(child_frame, block_end));
                worklist.push_back(split_at);
            }

            let block_successors = match last {
                Some(index) => successors(&iterator, index)?,
                None => Vec::new(),
            };
            if let Some(block) = blocks.get_mut(&start) {
                block.successors = block_successors;
            }
        }

        // Reverse edges.
        let mut edges = Vec::new();
        for (start, block) in &blocks {
            for successor in &block.successors {
                edges.push((*successor, *start));
            }
        }
        for (successor, start) in edges {
            if let Some(block) = blocks.get_mut(&successor) {
                block.predecessors.push(start);
            }
        }

        Ok(ControlFlowGraph { blocks })
    }

    pub fn blocks(&self) -> impl Iterator<Item = (u32, &BasicBlock)> {
        self.blocks.iter().map(|(start, block)| (*start, block))
    }

    pub fn get(&self, start: u32) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Renders each block with its instruction listing.
    pub fn render(&self, code: &CodeAttribute) -> Result<String> {
        let mut iterator = code.iterator();
        let mut result = String::from("Control Flow Graph:");
        for (start, block) in &self.blocks {
            let _ = write!(result, "\n  Block {}:", start);
            iterator.move_to(*start);
            while !iterator.eof() && iterator.peek() < block.end() {
                let index = iterator.next()?;
                let text = iterator.render(index)?;
                let _ = write!(result, "\n    {}: {}", index, text.replace('\n', "\n    "));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::class::attribute::AttributeInfo;
    use crate::class::constant::tests::{pool_bytes, utf8_entry};
    use crate::class::constant::ConstantPool;

    fn test_pool() -> ConstantPool {
        let bytes = pool_bytes(3, &[&utf8_entry("Code"), &utf8_entry("StackMapTable")]);
        ConstantPool::read(&mut Cursor::new(bytes)).unwrap()
    }

    /// Builds a Code attribute from raw code bytes and optional stack map
    /// frame payloads.
    fn code_attribute(code: &[u8], frames: Option<&[&[u8]]>) -> CodeAttribute {
        let mut nested = Vec::new();
        match frames {
            None => nested.extend_from_slice(&0u16.to_be_bytes()),
            Some(frames) => {
                nested.extend_from_slice(&1u16.to_be_bytes());
                nested.extend_from_slice(&2u16.to_be_bytes()); // name: StackMapTable
                let mut payload = (frames.len() as u16).to_be_bytes().to_vec();
                for frame in frames {
                    payload.extend_from_slice(frame);
                }
                nested.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                nested.extend_from_slice(&payload);
            }
        }

        let mut attr_payload = Vec::new();
        attr_payload.extend_from_slice(&4u16.to_be_bytes()); // max_stack
        attr_payload.extend_from_slice(&4u16.to_be_bytes()); // max_locals
        attr_payload.extend_from_slice(&(code.len() as u32).to_be_bytes());
        attr_payload.extend_from_slice(code);
        attr_payload.extend_from_slice(&0u16.to_be_bytes()); // exception table
        attr_payload.extend_from_slice(&nested);

        let mut bytes = 1u16.to_be_bytes().to_vec();
        bytes.extend_from_slice(&1u16.to_be_bytes()); // name: Code
        bytes.extend_from_slice(&(attr_payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&attr_payload);

        let attributes =
            AttributeInfo::read_list(&mut Cursor::new(bytes), &test_pool()).unwrap();
        match attributes.into_iter().next() {
            Some(AttributeInfo::Code(code)) => code,
            other => panic!("expected code attribute, got {:?}", other),
        }
    }

    #[test]
    fn no_stack_map_is_a_single_block() {
        let code = code_attribute(&[0x03, 0x3B, 0xB1], None); // iconst_0; istore_0; return
        let cfg = code.cfg().unwrap();
        assert_eq!(cfg.len(), 1);
        let block = cfg.get(0).unwrap();
        assert_eq!(block.start(), 0);
        assert_eq!(block.end(), 3);
        assert!(block.successors().is_empty());
        assert!(block.predecessors().is_empty());
        assert!(block.frame().locals().is_empty());
        assert!(block.frame().stack().is_empty());
    }

    #[test]
    fn self_loop_goto() {
        // goto 0 at offset 0 with a Same frame at delta 0.
        let code = code_attribute(&[0xA7, 0x00, 0x00], Some(&[&[0u8]]));
        let cfg = code.cfg().unwrap();
        assert_eq!(cfg.len(), 1);
        let block = cfg.get(0).unwrap();
        assert_eq!(block.start(), 0);
        assert_eq!(block.end(), 3);
        assert_eq!(block.successors(), &[0]);
        assert_eq!(block.predecessors(), &[0]);
    }

    #[test]
    fn conditional_splits_and_links() {
        // 0: iload_0
        // 1: ifeq +5  -> @6
        // 4: iconst_1
        // 5: ireturn
        // 6: iconst_0
        // 7: ireturn
        let code_bytes = [0x1A, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x03, 0xAC];
        // Frames at 4 (Same, delta 4) and 6 (Same, delta 1).
        let code = code_attribute(&code_bytes, Some(&[&[4u8], &[1u8]]));
        let cfg = code.cfg().unwrap();

        let starts: Vec<u32> = cfg.blocks().map(|(start, _)| start).collect();
        assert_eq!(starts, vec![0, 4, 6]);

        let entry = cfg.get(0).unwrap();
        assert_eq!(entry.end(), 4);
        let mut successors = entry.successors().to_vec();
        successors.sort_unstable();
        assert_eq!(successors, vec![4, 6]);

        let fallthrough = cfg.get(4).unwrap();
        assert_eq!(fallthrough.end(), 6);
        assert!(fallthrough.successors().is_empty());
        assert_eq!(fallthrough.predecessors(), &[0]);

        let target = cfg.get(6).unwrap();
        assert_eq!(target.end(), 8);
        assert!(target.successors().is_empty());
        assert_eq!(target.predecessors(), &[0]);

        // Block intervals partition [0, code.len()).
        let mut position = 0;
        for (start, block) in cfg.blocks() {
            assert_eq!(start, position);
            assert!(block.end() > start);
            position = block.end();
        }
        assert_eq!(position, code_bytes.len() as u32);
    }

    #[test]
    fn branch_mid_block_forces_split() {
        // The only frame sits at the branch target, so the seeded entry
        // block spans [0, 6) and contains the conditional at 1; it must be
        // split at the following instruction.
        // 0: iload_0
        // 1: ifeq +5 -> @6
        // 4: iconst_1
        // 5: ireturn
        // 6: iconst_0
        // 7: ireturn
        let code_bytes = [0x1A, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x03, 0xAC];
        let code = code_attribute(&code_bytes, Some(&[&[251u8, 0, 6]])); // SameExtended at 6
        let cfg = code.cfg().unwrap();

        let starts: Vec<u32> = cfg.blocks().map(|(start, _)| start).collect();
        assert_eq!(starts, vec![0, 4, 6]);
        assert_eq!(cfg.get(0).unwrap().end(), 4);
        let mut successors = cfg.get(0).unwrap().successors().to_vec();
        successors.sort_unstable();
        assert_eq!(successors, vec![4, 6]);
        // The split block inherits the parent frame re-anchored at 4.
        let split = cfg.get(4).unwrap();
        assert_eq!(split.frame().start(), 4);
        assert_eq!(split.end(), 6);
        assert_eq!(split.predecessors(), &[0]);
    }

    #[test]
    fn fallthrough_block_links_to_next() {
        // 0: iconst_0
        // 1: istore_1   (frame boundary at 2 without a branch)
        // 2: return
        let code = code_attribute(&[0x03, 0x3C, 0xB1], Some(&[&[2u8]]));
        let cfg = code.cfg().unwrap();
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.get(0).unwrap().successors(), &[2]);
        assert_eq!(cfg.get(2).unwrap().predecessors(), &[0]);
        assert!(cfg.get(2).unwrap().successors().is_empty());
    }

    #[test]
    fn render_lists_block_instructions() {
        let code = code_attribute(&[0x03, 0x3C, 0xB1], Some(&[&[2u8]]));
        let cfg = code.cfg().unwrap();
        let text = cfg.render(&code).unwrap();
        assert_eq!(
            text,
            "Control Flow Graph:\n  Block 0:\n    0: iconst_0\n    1: istore_1\n  Block 2:\n    2: return"
        );
    }

    #[test]
    fn frame_application_deltas() {
        let initial = AbsoluteStackMapFrame::initial();

        // First frame: no +1 adjustment.
        let first = StackMapFrame::Same { offset_delta: 0 }.apply(&initial).unwrap();
        assert_eq!(first.start(), 0);

        let first = StackMapFrame::Same { offset_delta: 5 }.apply(&initial).unwrap();
        assert_eq!(first.start(), 5);

        // Subsequent frames add one.
        let second = StackMapFrame::Same { offset_delta: 3 }.apply(&first).unwrap();
        assert_eq!(second.start(), 9);

        let third = StackMapFrame::Append {
            offset_delta: 0,
            locals: vec![VerificationType::Integer, VerificationType::Long],
        }
        .apply(&second)
        .unwrap();
        assert_eq!(third.start(), 10);
        assert_eq!(
            third.locals(),
            &[VerificationType::Integer, VerificationType::Long]
        );
        assert!(third.stack().is_empty());

        let fourth = StackMapFrame::Chop {
            offset_delta: 0,
            chopped: 1,
        }
        .apply(&third)
        .unwrap();
        assert_eq!(fourth.locals(), &[VerificationType::Integer]);

        // Chopping everything is allowed; chopping more is not.
        let emptied = StackMapFrame::Chop {
            offset_delta: 0,
            chopped: 1,
        }
        .apply(&fourth)
        .unwrap();
        assert!(emptied.locals().is_empty());

        let err = StackMapFrame::Chop {
            offset_delta: 0,
            chopped: 1,
        }
        .apply(&emptied)
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Corrupt(CorruptKind::ChopUnderflow)
        ));
    }

    #[test]
    fn same_frames_share_locals() {
        let base = StackMapFrame::Full {
            offset_delta: 0,
            locals: vec![VerificationType::Integer],
            stack: vec![],
        }
        .apply(&AbsoluteStackMapFrame::initial())
        .unwrap();

        let next = StackMapFrame::Same { offset_delta: 4 }.apply(&base).unwrap();
        assert!(Arc::ptr_eq(&base.locals, &next.locals));

        let with_stack = StackMapFrame::SameLocals1StackItem {
            offset_delta: 2,
            stack: VerificationType::Null,
        }
        .apply(&next)
        .unwrap();
        assert!(Arc::ptr_eq(&next.locals, &with_stack.locals));
        assert_eq!(with_stack.stack(), &[VerificationType::Null]);
    }

    #[test]
    fn switch_successors_enumerated() {
        // tableswitch at 0, payload aligned at 4, occupying [0, 24):
        // default @28, case 0 @24, case 1 @26.
        let mut code_bytes = vec![0xAA, 0x00, 0x00, 0x00];
        code_bytes.extend_from_slice(&28i32.to_be_bytes()); // default
        code_bytes.extend_from_slice(&0i32.to_be_bytes()); // low
        code_bytes.extend_from_slice(&1i32.to_be_bytes()); // high
        code_bytes.extend_from_slice(&24i32.to_be_bytes()); // case 0
        code_bytes.extend_from_slice(&26i32.to_be_bytes()); // case 1
        code_bytes.extend_from_slice(&[0x03, 0xAC]); // 24: iconst_0; ireturn
        code_bytes.extend_from_slice(&[0x04, 0xAC]); // 26: iconst_1; ireturn
        code_bytes.push(0xB1); // 28: return

        // Frames at 24, 26, 28.
        let code = code_attribute(
            &code_bytes,
            Some(&[&[251u8, 0, 24], &[1u8], &[1u8]]),
        );
        let cfg = code.cfg().unwrap();

        let starts: Vec<u32> = cfg.blocks().map(|(start, _)| start).collect();
        assert_eq!(starts, vec![0, 24, 26, 28]);

        let entry = cfg.get(0).unwrap();
        let mut successors = entry.successors().to_vec();
        successors.sort_unstable();
        assert_eq!(successors, vec![24, 26, 28]);
        assert_eq!(cfg.get(24).unwrap().predecessors(), &[0]);
        assert_eq!(cfg.get(26).unwrap().predecessors(), &[0]);
        assert_eq!(cfg.get(28).unwrap().predecessors(), &[0]);
    }
}
