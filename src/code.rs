//! Method body relocation.
//!
//! Inserts hook calls into a method's bytecode and repairs every offset
//! that points into it: branch operands, switch tables, the exception
//! table, and the `StackMapTable`, `LineNumberTable` and local variable
//! tables nested in the `Code` attribute.
//!
//! Hook calls are `invokestatic` of `()V` methods, so they leave the operand
//! stack and locals untouched. That keeps every existing stack map frame
//! valid at its relocated offset and `max_stack` unchanged.

use crate::classfile::{
    Attribute, AttributeInfo, CodeAttribute, LineNumberEntry, LocalVariableEntry, StackMapFrame,
    VerificationTypeInfo,
};
use crate::weave::WeaveError;

pub const NOP: u8 = 0x00;
pub const IINC: u8 = 0x84;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const RETURN: u8 = 0xb1;
pub const INVOKESTATIC: u8 = 0xb8;
pub const WIDE: u8 = 0xc4;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

const MAX_CODE_LENGTH: usize = u16::MAX as usize;

/// Hook calls to insert into one method body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodePatch {
    /// `Methodref` indexes invoked, in order, before the first instruction.
    pub on_enter: Vec<u16>,
    /// `Methodref` indexes invoked, in order, before every return instruction.
    pub on_exit: Vec<u16>,
}

impl CodePatch {
    pub fn is_empty(&self) -> bool {
        self.on_enter.is_empty() && self.on_exit.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Instruction {
    pc: usize,
    len: usize,
    opcode: u8,
}

fn is_return(opcode: u8) -> bool {
    (IRETURN..=RETURN).contains(&opcode)
}

fn has_branch16(opcode: u8) -> bool {
    // if*, if_icmp*, if_acmp*, goto, jsr, ifnull, ifnonnull
    matches!(opcode, 0x99..=0xa8 | 0xc6 | 0xc7)
}

/// Padding after a switch opcode at `pc` so its operands are 4-byte aligned.
fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn fixed_length(opcode: u8) -> Option<usize> {
    let len = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        0x12 => 2,
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        0xa9 => 2,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        0xc6 | 0xc7 => 3,
        GOTO_W | JSR_W => 5,
        _ => return None,
    };
    Some(len)
}

fn read_i16(code: &[u8], at: usize) -> Result<i16, WeaveError> {
    code.get(at..at + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or(WeaveError::Truncated(at))
}

fn read_i32(code: &[u8], at: usize) -> Result<i32, WeaveError> {
    code.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(WeaveError::Truncated(at))
}

fn instruction_length(code: &[u8], pc: usize) -> Result<usize, WeaveError> {
    let opcode = code[pc];
    let len = match opcode {
        TABLESWITCH => {
            let base = pc + 1 + switch_padding(pc);
            let low = read_i32(code, base + 4)? as i64;
            let high = read_i32(code, base + 8)? as i64;
            if high < low {
                return Err(WeaveError::MalformedSwitch(pc));
            }
            (base - pc) + 12 + 4 * (high - low + 1) as usize
        }
        LOOKUPSWITCH => {
            let base = pc + 1 + switch_padding(pc);
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 {
                return Err(WeaveError::MalformedSwitch(pc));
            }
            (base - pc) + 8 + 8 * npairs as usize
        }
        WIDE => match code.get(pc + 1) {
            Some(&IINC) => 6,
            Some(_) => 4,
            None => return Err(WeaveError::Truncated(pc)),
        },
        _ => fixed_length(opcode).ok_or(WeaveError::UnknownOpcode { opcode, pc })?,
    };
    if pc + len > code.len() {
        return Err(WeaveError::Truncated(pc));
    }
    Ok(len)
}

fn decode(code: &[u8]) -> Result<Vec<Instruction>, WeaveError> {
    let mut insns = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let len = instruction_length(code, pc)?;
        insns.push(Instruction { pc, len, opcode: code[pc] });
        pc += len;
    }
    Ok(insns)
}

/// Offsets of every instruction in `code`, in order.
pub fn instruction_offsets(code: &[u8]) -> Result<Vec<usize>, WeaveError> {
    Ok(decode(code)?.into_iter().map(|insn| insn.pc).collect())
}

/// Where each original instruction lands in the rewritten body.
struct Layout {
    old_len: usize,
    new_len: usize,
    /// Old pc -> index into `start`, only set at instruction boundaries.
    index: Vec<Option<usize>>,
    /// New offset of the first byte emitted for each instruction, including
    /// any exit hook calls placed in front of it.
    start: Vec<usize>,
    /// New offset of the instruction itself.
    new_pc: Vec<usize>,
}

impl Layout {
    fn compute(insns: &[Instruction], old_len: usize, prologue: usize, exit_len: usize) -> Self {
        let mut index = vec![None; old_len];
        let mut start = Vec::with_capacity(insns.len());
        let mut new_pc = Vec::with_capacity(insns.len());
        let mut pos = prologue;

        for (i, insn) in insns.iter().enumerate() {
            index[insn.pc] = Some(i);
            start.push(pos);
            if is_return(insn.opcode) {
                pos += exit_len;
            }
            new_pc.push(pos);
            pos += match insn.opcode {
                TABLESWITCH | LOOKUPSWITCH => insn.len - switch_padding(insn.pc) + switch_padding(pos),
                _ => insn.len,
            };
        }

        Layout { old_len, new_len: pos, index, start, new_pc }
    }

    /// Maps an old offset to the new one. Jumps to a return land on the exit
    /// hook calls in front of it; the end of the code maps to the new end.
    fn map(&self, old: usize) -> Option<usize> {
        if old == self.old_len {
            return Some(self.new_len);
        }
        self.index.get(old).copied().flatten().map(|i| self.start[i])
    }

    fn map_u16(&self, at: usize, old: u16) -> Result<u16, WeaveError> {
        self.map(old as usize)
            .map(|new| new as u16)
            .ok_or(WeaveError::InvalidBranchTarget { pc: at, target: old as i64 })
    }

    fn branch_target(&self, pc: usize, offset: i64) -> Result<usize, WeaveError> {
        let target = pc as i64 + offset;
        if target < 0 || target >= self.old_len as i64 {
            return Err(WeaveError::InvalidBranchTarget { pc, target });
        }
        self.map(target as usize)
            .ok_or(WeaveError::InvalidBranchTarget { pc, target })
    }
}

fn push_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn hook_calls(refs: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(refs.len() * 3);
    for &r in refs {
        out.push(INVOKESTATIC);
        push_u2(&mut out, r);
    }
    out
}

/// Rewrites a `Code` attribute body with the hook calls in `patch`.
///
/// Returns the new attribute info (everything after the 6-byte attribute
/// header). `class_bytes` supplies the raw bytes of nested attributes that
/// are carried over unchanged.
pub fn rewrite_code(code: &CodeAttribute, class_bytes: &[u8], patch: &CodePatch) -> Result<Vec<u8>, WeaveError> {
    let insns = decode(&code.code)?;

    let mut prologue = hook_calls(&patch.on_enter);
    // Keep the original body at the same offset modulo 4 so no switch
    // padding changes merely because of the prologue.
    while prologue.len() % 4 != 0 {
        prologue.push(NOP);
    }
    let exit = hook_calls(&patch.on_exit);

    let layout = Layout::compute(&insns, code.code.len(), prologue.len(), exit.len());
    if layout.new_len > MAX_CODE_LENGTH {
        return Err(WeaveError::CodeTooLarge(layout.new_len));
    }

    let mut body = Vec::with_capacity(layout.new_len);
    body.extend_from_slice(&prologue);
    for (i, insn) in insns.iter().enumerate() {
        if is_return(insn.opcode) {
            body.extend_from_slice(&exit);
        }
        debug_assert_eq!(body.len(), layout.new_pc[i]);
        emit_instruction(&mut body, &code.code, insn, layout.new_pc[i], &layout)?;
    }

    let mut out = Vec::with_capacity(body.len() + 64);
    push_u2(&mut out, code.max_stack);
    push_u2(&mut out, code.max_locals);
    push_u4(&mut out, body.len() as u32);
    out.extend_from_slice(&body);

    push_u2(&mut out, code.exception_table.len() as u16);
    for entry in &code.exception_table {
        push_u2(&mut out, layout.map_u16(entry.start_pc as usize, entry.start_pc)?);
        push_u2(&mut out, layout.map_u16(entry.end_pc as usize, entry.end_pc)?);
        push_u2(&mut out, layout.map_u16(entry.handler_pc as usize, entry.handler_pc)?);
        push_u2(&mut out, entry.catch_type);
    }

    let kept: Vec<&Attribute> = code
        .attributes
        .iter()
        .filter(|attr| {
            !matches!(
                attr.info,
                AttributeInfo::RuntimeVisibleTypeAnnotations | AttributeInfo::RuntimeInvisibleTypeAnnotations
            )
        })
        .collect();
    push_u2(&mut out, kept.len() as u16);
    for attr in kept {
        let info = match &attr.info {
            AttributeInfo::StackMapTable(table) => relocate_frames(&table.entries, &layout)?,
            AttributeInfo::LineNumberTable { entries } => relocate_line_numbers(entries, &layout)?,
            AttributeInfo::LocalVariableTable { entries } | AttributeInfo::LocalVariableTypeTable { entries } => {
                relocate_local_variables(entries, &layout)?
            }
            _ => {
                let raw = class_bytes
                    .get(attr.span.clone())
                    .ok_or(WeaveError::Truncated(attr.span.start))?;
                out.extend_from_slice(raw);
                continue;
            }
        };
        push_u2(&mut out, attr.name_index);
        push_u4(&mut out, info.len() as u32);
        out.extend_from_slice(&info);
    }

    Ok(out)
}

fn emit_instruction(
    out: &mut Vec<u8>,
    code: &[u8],
    insn: &Instruction,
    new_pc: usize,
    layout: &Layout,
) -> Result<(), WeaveError> {
    let pc = insn.pc;
    match insn.opcode {
        op if has_branch16(op) => {
            let target = layout.branch_target(pc, read_i16(code, pc + 1)? as i64)?;
            let rel = i16::try_from(target as i64 - new_pc as i64).map_err(|_| WeaveError::BranchOverflow { pc })?;
            out.push(op);
            out.extend_from_slice(&rel.to_be_bytes());
        }
        GOTO_W | JSR_W => {
            let target = layout.branch_target(pc, read_i32(code, pc + 1)? as i64)?;
            out.push(insn.opcode);
            out.extend_from_slice(&((target as i64 - new_pc as i64) as i32).to_be_bytes());
        }
        TABLESWITCH | LOOKUPSWITCH => {
            let base = pc + 1 + switch_padding(pc);
            let relocate = |at: usize| -> Result<[u8; 4], WeaveError> {
                let target = layout.branch_target(pc, read_i32(code, at)? as i64)?;
                Ok(((target as i64 - new_pc as i64) as i32).to_be_bytes())
            };

            out.push(insn.opcode);
            out.resize(out.len() + switch_padding(new_pc), 0);
            out.extend_from_slice(&relocate(base)?);

            if insn.opcode == TABLESWITCH {
                let low = read_i32(code, base + 4)?;
                let high = read_i32(code, base + 8)?;
                out.extend_from_slice(&code[base + 4..base + 12]);
                for j in 0..=(high as i64 - low as i64) as usize {
                    out.extend_from_slice(&relocate(base + 12 + 4 * j)?);
                }
            } else {
                let npairs = read_i32(code, base + 4)? as usize;
                out.extend_from_slice(&code[base + 4..base + 8]);
                for j in 0..npairs {
                    let pair = base + 8 + 8 * j;
                    out.extend_from_slice(&code[pair..pair + 4]);
                    out.extend_from_slice(&relocate(pair + 4)?);
                }
            }
        }
        _ => out.extend_from_slice(&code[pc..pc + insn.len]),
    }
    Ok(())
}

fn relocate_line_numbers(entries: &[LineNumberEntry], layout: &Layout) -> Result<Vec<u8>, WeaveError> {
    let mut out = Vec::with_capacity(2 + entries.len() * 4);
    push_u2(&mut out, entries.len() as u16);
    for entry in entries {
        push_u2(&mut out, layout.map_u16(entry.start_pc as usize, entry.start_pc)?);
        push_u2(&mut out, entry.line_number);
    }
    Ok(out)
}

fn relocate_local_variables(entries: &[LocalVariableEntry], layout: &Layout) -> Result<Vec<u8>, WeaveError> {
    let mut out = Vec::with_capacity(2 + entries.len() * 10);
    push_u2(&mut out, entries.len() as u16);
    for entry in entries {
        let end = entry.start_pc as usize + entry.length as usize;
        let new_start = layout.map_u16(entry.start_pc as usize, entry.start_pc)?;
        let new_end = layout
            .map(end)
            .ok_or(WeaveError::InvalidBranchTarget { pc: entry.start_pc as usize, target: end as i64 })?;
        push_u2(&mut out, new_start);
        push_u2(&mut out, (new_end - new_start as usize) as u16);
        push_u2(&mut out, entry.name_index);
        push_u2(&mut out, entry.descriptor_index);
        push_u2(&mut out, entry.index);
    }
    Ok(out)
}

fn relocate_frames(frames: &[StackMapFrame], layout: &Layout) -> Result<Vec<u8>, WeaveError> {
    let mut out = Vec::new();
    push_u2(&mut out, frames.len() as u16);

    // Frame offsets are deltas: the first is absolute, each later one is
    // `previous + delta + 1`.
    let mut old_offset: i64 = -1;
    let mut new_offset: i64 = -1;
    for frame in frames {
        old_offset += frame.offset_delta() as i64 + 1;
        let mapped = layout
            .map(old_offset as usize)
            .ok_or(WeaveError::InvalidBranchTarget { pc: old_offset as usize, target: old_offset })?
            as i64;
        let delta = (mapped - new_offset - 1) as u16;
        new_offset = mapped;
        write_frame(&mut out, frame, delta, layout)?;
    }
    Ok(out)
}

fn write_frame(out: &mut Vec<u8>, frame: &StackMapFrame, delta: u16, layout: &Layout) -> Result<(), WeaveError> {
    match frame {
        StackMapFrame::Same { .. } if delta <= 63 => out.push(delta as u8),
        StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => {
            out.push(251);
            push_u2(out, delta);
        }
        StackMapFrame::SameLocals1StackItem { stack, .. } | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => {
            if delta <= 63 {
                out.push(64 + delta as u8);
            } else {
                out.push(247);
                push_u2(out, delta);
            }
            write_verification_type(out, stack, layout)?;
        }
        StackMapFrame::Chop { k, .. } => {
            out.push(251 - k);
            push_u2(out, delta);
        }
        StackMapFrame::Append { locals, .. } => {
            out.push(251 + locals.len() as u8);
            push_u2(out, delta);
            for local in locals {
                write_verification_type(out, local, layout)?;
            }
        }
        StackMapFrame::Full { locals, stack, .. } => {
            out.push(255);
            push_u2(out, delta);
            push_u2(out, locals.len() as u16);
            for local in locals {
                write_verification_type(out, local, layout)?;
            }
            push_u2(out, stack.len() as u16);
            for item in stack {
                write_verification_type(out, item, layout)?;
            }
        }
    }
    Ok(())
}

fn write_verification_type(out: &mut Vec<u8>, info: &VerificationTypeInfo, layout: &Layout) -> Result<(), WeaveError> {
    match *info {
        VerificationTypeInfo::Top => out.push(0),
        VerificationTypeInfo::Integer => out.push(1),
        VerificationTypeInfo::Float => out.push(2),
        VerificationTypeInfo::Double => out.push(3),
        VerificationTypeInfo::Long => out.push(4),
        VerificationTypeInfo::Null => out.push(5),
        VerificationTypeInfo::UninitializedThis => out.push(6),
        VerificationTypeInfo::Object(index) => {
            out.push(7);
            push_u2(out, index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            out.push(8);
            push_u2(out, layout.map_u16(offset as usize, offset)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wide_and_switch_lengths() {
        // 0: wide iinc 1 1000   (6 bytes)
        // 6: wide iload 300     (4 bytes)
        // 10: lookupswitch, pad 1, default, npairs=1, one pair
        let mut code = vec![WIDE, IINC, 0, 1, 0x03, 0xe8, WIDE, 0x15, 0x01, 0x2c];
        code.push(LOOKUPSWITCH);
        code.push(0); // pad to offset 12
        code.extend_from_slice(&18i32.to_be_bytes()); // default -> 28
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&7i32.to_be_bytes());
        code.extend_from_slice(&18i32.to_be_bytes());
        code.push(RETURN); // 28

        assert_eq!(instruction_offsets(&code).unwrap(), vec![0, 6, 10, 28]);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let err = instruction_offsets(&[NOP, 0xcb]).unwrap_err();
        assert!(matches!(err, WeaveError::UnknownOpcode { opcode: 0xcb, pc: 1 }));
    }

    #[test]
    fn rejects_truncated_instructions() {
        let err = instruction_offsets(&[0x11, 0x00]).unwrap_err();
        assert!(matches!(err, WeaveError::Truncated(0)));
    }

    #[test]
    fn switch_padding_follows_alignment() {
        assert_eq!(switch_padding(0), 3);
        assert_eq!(switch_padding(3), 0);
        assert_eq!(switch_padding(5), 2);
    }

    #[test]
    fn jumps_onto_a_return_land_on_its_exit_hooks() {
        // 0: iload_0; 1: ifeq +4 (-> 5); 4: nop; 5: return
        let insns = decode(&[0x1a, 0x99, 0x00, 0x04, NOP, RETURN]).unwrap();
        let layout = Layout::compute(&insns, 6, 4, 3);
        assert_eq!(layout.map(0), Some(4));
        assert_eq!(layout.map(5), Some(9));
        assert_eq!(layout.new_pc[3], 12);
        assert_eq!(layout.map(6), Some(13));
        assert_eq!(layout.map(2), None);
    }
}
