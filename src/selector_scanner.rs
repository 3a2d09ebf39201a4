//! Function selector recovery from deployed bytecode.

use alloy::primitives::Selector;

const OP_EQ: u8 = 0x14;
const OP_JUMPI: u8 = 0x57;
const OP_PUSH1: u8 = 0x60;
const OP_PUSH4: u8 = 0x63;
const OP_PUSH32: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Instruction<'a> {
    op: u8,
    immediate: &'a [u8],
}

fn is_push(op: u8) -> bool {
    (OP_PUSH1..=OP_PUSH32).contains(&op)
}

/// Linear disassembly. PUSH immediates are consumed so their bytes are never read as opcodes;
/// a PUSH whose immediate runs past the end of the code ends the stream.
fn disassemble(code: &[u8]) -> Vec<Instruction<'_>> {
    let mut out = Vec::with_capacity(code.len() / 2);
    let mut pc = 0usize;
    while pc < code.len() {
        let op = code[pc];
        if is_push(op) {
            let width = (op - OP_PUSH1) as usize + 1;
            let end = pc + 1 + width;
            if end > code.len() {
                break;
            }
            out.push(Instruction {
                op,
                immediate: &code[pc + 1..end],
            });
            pc = end;
            continue;
        }
        out.push(Instruction { op, immediate: &[] });
        pc += 1;
    }
    out
}

/// Selectors compared by the dispatcher (`PUSH4 sel; EQ; PUSHn dest; JUMPI`), in order of
/// first appearance. Code without that idiom yields nothing.
pub fn scan_selectors(code: &[u8]) -> Vec<Selector> {
    let instructions = disassemble(code);
    let mut selectors: Vec<Selector> = Vec::new();
    for window in instructions.windows(4) {
        let [push4, eq, push_dest, jumpi] = window else {
            continue;
        };
        if push4.op == OP_PUSH4
            && eq.op == OP_EQ
            && is_push(push_dest.op)
            && jumpi.op == OP_JUMPI
        {
            let selector = Selector::from_slice(push4.immediate);
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
    }
    selectors
}
