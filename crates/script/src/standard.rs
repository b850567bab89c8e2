//! Standard script classification utilities.

use crate::opcodes::{
    small_int, OP_0, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160,
    OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4, OP_RETURN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    P2Tr,
    Multisig,
    NullData,
    Unknown,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2wpkh(script) {
        ScriptType::P2Wpkh
    } else if is_p2wsh(script) {
        ScriptType::P2Wsh
    } else if is_p2tr(script) {
        ScriptType::P2Tr
    } else if p2pk_key(script).is_some() {
        ScriptType::P2Pk
    } else if multisig_keys(script).is_some() {
        ScriptType::Multisig
    } else if script.first() == Some(&OP_RETURN) {
        ScriptType::NullData
    } else {
        ScriptType::Unknown
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

fn is_p2tr(script: &[u8]) -> bool {
    script.len() == 34 && small_int(script[0]) == Some(1) && script[1] == 0x20
}

fn is_pubkey(bytes: &[u8]) -> bool {
    match bytes.len() {
        33 => matches!(bytes[0], 0x02 | 0x03),
        65 => matches!(bytes[0], 0x04 | 0x06 | 0x07),
        _ => false,
    }
}

pub(crate) fn p2pk_key(script: &[u8]) -> Option<&[u8]> {
    let (&last, body) = script.split_last()?;
    if last != OP_CHECKSIG {
        return None;
    }
    let (&len, key) = body.split_first()?;
    (usize::from(len) == key.len() && is_pubkey(key)).then_some(key)
}

/// Keys of a bare `m <key>... n OP_CHECKMULTISIG` script.
pub(crate) fn multisig_keys(script: &[u8]) -> Option<Vec<&[u8]>> {
    let ops = instructions(script)?;
    let (first, rest) = ops.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, keys) = rest.split_last()?;
    let required = match first {
        Instruction::Op(op) => small_int(*op)?,
        Instruction::Push(_) => return None,
    };
    let total = match count {
        Instruction::Op(op) => small_int(*op)?,
        Instruction::Push(_) => return None,
    };
    if *last != Instruction::Op(OP_CHECKMULTISIG) || required > total {
        return None;
    }
    let keys = keys
        .iter()
        .map(|ins| match ins {
            Instruction::Push(data) if is_pubkey(data) => Some(*data),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    (keys.len() == usize::from(total)).then_some(keys)
}

#[derive(Debug, Eq, PartialEq)]
enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Splits a script into pushes and opcodes; `None` if a push overruns the script.
fn instructions(script: &[u8]) -> Option<Vec<Instruction<'_>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let len = match opcode {
            0x01..=0x4b => usize::from(opcode),
            OP_PUSHDATA1 => {
                let len = usize::from(*script.get(pos)?);
                pos += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(pos..pos + 2)?;
                pos += 2;
                usize::from(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(pos..pos + 4)?;
                pos += 4;
                usize::try_from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                    .ok()?
            }
            _ => {
                out.push(Instruction::Op(opcode));
                continue;
            }
        };
        let data = script.get(pos..pos.checked_add(len)?)?;
        pos += len;
        out.push(Instruction::Push(data));
    }
    Some(out)
}
