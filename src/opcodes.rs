use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Trace instruction opcodes.
#[derive(strum::AsRefStr, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    NOP,
    // memory
    LD,
    LDC,
    LDG,
    LDL,
    LDS,
    ST,
    STG,
    STL,
    STS,
    ATOM,
    ATOMS,
    ATOMG,
    RED,
    MEMBAR,
    // texture
    TEX,
    TLD,
    // control
    BRA,
    BRX,
    JMP,
    RET,
    EXIT,
    BAR,
    // integer
    IADD,
    IADD3,
    IMAD,
    IMUL,
    IMNMX,
    ISETP,
    ISCADD,
    LEA,
    LOP,
    LOP3,
    POPC,
    FLO,
    SHF,
    SHL,
    SHR,
    MOV,
    SEL,
    PRMT,
    SHFL,
    PLOP3,
    P2R,
    R2P,
    S2R,
    CS2R,
    VOTE,
    // single precision
    FADD,
    FFMA,
    FMUL,
    FMNMX,
    FSET,
    FSETP,
    FSEL,
    F2F,
    F2I,
    I2F,
    // double precision
    DADD,
    DFMA,
    DMUL,
    DSETP,
    // special function
    MUFU,
    RRO,
}

/// The architectural operation class, which selects the execution pipeline.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArchOp {
    NO_OP,
    ALU_OP,
    SP_OP,
    INT_OP,
    DP_OP,
    SFU_OP,
    LOAD_OP,
    STORE_OP,
    BRANCH_OP,
    BARRIER_OP,
    MEMORY_BARRIER_OP,
    EXIT_OPS,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Opcode {
    pub op: Op,
    pub category: ArchOp,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.op.as_ref())
    }
}

macro_rules! opcodes {
    ($($name:literal: $op:ident => $category:ident,)*) => {
        HashMap::from_iter([
            $(($name, Opcode { op: Op::$op, category: ArchOp::$category }),)*
        ])
    }
}

static OPCODE_MAP: Lazy<HashMap<&'static str, Opcode>> = Lazy::new(|| {
    opcodes! {
        "NOP": NOP => NO_OP,
        "LD": LD => LOAD_OP,
        "LDC": LDC => ALU_OP,
        "LDG": LDG => LOAD_OP,
        "LDL": LDL => LOAD_OP,
        "LDS": LDS => LOAD_OP,
        "ST": ST => STORE_OP,
        "STG": STG => STORE_OP,
        "STL": STL => STORE_OP,
        "STS": STS => STORE_OP,
        "ATOM": ATOM => STORE_OP,
        "ATOMS": ATOMS => STORE_OP,
        "ATOMG": ATOMG => STORE_OP,
        "RED": RED => STORE_OP,
        "MEMBAR": MEMBAR => MEMORY_BARRIER_OP,
        "TEX": TEX => LOAD_OP,
        "TLD": TLD => LOAD_OP,
        "BRA": BRA => BRANCH_OP,
        "BRX": BRX => BRANCH_OP,
        "JMP": JMP => BRANCH_OP,
        "RET": RET => BRANCH_OP,
        "EXIT": EXIT => EXIT_OPS,
        "BAR": BAR => BARRIER_OP,
        "IADD": IADD => INT_OP,
        "IADD3": IADD3 => INT_OP,
        "IMAD": IMAD => INT_OP,
        "IMUL": IMUL => INT_OP,
        "IMNMX": IMNMX => INT_OP,
        "ISETP": ISETP => INT_OP,
        "ISCADD": ISCADD => INT_OP,
        "LEA": LEA => INT_OP,
        "LOP": LOP => INT_OP,
        "LOP3": LOP3 => INT_OP,
        "POPC": POPC => INT_OP,
        "FLO": FLO => INT_OP,
        "SHF": SHF => INT_OP,
        "SHL": SHL => INT_OP,
        "SHR": SHR => INT_OP,
        "MOV": MOV => ALU_OP,
        "SEL": SEL => ALU_OP,
        "PRMT": PRMT => ALU_OP,
        "SHFL": SHFL => ALU_OP,
        "PLOP3": PLOP3 => ALU_OP,
        "P2R": P2R => ALU_OP,
        "R2P": R2P => ALU_OP,
        "S2R": S2R => ALU_OP,
        "CS2R": CS2R => ALU_OP,
        "VOTE": VOTE => ALU_OP,
        "FADD": FADD => SP_OP,
        "FFMA": FFMA => SP_OP,
        "FMUL": FMUL => SP_OP,
        "FMNMX": FMNMX => SP_OP,
        "FSET": FSET => SP_OP,
        "FSETP": FSETP => SP_OP,
        "FSEL": FSEL => SP_OP,
        "F2F": F2F => SP_OP,
        "F2I": F2I => SP_OP,
        "I2F": I2F => SP_OP,
        "DADD": DADD => DP_OP,
        "DFMA": DFMA => DP_OP,
        "DMUL": DMUL => DP_OP,
        "DSETP": DSETP => DP_OP,
        "MUFU": MUFU => SFU_OP,
        "RRO": RRO => SFU_OP,
    }
});

/// Look up the opcode for a trace mnemonic.
///
/// Modifier suffixes (`LDG.E.128.SYS`) are ignored.
#[must_use]
pub fn get(mnemonic: &str) -> Option<Opcode> {
    let base = mnemonic.split('.').next().unwrap_or(mnemonic);
    OPCODE_MAP.get(base).copied()
}

#[cfg(test)]
mod tests {
    use super::{ArchOp, Op};

    #[test]
    fn strips_modifiers() {
        let opcode = super::get("LDG.E.128.SYS").unwrap();
        assert_eq!(opcode.op, Op::LDG);
        assert_eq!(opcode.category, ArchOp::LOAD_OP);
    }

    #[test]
    fn unknown_opcodes_are_none() {
        assert_eq!(super::get("FROBNICATE"), None);
    }
}
