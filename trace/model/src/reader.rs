use super::command::{Command, KernelLaunch};
use super::dim::Dim;
use super::{KernelTrace, TraceInstruction, WarpTrace};
use std::io::BufRead;

/// Error reading a trace file.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: unsupported command {command:?}")]
    UnsupportedCommand { line: usize, command: String },

    #[error("missing header field {field:?}")]
    MissingHeaderField { field: &'static str },
}

impl Error {
    fn parse(line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }
}

fn parse_u64(value: &str, line: usize) -> Result<u64, Error> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| Error::parse(line, format!("invalid number {value:?}")))
}

fn parse_dim(value: &str, line: usize) -> Result<Dim, Error> {
    let inner = value
        .trim()
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| Error::parse(line, format!("invalid dimensions {value:?}")))?;
    let mut parts = inner.split(',').map(str::trim);
    let mut next = |name| {
        parts
            .next()
            .ok_or_else(|| Error::parse(line, format!("missing {name} dimension")))
            .and_then(|v| parse_u64(v, line))
            .map(|v| v as u32)
    };
    Ok(Dim::new(next("x")?, next("y")?, next("z")?))
}

/// Read a command list.
///
/// Lines are of the form `MemcpyHtoD,<addr>,<bytes>` or
/// `kernel-<N>,<relative path>`. Blank lines and `#` comments are skipped.
pub fn read_commands(reader: impl BufRead) -> Result<Vec<Command>, Error> {
    let mut commands = Vec::new();
    for (line_idx, line) in reader.lines().enumerate() {
        let line_num = line_idx + 1;
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split(',').map(str::trim);
        let head = parts.next().unwrap_or_default();
        if head == "MemcpyHtoD" {
            let addr = parts
                .next()
                .ok_or_else(|| Error::parse(line_num, "missing memcpy address"))?;
            let bytes = parts
                .next()
                .ok_or_else(|| Error::parse(line_num, "missing memcpy size"))?;
            commands.push(Command::MemcpyHtoD {
                dest_device_addr: parse_u64(addr, line_num)?,
                num_bytes: parse_u64(bytes, line_num)?,
            });
        } else if let Some(id) = head.strip_prefix("kernel-") {
            let trace_file = parts
                .next()
                .ok_or_else(|| Error::parse(line_num, "missing kernel trace path"))?;
            commands.push(Command::KernelLaunch {
                id: parse_u64(id, line_num)?,
                trace_file: trace_file.to_string(),
            });
        } else {
            return Err(Error::UnsupportedCommand {
                line: line_num,
                command: head.to_string(),
            });
        }
    }
    Ok(commands)
}

#[derive(Debug, Default)]
struct Header {
    name: Option<String>,
    id: Option<u64>,
    grid: Option<Dim>,
    block: Option<Dim>,
    shared_mem_bytes: Option<u32>,
    num_registers: Option<u32>,
    stream_id: Option<u64>,
    shared_mem_base_addr: Option<u64>,
    local_mem_base_addr: Option<u64>,
}

impl Header {
    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), Error> {
        match key {
            "kernel name" => self.name = Some(value.to_string()),
            "kernel id" => self.id = Some(parse_u64(value, line)?),
            "grid dim" => self.grid = Some(parse_dim(value, line)?),
            "block dim" => self.block = Some(parse_dim(value, line)?),
            "shmem" => self.shared_mem_bytes = Some(parse_u64(value, line)? as u32),
            "nregs" => self.num_registers = Some(parse_u64(value, line)? as u32),
            "stream id" => self.stream_id = Some(parse_u64(value, line)?),
            "shmem base_addr" => self.shared_mem_base_addr = Some(parse_u64(value, line)?),
            "local mem base_addr" => self.local_mem_base_addr = Some(parse_u64(value, line)?),
            other => return Err(Error::parse(line, format!("unknown header field {other:?}"))),
        }
        Ok(())
    }

    fn finish(self) -> Result<KernelLaunch, Error> {
        Ok(KernelLaunch {
            name: self.name.ok_or(Error::MissingHeaderField {
                field: "kernel name",
            })?,
            id: self.id.ok_or(Error::MissingHeaderField { field: "kernel id" })?,
            trace_file: String::new(),
            grid: self.grid.ok_or(Error::MissingHeaderField { field: "grid dim" })?,
            block: self.block.ok_or(Error::MissingHeaderField {
                field: "block dim",
            })?,
            shared_mem_bytes: self.shared_mem_bytes.unwrap_or(0),
            num_registers: self.num_registers.unwrap_or(0),
            stream_id: self.stream_id.unwrap_or(0),
            shared_mem_base_addr: self.shared_mem_base_addr.unwrap_or(0),
            local_mem_base_addr: self.local_mem_base_addr.unwrap_or(0),
        })
    }
}

fn parse_registers<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    count: usize,
    line: usize,
) -> Result<Vec<u32>, Error> {
    let mut registers = Vec::with_capacity(count);
    for _ in 0..count {
        let token = parts
            .next()
            .ok_or_else(|| Error::parse(line, "missing register operand"))?;
        let num = token
            .strip_prefix('R')
            .ok_or_else(|| Error::parse(line, format!("invalid register {token:?}")))?;
        registers.push(
            num.parse()
                .map_err(|_| Error::parse(line, format!("invalid register {token:?}")))?,
        );
    }
    Ok(registers)
}

/// A warp instruction line:
/// `<pc> <active-mask> <#dest> [dest regs] <opcode> <#src> [src regs] <mem-width> [addresses]`
///
/// Addresses are listed for active lanes only, in lane order.
fn parse_instruction(
    line: &str,
    line_num: usize,
    block_id: Dim,
    warp_id: u32,
    instr_idx: u32,
) -> Result<TraceInstruction, Error> {
    let mut parts = line.split_whitespace();
    let pc = parts
        .next()
        .ok_or_else(|| Error::parse(line_num, "missing pc"))
        .and_then(|v| u32::from_str_radix(v, 16).map_err(|_| Error::parse(line_num, "bad pc")))?;
    let active_mask = parts
        .next()
        .ok_or_else(|| Error::parse(line_num, "missing active mask"))
        .and_then(|v| {
            u32::from_str_radix(v, 16).map_err(|_| Error::parse(line_num, "bad active mask"))
        })?;

    let num_dest = parts
        .next()
        .ok_or_else(|| Error::parse(line_num, "missing dest register count"))
        .and_then(|v| {
            v.parse::<usize>()
                .map_err(|_| Error::parse(line_num, "bad dest register count"))
        })?;
    let dest_regs = parse_registers(&mut parts, num_dest, line_num)?;

    let opcode = parts
        .next()
        .ok_or_else(|| Error::parse(line_num, "missing opcode"))?
        .to_string();

    let num_src = parts
        .next()
        .ok_or_else(|| Error::parse(line_num, "missing src register count"))
        .and_then(|v| {
            v.parse::<usize>()
                .map_err(|_| Error::parse(line_num, "bad src register count"))
        })?;
    let src_regs = parse_registers(&mut parts, num_src, line_num)?;

    let mem_width = parts
        .next()
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| Error::parse(line_num, "bad memory width"))
        })
        .transpose()?
        .unwrap_or(0);

    let mut addrs = [0u64; 32];
    if mem_width > 0 {
        for lane in 0..32 {
            if active_mask & (1 << lane) == 0 {
                continue;
            }
            let addr = parts
                .next()
                .ok_or_else(|| Error::parse(line_num, format!("missing address for lane {lane}")))?;
            addrs[lane] = parse_u64(addr, line_num)?;
        }
    }

    Ok(TraceInstruction {
        pc,
        active_mask,
        dest_regs,
        opcode,
        src_regs,
        mem_width,
        addrs,
        block_id,
        warp_id,
        instr_idx,
        line: line_num,
    })
}

/// Read a per-kernel trace: a header followed by `#BEGIN_TB`/`#END_TB` blocks,
/// each holding per-warp instruction streams.
pub fn read_kernel_trace(reader: impl BufRead) -> Result<KernelTrace, Error> {
    let mut header = Header::default();
    let mut blocks: Vec<(Dim, Vec<WarpTrace>)> = Vec::new();
    let mut current_block: Option<Dim> = None;
    let mut current_warp: Option<(u32, usize)> = None;

    for (line_idx, line) in reader.lines().enumerate() {
        let line_num = line_idx + 1;
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line == "#END_TB" {
            continue;
        }
        if line == "#BEGIN_TB" {
            current_block = None;
            current_warp = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix('-') {
            let (key, value) = rest
                .split_once('=')
                .ok_or_else(|| Error::parse(line_num, "malformed header line"))?;
            header.apply(key.trim(), value.trim(), line_num)?;
            continue;
        }
        if let Some(value) = line.strip_prefix("thread block = ") {
            let block = parse_dim(&format!("({value})"), line_num)?;
            blocks.push((block, Vec::new()));
            current_block = Some(block);
            current_warp = None;
            continue;
        }
        if let Some(value) = line.strip_prefix("warp = ") {
            if current_block.is_none() {
                return Err(Error::parse(line_num, "warp outside of a thread block"));
            }
            let warp_id = parse_u64(value, line_num)? as u32;
            let warps = &mut blocks.last_mut().unwrap().1;
            warps.push(WarpTrace {
                warp_id,
                instructions: Vec::new(),
            });
            current_warp = Some((warp_id, warps.len() - 1));
            continue;
        }
        if let Some(value) = line.strip_prefix("insts = ") {
            // instruction count: used for buffer pre-sizing only
            let count = parse_u64(value, line_num)? as usize;
            if let Some((_, warp_idx)) = current_warp {
                blocks
                    .last_mut()
                    .unwrap()
                    .1[warp_idx]
                    .instructions
                    .reserve(count);
            }
            continue;
        }

        // anything else must be an instruction line
        let Some(block) = current_block else {
            return Err(Error::parse(line_num, "instruction outside of a thread block"));
        };
        let Some((warp_id, warp_idx)) = current_warp else {
            return Err(Error::parse(line_num, "instruction outside of a warp"));
        };
        let warp = &mut blocks.last_mut().unwrap().1[warp_idx];
        let instr_idx = warp.instructions.len() as u32;
        warp.instructions
            .push(parse_instruction(line, line_num, block, warp_id, instr_idx)?);
    }

    let launch = header.finish()?;
    let blocks = blocks
        .into_iter()
        .map(|(block, warps)| super::BlockTrace {
            block_id: launch.grid.flat_id(&block),
            block,
            warps,
        })
        .collect();
    Ok(KernelTrace { launch, blocks })
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre;
    use std::io::Cursor;

    #[test]
    fn parses_command_list() -> eyre::Result<()> {
        let commands = super::read_commands(Cursor::new(
            "# generated\nMemcpyHtoD,0x1000,64\nkernel-0,kernel-0.trace\n",
        ))?;
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            crate::Command::MemcpyHtoD {
                dest_device_addr: 0x1000,
                num_bytes: 64
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = super::read_commands(Cursor::new("MemcpyDtoH,0x1000,64\n")).unwrap_err();
        assert!(matches!(
            err,
            super::Error::UnsupportedCommand { line: 1, .. }
        ));
    }

    #[test]
    fn parses_kernel_trace() -> eyre::Result<()> {
        let trace = "\
-kernel name = vecadd
-kernel id = 0
-grid dim = (1,1,1)
-block dim = (32,1,1)
-shmem = 0
-nregs = 8
-stream id = 0

#BEGIN_TB
thread block = 0,0,0
warp = 0
insts = 2
0000 ffffffff 1 R1 LDG 1 R2 4 0x80000000 0x80000004 0x80000008 0x8000000c 0x80000010 0x80000014 0x80000018 0x8000001c 0x80000020 0x80000024 0x80000028 0x8000002c 0x80000030 0x80000034 0x80000038 0x8000003c 0x80000040 0x80000044 0x80000048 0x8000004c 0x80000050 0x80000054 0x80000058 0x8000005c 0x80000060 0x80000064 0x80000068 0x8000006c 0x80000070 0x80000074 0x80000078 0x8000007c
0010 ffffffff 0 EXIT 0 0
#END_TB
";
        let kernel = super::read_kernel_trace(Cursor::new(trace))?;
        assert_eq!(kernel.launch.name, "vecadd");
        assert_eq!(kernel.launch.block.size(), 32);
        assert_eq!(kernel.blocks.len(), 1);
        let warp = &kernel.blocks[0].warps[0];
        assert_eq!(warp.instructions.len(), 2);
        assert_eq!(warp.instructions[0].opcode, "LDG");
        assert_eq!(warp.instructions[0].addrs[31], 0x8000_007c);
        assert_eq!(warp.instructions[1].opcode, "EXIT");
        Ok(())
    }

    #[test]
    fn reports_offending_line() {
        let trace = "\
-kernel name = bad
-kernel id = 0
-grid dim = (1,1,1)
-block dim = (32,1,1)

#BEGIN_TB
thread block = 0,0,0
warp = 0
zzzz not-an-instruction
";
        let err = super::read_kernel_trace(Cursor::new(trace)).unwrap_err();
        assert!(matches!(err, super::Error::Parse { line: 9, .. }));
    }
}
