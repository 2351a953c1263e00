use crate::{config, Kernel};
use color_eyre::eyre::{self, WrapErr};
use std::io::BufReader;
use std::path::Path;
use trace_model::Command;

/// Read the command list driving a simulation.
pub fn read_command_file(path: &Path) -> eyre::Result<Vec<Command>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open command list {}", path.display()))?;
    let commands = trace_model::read_commands(BufReader::new(file))
        .wrap_err_with(|| format!("failed to parse command list {}", path.display()))?;
    Ok(commands)
}

/// Read and validate one kernel trace.
///
/// `trace_file` is relative to the trace directory, as written in the
/// command list.
pub fn read_kernel(
    traces_dir: &Path,
    id: u64,
    trace_file: &str,
    config: &config::GPU,
) -> eyre::Result<Kernel> {
    let path = traces_dir.join(trace_file);
    let file = std::fs::OpenOptions::new()
        .read(true)
        .open(&path)
        .wrap_err_with(|| format!("failed to open kernel trace {}", path.display()))?;
    let mut trace = trace_model::read_kernel_trace(BufReader::new(file))
        .wrap_err_with(|| format!("failed to parse kernel trace {}", path.display()))?;
    if trace.launch.id != id {
        eyre::bail!(
            "kernel trace {} has id {} but the command list says kernel-{id}",
            path.display(),
            trace.launch.id,
        );
    }
    trace.launch.trace_file = trace_file.to_string();

    let kernel = Kernel::new(trace);
    kernel
        .validate(config)
        .wrap_err_with(|| format!("invalid kernel trace {}", path.display()))?;
    Ok(kernel)
}

/// Build a kernel directly from a parsed trace, for tests driving the
/// simulator without touching the filesystem.
pub fn kernel_from_trace(
    trace: trace_model::KernelTrace,
    config: &config::GPU,
) -> eyre::Result<Kernel> {
    let kernel = Kernel::new(trace);
    kernel.validate(config)?;
    Ok(kernel)
}
