use std::path::{Path, PathBuf};
use std::process::Command;

use gradc::CodegenConfig;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

/// Platform suffix for the produced shared library.
pub fn shared_library_suffix() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else {
        ".so"
    }
}

/// Assembles the compiler invocation without spawning it. Argument order is
/// deterministic: flags, the source, library search path, dynamic links,
/// rpath, then the output.
pub fn compile_command(source: &Path, output: &Path, config: &CodegenConfig) -> Command {
    let mut cmd = Command::new(config.resolved_compiler());
    for flag in &config.compile_flags {
        cmd.arg(flag);
    }
    cmd.arg(source);
    // Header-only backends leave src_path empty and get no link arguments.
    if !config.src_path.as_os_str().is_empty() {
        cmd.arg(format!("-L{}", config.src_path.display()));
        for link in &config.dynamic_links {
            cmd.arg(link);
        }
        cmd.arg(format!("-Wl,-rpath,{}", config.src_path.display()));
    }
    cmd.arg("-lm");
    cmd.arg("-o").arg(output);
    cmd
}

/// Runs the external compiler, blocking until it exits. A non-zero exit is
/// fatal and carries the compiler's stderr.
pub fn compile_shared(source: &Path, output: &Path, config: &CodegenConfig) -> BridgeResult<()> {
    let mut cmd = compile_command(source, output, config);
    debug!(source = %source.display(), output = %output.display(), "invoking C compiler");
    let result = cmd.output()?;
    if !result.status.success() {
        return Err(BridgeError::Compiler {
            status: result.status.to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Resolves a `-lfoo` linker name against the backend source directory,
/// trying the platform library suffixes in a fixed order.
pub fn resolve_dynamic_link(src_path: &Path, link: &str) -> BridgeResult<PathBuf> {
    let stem = format!("lib{}", link.trim_start_matches("-l"));
    for suffix in [".so", ".dylib"] {
        let candidate = src_path.join(format!("{stem}{suffix}"));
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(BridgeError::DynamicLink {
        name: link.to_string(),
        dir: src_path.display().to_string(),
    })
}
