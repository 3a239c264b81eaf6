use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend-supplied configuration for code generation and compilation.
///
/// The generator itself holds no global state: everything backend-specific
/// (array record name, header, struct layout mode, toolchain flags) is
/// threaded through this struct so that generating source is a pure function
/// of (flat graph, struct keys, configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodegenConfig {
    /// Header included at the top of the generated translation unit,
    /// resolved relative to [`CodegenConfig::src_path`].
    pub header_name: String,
    /// Name of the backend's array record type. Every generated struct
    /// field is a pointer to this type.
    pub array_type: String,
    /// When set, output storage doubles as input storage: the evaluation
    /// input struct covers *all* graph keys and each primitive receives its
    /// output buffer as the leading argument.
    pub use_output_as_input: bool,
    /// When set, the host wrapper allocates storage for any input key with
    /// a known shape that the caller did not supply, and materializes
    /// zero-valued gradient seeds for differentiable internal keys.
    pub allocate_internals: bool,
    /// Whether the final-cost key itself is surfaced from `evaluate`.
    pub return_output: bool,
    /// Directory holding the backend's header and kernel sources; passed to
    /// the compiler as a library search path and rpath.
    pub src_path: PathBuf,
    /// Linker names (`-lfoo`) resolved against `src_path` and pre-loaded
    /// before the generated library.
    pub dynamic_links: Vec<String>,
    /// Compiler binary. The `GRADC_CC` / `CC` environment variables
    /// override this at compile time.
    pub compiler: String,
    /// Flags between the compiler binary and the link arguments.
    pub compile_flags: Vec<String>,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            header_name: "arrays.h".to_string(),
            array_type: "Array".to_string(),
            use_output_as_input: false,
            allocate_internals: true,
            return_output: true,
            src_path: PathBuf::new(),
            dynamic_links: Vec::new(),
            compiler: "cc".to_string(),
            compile_flags: vec![
                "-shared".to_string(),
                "-fPIC".to_string(),
                "-g".to_string(),
            ],
        }
    }
}

impl CodegenConfig {
    /// Compiler binary after environment overrides.
    pub fn resolved_compiler(&self) -> String {
        std::env::var("GRADC_CC")
            .or_else(|_| std::env::var("CC"))
            .unwrap_or_else(|_| self.compiler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = CodegenConfig {
            src_path: PathBuf::from("/opt/backend"),
            dynamic_links: vec!["kernels".to_string()],
            ..CodegenConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: CodegenConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.src_path, config.src_path);
        assert_eq!(back.dynamic_links, config.dynamic_links);
        assert_eq!(back.compile_flags, config.compile_flags);
    }

    #[test]
    fn defaults_match_the_c_kernel_convention() {
        let defaults = CodegenConfig::default();
        assert_eq!(defaults.header_name, "arrays.h");
        assert_eq!(defaults.array_type, "Array");
        assert!(defaults.allocate_internals);
        assert!(defaults.return_output);
        assert!(!defaults.use_output_as_input);
        assert_eq!(defaults.compile_flags, ["-shared", "-fPIC", "-g"]);
    }
}
