//! Toolchain configuration.
//!
//! Option sets for the C compiler, assembler and linker stages, plus the
//! Release/Debug presets. A config is read once at the start of a build run
//! and never mutated afterwards; every argument vector produced here is a
//! pure function of the config and the concrete input/output paths.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("toolchain root does not exist: {0}")]
    MissingToolchainRoot(PathBuf),
    #[error("two build units write the same output: {0}")]
    DuplicateOutput(PathBuf),
    #[error("unit has no usable inputs: {0}")]
    MissingInputs(PathBuf),
}

/// A preprocessor define, rendered as `-DSYMBOL` or `-DSYMBOL=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Define {
    pub symbol: String,
    pub value: Option<String>,
}

impl Define {
    pub fn flag(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            value: None,
        }
    }

    pub fn valued(symbol: &str, value: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            value: Some(value.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match &self.value {
            Some(value) => format!("-D{}={}", self.symbol, value),
            None => format!("-D{}", self.symbol),
        }
    }
}

/// C compiler options. Include paths are resolved against the toolchain root.
#[derive(Debug, Clone)]
pub struct CcOptions {
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<Define>,
    pub flags: Vec<String>,
    pub cc_path: PathBuf,
}

impl CcOptions {
    pub fn release() -> Self {
        Self {
            include_paths: vec![PathBuf::from("inc")],
            defines: vec![],
            flags: [
                "-m68000",
                "-Wall",
                "-O1",
                "-fomit-frame-pointer",
                "-fno-builtin-memset",
                "-fno-builtin-memcpy",
            ]
            .map(String::from)
            .to_vec(),
            cc_path: PathBuf::from("bin/m68k-elf-gcc"),
        }
    }

    pub fn debug() -> Self {
        Self {
            include_paths: vec![PathBuf::from("inc")],
            defines: vec![Define::flag("_DEBUG")],
            flags: [
                "-g3",
                "-m68000",
                "-Wall",
                "-fomit-frame-pointer",
                "-fno-builtin-memset",
                "-fno-builtin-memcpy",
                "-O1",
            ]
            .map(String::from)
            .to_vec(),
            cc_path: PathBuf::from("bin/m68k-elf-gcc"),
        }
    }
}

/// Assembler options.
#[derive(Debug, Clone)]
pub struct AsOptions {
    pub defines: Vec<Define>,
    pub flags: Vec<String>,
    pub as_path: PathBuf,
}

impl AsOptions {
    pub fn release() -> Self {
        Self {
            defines: vec![],
            flags: vec![],
            as_path: PathBuf::from("bin/m68k-elf-as"),
        }
    }

    pub fn debug() -> Self {
        Self {
            defines: vec![Define::flag("_DEBUG")],
            ..Self::release()
        }
    }
}

/// Linker options. Libraries are resolved against `<root>/lib/`.
#[derive(Debug, Clone)]
pub struct LdOptions {
    pub linker_script: PathBuf,
    pub flags: Vec<String>,
    pub libraries: Vec<String>,
    pub ld_path: PathBuf,
}

impl LdOptions {
    pub fn release() -> Self {
        Self {
            linker_script: PathBuf::from("md.ld"),
            flags: ["-nostdlib", "--oformat", "binary"]
                .map(String::from)
                .to_vec(),
            libraries: vec!["libmd.a".to_string()],
            ld_path: PathBuf::from("bin/m68k-elf-ld"),
        }
    }

    pub fn debug() -> Self {
        Self::release()
    }
}

/// The full toolchain configuration for one build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub name: String,
    pub toolchain_root: PathBuf,
    pub cc: CcOptions,
    pub asm: AsOptions,
    pub ld: LdOptions,
}

impl BuildConfig {
    pub fn release(toolchain_root: impl Into<PathBuf>) -> Self {
        Self {
            name: "Release".to_string(),
            toolchain_root: toolchain_root.into(),
            cc: CcOptions::release(),
            asm: AsOptions::release(),
            ld: LdOptions::release(),
        }
    }

    pub fn debug(toolchain_root: impl Into<PathBuf>) -> Self {
        Self {
            name: "Debug".to_string(),
            toolchain_root: toolchain_root.into(),
            cc: CcOptions::debug(),
            asm: AsOptions::debug(),
            ld: LdOptions::debug(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.toolchain_root.is_dir() {
            return Err(ConfigError::MissingToolchainRoot(
                self.toolchain_root.clone(),
            ));
        }
        Ok(())
    }

    pub fn cc_path(&self) -> PathBuf {
        self.toolchain_root.join(&self.cc.cc_path)
    }

    pub fn as_path(&self) -> PathBuf {
        self.toolchain_root.join(&self.asm.as_path)
    }

    pub fn ld_path(&self) -> PathBuf {
        self.toolchain_root.join(&self.ld.ld_path)
    }

    fn include_args(&self) -> impl Iterator<Item = String> + '_ {
        self.cc
            .include_paths
            .iter()
            .map(|inc| format!("-I{}", self.toolchain_root.join(inc).display()))
    }

    /// `<flags> <defines> <includes> -c <in> -o <out>`
    pub fn compile_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = self.cc.flags.clone();
        args.extend(self.cc.defines.iter().map(Define::render));
        args.extend(self.include_args());
        args.push("-c".to_string());
        args.push(input.display().to_string());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args
    }

    /// `<flags> -o <out> <in>`
    pub fn assemble_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = self.asm.flags.clone();
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args.push(input.display().to_string());
        args
    }

    /// `-T <script> <flags> -o <out> <objects...> <libraries...>`
    pub fn link_args(&self, objects: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec!["-T".to_string(), self.ld.linker_script.display().to_string()];
        args.extend(self.ld.flags.clone());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args.extend(objects.iter().map(|o| o.display().to_string()));
        args.extend(
            self.ld
                .libraries
                .iter()
                .map(|lib| self.toolchain_root.join("lib").join(lib).display().to_string()),
        );
        args
    }
}
