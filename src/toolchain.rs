use log::debug;
use serde::Deserialize;
use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}:\n{output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },

    #[error("could not read plugin manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("build artifact {path} is missing: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The external commands the plugin manager relies on. Exit status and
/// combined output are all that is observed.
pub trait Toolchain {
    /// Clones the source for `reference` into `dest`.
    fn fetch(&self, reference: &str, dest: &Path) -> Result<(), ToolError>;

    /// Brings an existing checkout up to date.
    fn update(&self, dir: &Path) -> Result<(), ToolError>;

    /// Compiles the plugin in `dir` into a loadable module at `output`.
    fn build(&self, dir: &Path, output: &Path) -> Result<(), ToolError>;
}

/// Uses `git` for sources and `cargo` for builds.
#[derive(Debug, Clone)]
pub struct SystemToolchain {
    git: String,
    cargo: String,
}

impl SystemToolchain {
    pub fn new() -> Self {
        SystemToolchain {
            git: "git".to_string(),
            cargo: std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string()),
        }
    }
}

impl Default for SystemToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Toolchain for SystemToolchain {
    fn fetch(&self, reference: &str, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.git);
        cmd.arg("clone").arg(format!("https://{}", reference)).arg(dest);
        run(&self.git, cmd)
    }

    fn update(&self, dir: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.git);
        cmd.arg("-C").arg(dir).arg("pull");
        run(&self.git, cmd)
    }

    fn build(&self, dir: &Path, output: &Path) -> Result<(), ToolError> {
        let manifest = dir.join("Cargo.toml");
        let target_dir = dir.join("target");

        let mut cmd = Command::new(&self.cargo);
        cmd.arg("build")
            .arg("--release")
            .arg("--lib")
            .arg("--manifest-path")
            .arg(&manifest)
            .arg("--target-dir")
            .arg(&target_dir);
        run(&self.cargo, cmd)?;

        let artifact = target_dir
            .join("release")
            .join(library_file_name(&library_name(&manifest)?));
        fs::copy(&artifact, output).map_err(|source| ToolError::Artifact {
            path: artifact.clone(),
            source,
        })?;
        debug!("Copied {} to {}", artifact.display(), output.display());
        Ok(())
    }
}

fn run(program: &str, mut cmd: Command) -> Result<(), ToolError> {
    debug!("Running {:?}", cmd);
    let out = cmd.output().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;
    if out.status.success() {
        Ok(())
    } else {
        Err(ToolError::Failed {
            program: program.to_string(),
            status: out.status.to_string(),
            output: combined_output(&out),
        })
    }
}

fn combined_output(out: &Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text
}

#[derive(Debug, Deserialize)]
struct Manifest {
    package: Option<Package>,
    lib: Option<Lib>,
}

#[derive(Debug, Deserialize)]
struct Package {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Lib {
    name: Option<String>,
}

/// Name of the library target cargo will produce for `manifest`: the
/// `[lib] name` if set, else the package name with dashes replaced.
pub fn library_name(manifest: &Path) -> Result<String, ToolError> {
    let text = fs::read_to_string(manifest).map_err(|e| ToolError::Manifest {
        path: manifest.to_path_buf(),
        reason: e.to_string(),
    })?;
    let parsed: Manifest = toml::from_str(&text).map_err(|e| ToolError::Manifest {
        path: manifest.to_path_buf(),
        reason: e.to_string(),
    })?;

    if let Some(name) = parsed.lib.and_then(|l| l.name) {
        return Ok(name);
    }
    match parsed.package {
        Some(package) => Ok(package.name.replace('-', "_")),
        None => Err(ToolError::Manifest {
            path: manifest.to_path_buf(),
            reason: "no [package] section".to_string(),
        }),
    }
}

/// `libfoo.so` on Linux, `libfoo.dylib` on macOS, `foo.dll` on Windows.
pub fn library_file_name(name: &str) -> String {
    format!("{}{}.{}", DLL_PREFIX, name, DLL_EXTENSION)
}
