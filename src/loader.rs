use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::analyzer::{
    ANALYZER_ABI_VERSION, Analyzer, AnalyzerDeclaration, AnalyzerError, AnalyzerResult,
    CORE_VERSION, DECLARATION_SYMBOL, RUSTC_VERSION,
};
use crate::connection::Connection;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{path} does not export an analyzer declaration: {source}")]
    MissingSymbol {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{path} was built with {what} {found}, this sensor uses {expected}")]
    Incompatible {
        path: PathBuf,
        what: &'static str,
        found: String,
        expected: String,
    },

    #[error("constructor in {path} panicked: {message}")]
    Constructor { path: PathBuf, message: String },
}

/// Turns a built module into an analyzer instance.
pub trait ModuleLoader {
    fn load(&self, module: &Path) -> Result<Box<dyn Analyzer>, LoadError>;
}

/// Loads native modules produced by `declare_analyzer!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(&self, module: &Path) -> Result<Box<dyn Analyzer>, LoadError> {
        // SAFETY: running a plugin's initializers is inherent to loading it;
        // the module was just built from the configured reference.
        let library = unsafe { Library::new(module) }.map_err(|source| LoadError::Open {
            path: module.to_path_buf(),
            source,
        })?;

        let analyzer = {
            // SAFETY: `declare_analyzer!` exports this symbol as a static
            // `AnalyzerDeclaration`; the versions are checked before use.
            let symbol: Symbol<*const AnalyzerDeclaration> = unsafe {
                library.get(DECLARATION_SYMBOL)
            }
            .map_err(|source| LoadError::MissingSymbol {
                path: module.to_path_buf(),
                source,
            })?;
            let declaration = unsafe { &**symbol };

            check_compatible(module, declaration)?;

            (declaration.constructor)().map_err(|message| LoadError::Constructor {
                path: module.to_path_buf(),
                message,
            })?
        };

        Ok(Box::new(LoadedAnalyzer {
            analyzer,
            _library: library,
        }))
    }
}

/// Rejects a declaration unless it matches this build's analyzer ABI, crate
/// version and compiler. The ABI number is checked first since the layout of
/// the other fields depends on it.
pub fn check_compatible(module: &Path, declaration: &AnalyzerDeclaration) -> Result<(), LoadError> {
    let mismatch = |what, found: &str, expected: &str| LoadError::Incompatible {
        path: module.to_path_buf(),
        what,
        found: found.to_string(),
        expected: expected.to_string(),
    };

    if declaration.abi_version != ANALYZER_ABI_VERSION {
        return Err(mismatch(
            "analyzer ABI",
            &declaration.abi_version.to_string(),
            &ANALYZER_ABI_VERSION.to_string(),
        ));
    }
    if declaration.core_version != CORE_VERSION {
        return Err(mismatch("nids_v2", declaration.core_version, CORE_VERSION));
    }
    if declaration.rustc_version != RUSTC_VERSION {
        return Err(mismatch("compiler", declaration.rustc_version, RUSTC_VERSION));
    }
    Ok(())
}

/// Keeps the library mapped for as long as the analyzer built from it lives.
/// Field order matters: the analyzer is dropped before the library.
struct LoadedAnalyzer {
    analyzer: Box<dyn Analyzer>,
    _library: Library,
}

impl Analyzer for LoadedAnalyzer {
    fn name(&self) -> &str {
        self.analyzer.name()
    }

    fn filter(&self, conn: &Connection) -> bool {
        self.analyzer.filter(conn)
    }

    fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
        self.analyzer.analyze(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Severity;
    use crate::connection::Transport;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    struct Echo;

    impl Analyzer for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn filter(&self, conn: &Connection) -> bool {
            conn.transport_type == Transport::Tcp
        }
        fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
            Ok(AnalyzerResult::alert(
                "echo",
                Severity::Low,
                String::from_utf8_lossy(conn.payload()),
            ))
        }
    }

    fn new_echo() -> Result<Box<dyn Analyzer>, String> {
        Ok(Box::new(Echo))
    }

    fn declaration() -> AnalyzerDeclaration {
        AnalyzerDeclaration {
            abi_version: ANALYZER_ABI_VERSION,
            core_version: CORE_VERSION,
            rustc_version: RUSTC_VERSION,
            constructor: new_echo,
        }
    }

    fn mock_connection(transport: Transport) -> Connection {
        Connection::new(
            1,
            Utc::now(),
            transport,
            "192.168.1.10:40000".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn test_missing_module_is_open_error() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("nothing-here.so");

        let err = DylibLoader.load(&module).err().unwrap();

        assert!(matches!(err, LoadError::Open { .. }));
    }

    #[test]
    fn test_non_library_file_is_open_error() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("analyzer.so");
        fs::write(&module, b"not an object file").unwrap();

        let err = DylibLoader.load(&module).err().unwrap();

        assert!(matches!(err, LoadError::Open { .. }));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_library_without_declaration_is_missing_symbol() {
        let err = DylibLoader.load(Path::new("libc.so.6")).err().unwrap();

        assert!(matches!(err, LoadError::MissingSymbol { .. }));
    }

    #[test]
    fn test_matching_declaration_is_compatible() {
        assert!(check_compatible(Path::new("analyzer.so"), &declaration()).is_ok());
    }

    #[test]
    fn test_abi_mismatch_is_incompatible() {
        let declaration = AnalyzerDeclaration {
            abi_version: ANALYZER_ABI_VERSION + 1,
            ..declaration()
        };

        let err = check_compatible(Path::new("analyzer.so"), &declaration).unwrap_err();

        assert!(matches!(err, LoadError::Incompatible { what: "analyzer ABI", .. }));
    }

    #[test]
    fn test_core_version_mismatch_is_incompatible() {
        let declaration = AnalyzerDeclaration {
            core_version: "0.0.1",
            ..declaration()
        };

        let err = check_compatible(Path::new("analyzer.so"), &declaration).unwrap_err();

        match err {
            LoadError::Incompatible { what, found, expected, .. } => {
                assert_eq!(what, "nids_v2");
                assert_eq!(found, "0.0.1");
                assert_eq!(expected, CORE_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_compiler_mismatch_is_incompatible() {
        let declaration = AnalyzerDeclaration {
            rustc_version: "rustc 1.0.0 (a59de37e9 2015-05-13)",
            ..declaration()
        };

        let err = check_compatible(Path::new("analyzer.so"), &declaration).unwrap_err();

        assert!(matches!(err, LoadError::Incompatible { what: "compiler", .. }));
        assert!(err.to_string().contains("rustc 1.0.0"));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_loaded_analyzer_delegates_to_inner() {
        let library = unsafe { Library::new("libc.so.6") }.unwrap();
        let loaded = LoadedAnalyzer {
            analyzer: (declaration().constructor)().unwrap(),
            _library: library,
        };
        let mut tcp = mock_connection(Transport::Tcp);

        assert_eq!(loaded.name(), "echo");
        assert!(loaded.filter(&tcp));
        assert!(!loaded.filter(&mock_connection(Transport::Udp)));
        let result = loaded.analyze(&mut tcp).unwrap();
        assert_eq!(result, AnalyzerResult::alert("echo", Severity::Low, "hello"));
    }

    // Builds a real plugin whose `analyze` panics, loads it and dispatches a
    // record through it. The unwind has to stop inside the module.
    #[test]
    #[ignore = "builds a plugin crate with cargo"]
    fn test_panicking_plugin_reports_error() {
        use crate::dispatch::{DispatchError, Dispatcher};
        use crate::registry::RegistryBuilder;
        use crate::toolchain::{SystemToolchain, Toolchain};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let manifest = format!(
            "[package]\nname = \"boom\"\nversion = \"0.1.0\"\nedition = \"2024\"\n\n\
             [lib]\ncrate-type = [\"cdylib\"]\n\n\
             [dependencies]\nnids_v2 = {{ path = {:?} }}\n\n[workspace]\n",
            env!("CARGO_MANIFEST_DIR")
        );
        fs::write(dir.path().join("Cargo.toml"), manifest).unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            r#"
use nids_v2::{Analyzer, AnalyzerError, AnalyzerResult, Connection};

pub struct Boom;

impl Analyzer for Boom {
    fn name(&self) -> &str { "boom" }
    fn filter(&self, _conn: &Connection) -> bool { true }
    fn analyze(&self, _conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
        panic!("boom")
    }
}

fn new_analyzer() -> Boom { Boom }

nids_v2::declare_analyzer!(new_analyzer);
"#,
        )
        .unwrap();
        let module = dir.path().join(format!("analyzer.{}", std::env::consts::DLL_EXTENSION));
        SystemToolchain::new().build(dir.path(), &module).unwrap();

        let mut builder = RegistryBuilder::new();
        builder.push(DylibLoader.load(&module).unwrap());
        let dispatcher = Dispatcher::new(Arc::new(builder.finish()));
        let mut conn = mock_connection(Transport::Tcp);

        let err = dispatcher.dispatch(&mut conn).unwrap_err();

        match err {
            DispatchError::Analyzer { analyzer, source, .. } => {
                assert_eq!(analyzer, "boom");
                assert_eq!(source, AnalyzerError::new("analyze panicked: boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
