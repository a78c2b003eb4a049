// In src/lib.rs
mod analyzer;
mod capture;
mod connection;
mod dispatch;
mod loader;
mod output;
mod parser;
mod plugin;
mod registry;
mod sensor;
mod settings;
mod state;
mod toolchain;

// The analyzer contract, also used by plugin crates.
pub use analyzer::{
    ANALYZER_ABI_VERSION, Analyzer, AnalyzerDeclaration, AnalyzerError, AnalyzerResult,
    CORE_VERSION, DECLARATION_SYMBOL, Finding, PanicBoundary, RUSTC_VERSION, Severity,
    panic_message,
};
pub use connection::{Connection, ConnectionState, Transport, UidAllocator};
pub use dispatch::{DispatchError, Dispatcher};
pub use registry::{AnalyzerRegistry, RegistryBuilder};

pub use loader::{DylibLoader, LoadError, ModuleLoader, check_compatible};
pub use plugin::{ENTRY_POINTS, PluginDescriptor, PluginError, PluginManager, default_cache_root};
pub use toolchain::{SystemToolchain, ToolError, Toolchain};

pub use capture::{CaptureOptions, InterfaceType, RawPacket, list_devices, open_capture, start_capture};
pub use output::ConnectionLog;
pub use parser::{PacketInfo, parse_frame};
pub use sensor::{Sensor, SensorError, SensorOptions};
pub use settings::{AnalyzerEntry, Settings, SettingsError, validate_interface, validate_snapshot_length};
pub use state::ConnectionTracker;
