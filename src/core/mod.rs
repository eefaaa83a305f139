//! Core module - Application state, instance records, isolation and process tracking

mod app_state;
pub mod app_type;
pub mod application;
pub mod container;
mod instance;
pub mod isolation;
mod process;
pub mod settings;
pub mod transfer;

pub use app_state::{AppState, ImportReport};
pub use app_type::{AppType, CompatibilityLevel, IsolationMethod};
pub use application::{parse_plist_strings, read_info_plist, Application};
pub use container::{ContainerBuilder, ContainerValidation};
pub use instance::{
    same_shim_path, sanitize_name, shim_path_for, AppInstance, InstanceId, InstanceOptions,
};
pub use isolation::{IsolationResolver, LaunchEnvironment};
pub use process::{
    LaunchOutcome, ProcessEvent, ProcessState, ProcessTracker, RunningProcess, TerminationWatch,
};
pub use settings::Settings;
pub use transfer::{parse_import, ExportDocument, ExportedInstance};
