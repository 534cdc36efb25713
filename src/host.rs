//! The bootstrap sequence: locate hostfxr, initialize a runtime context,
//! fetch the assembly loader, resolve the entry point and call it.

use netcorehost::pdcstring::{PdCString, PdChar};

use std::ffi::OsString;
use std::mem;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::app::AppData;
use crate::error::{HostError, Result};
use crate::hostfxr::{pd_string, Hostfxr, InitOptions};
use crate::nethost::HostfxrLocator;

/// Canonical path of the running executable.
pub fn host_executable() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(HostError::HostPath)?;
    std::fs::canonicalize(exe).map_err(HostError::HostPath)
}

/// Directory containing `executable`.
pub fn host_directory(executable: &Path) -> Result<PathBuf> {
    executable
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            let reason = "executable has no parent directory";
            HostError::HostPath(std::io::Error::new(std::io::ErrorKind::NotFound, reason))
        })
}

/// Where to find the runtime, on top of the defaults.
#[derive(Debug, Default)]
pub struct HostOptions {
    pub hostfxr: Option<PathBuf>,
    pub nethost: Option<PathBuf>,
    pub dotnet_root: Option<PathBuf>,
    pub runtime_config: Option<PathBuf>,
}

/// Forwarded arguments as the entry point receives them: a contiguous array
/// of NUL-terminated platform strings, sized in bytes.
pub struct EntryArgs {
    // Owns the strings `pointers` refers to.
    _strings: Vec<PdCString>,
    pointers: Vec<*const PdChar>,
}

impl EntryArgs {
    pub fn new(args: &[OsString]) -> Result<EntryArgs> {
        let strings = args.iter().map(pd_string).collect::<Result<Vec<_>>>()?;
        let pointers = strings.iter().map(|s| s.as_ptr()).collect();
        Ok(EntryArgs { _strings: strings, pointers })
    }

    /// `(null, 0)` when there is nothing to forward.
    pub fn as_raw(&self) -> (*mut c_void, i32) {
        if self.pointers.is_empty() {
            return (ptr::null_mut(), 0);
        }
        let size = self.pointers.len() * mem::size_of::<*const PdChar>();
        (self.pointers.as_ptr() as *mut c_void, size as i32)
    }
}

/// Runs the managed entry point described by `app` and returns its result.
pub fn run_app(host_exe: &Path, app: &AppData, options: &HostOptions) -> Result<i32> {
    let mut locator = HostfxrLocator::new(host_directory(host_exe)?);
    locator.hostfxr = options.hostfxr.clone();
    locator.nethost = options.nethost.clone();
    locator.dotnet_root = options.dotnet_root.clone();
    let hostfxr_path = locator.locate(&app.path)?;

    let hostfxr = Hostfxr::load(&hostfxr_path)?;
    hostfxr.set_error_writer();

    let runtime_config = match &options.runtime_config {
        Some(runtime_config) => runtime_config.clone(),
        None => app.runtime_config_path(),
    };
    tracing::debug!(runtime_config = %runtime_config.display(), "initializing runtime");
    let init = InitOptions {
        host_path: Some(host_exe),
        dotnet_root: options.dotnet_root.as_deref(),
    };
    let loader = {
        let context = hostfxr.initialize_for_runtime_config(&runtime_config, &init)?;
        context.get_assembly_loader()?
    };

    let type_name = app.type_name()?;
    tracing::debug!(
        assembly = %app.path.display(),
        %type_name,
        method = %app.entry_point,
        "resolving entry point"
    );
    let entry_point = loader.get_function_pointer(&app.path, &type_name, &app.entry_point)?;

    let args = EntryArgs::new(&app.args)?;
    let (arg, size) = args.as_raw();
    let exit_code = unsafe { (*entry_point)(arg, size) };
    tracing::debug!(exit_code, "entry point returned");
    Ok(exit_code)
}
