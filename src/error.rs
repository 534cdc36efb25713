use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::status::Status;

/// Hosting API calls whose status codes we check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostingCall {
    GetHostfxrPath,
    InitializeForRuntimeConfig,
    GetRuntimeDelegate,
    LoadAssemblyAndGetFunctionPointer,
}

impl HostingCall {
    pub fn symbol(self) -> &'static str {
        match self {
            HostingCall::GetHostfxrPath => "get_hostfxr_path",
            HostingCall::InitializeForRuntimeConfig => "hostfxr_initialize_for_runtime_config",
            HostingCall::GetRuntimeDelegate => "hostfxr_get_runtime_delegate",
            HostingCall::LoadAssemblyAndGetFunctionPointer => {
                "load_assembly_and_get_function_pointer"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to resolve the host executable path")]
    HostPath(#[source] io::Error),

    #[error("failed to resolve the path '{}'", .path.display())]
    AssemblyPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{}' has no usable file name", .path.display())]
    AssemblyName { path: PathBuf },

    #[error("string contains an interior nul: {0:?}")]
    InteriorNul(OsString),

    #[error("could not locate hostfxr: {0}")]
    HostfxrNotFound(String),

    #[error("failed to load library '{}'", .path.display())]
    LoadLibrary {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("library does not export '{name}'")]
    MissingExport {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("{} failed with status {status}", .call.symbol())]
    Hosting { call: HostingCall, status: Status },

    #[error("{} returned a null pointer", .call.symbol())]
    NullPointer { call: HostingCall },
}

impl HostError {
    /// Exit code for any failure on the native side.
    pub const EXIT_CODE: i32 = -1;

    /// Short diagnostic prefix for the stage that failed.
    pub fn category(&self) -> &'static str {
        match self {
            HostError::HostPath(_)
            | HostError::AssemblyPath { .. }
            | HostError::AssemblyName { .. }
            | HostError::InteriorNul(_) => "Path Error",
            HostError::HostfxrNotFound(_)
            | HostError::LoadLibrary { .. }
            | HostError::MissingExport { .. } => "Host Error",
            HostError::Hosting { call, .. } | HostError::NullPointer { call } => match call {
                HostingCall::GetHostfxrPath => "Host Error",
                HostingCall::InitializeForRuntimeConfig | HostingCall::GetRuntimeDelegate => {
                    "Init Error"
                }
                HostingCall::LoadAssemblyAndGetFunctionPointer => "Entry Error",
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
