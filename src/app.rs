//! The managed application a single host invocation runs.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{HostError, Result};

const RUNTIME_CONFIG_EXTENSION: &str = "runtimeconfig.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub path: PathBuf,
    pub entry_point: String,
    pub namespace: String,
    pub class: String,
    pub args: Vec<OsString>,
}

impl AppData {
    /// Canonicalizes the assembly path. hostfxr only accepts absolute paths.
    pub fn resolve(self) -> Result<AppData> {
        let path = std::fs::canonicalize(&self.path).map_err(|source| HostError::AssemblyPath {
            path: self.path.clone(),
            source,
        })?;
        Ok(AppData { path, ..self })
    }

    /// `app.dll` -> `app.runtimeconfig.json`, next to the assembly.
    pub fn runtime_config_path(&self) -> PathBuf {
        self.path.with_extension(RUNTIME_CONFIG_EXTENSION)
    }

    pub fn assembly_name(&self) -> Result<&str> {
        self.path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| HostError::AssemblyName {
                path: self.path.clone(),
            })
    }

    /// Assembly-qualified type name, e.g. `TestNamespace.TestApp, TestApp`.
    pub fn type_name(&self) -> Result<String> {
        let assembly = self.assembly_name()?;
        if self.namespace.is_empty() {
            Ok(format!("{}, {}", self.class, assembly))
        } else {
            Ok(format!("{}.{}, {}", self.namespace, self.class, assembly))
        }
    }
}
