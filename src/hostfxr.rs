use libloading as lib;
use netcorehost::pdcstring::{PdCStr, PdCString, PdChar};

use std::ffi::{OsStr, OsString};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::os::raw::c_void;
use std::path::Path;
use std::ptr;

use crate::error::{HostError, HostingCall, Result};
use crate::status::Status;

pub type HostfxrHandle = *mut c_void;

/// `hdt_load_assembly_and_get_function_pointer` from `hostfxr.h`.
const HDT_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER: i32 = 5;

type HostfxrInitializeForRuntimeConfigFn = unsafe extern "C" fn(
    runtime_config_path: *const PdChar,
    parameters: *const HostfxrInitializeParameters,
    host_context_handle: *mut HostfxrHandle,
) -> i32;
type HostfxrGetRuntimeDelegateFn =
    unsafe extern "C" fn(handle: HostfxrHandle, kind: i32, delegate: *mut *mut c_void) -> i32;
type HostfxrCloseFn = unsafe extern "C" fn(handle: HostfxrHandle) -> i32;
type HostfxrErrorWriterFn = unsafe extern "C" fn(message: *const PdChar);
type HostfxrSetErrorWriterFn =
    unsafe extern "C" fn(writer: Option<HostfxrErrorWriterFn>) -> Option<HostfxrErrorWriterFn>;
type LoadAssemblyAndGetFunctionPointerFn = unsafe extern "system" fn(
    assembly_path: *const PdChar,
    type_name: *const PdChar,
    method_name: *const PdChar,
    delegate_type_name: *const PdChar,
    reserved: *mut c_void,
    delegate: *mut *mut c_void,
) -> i32;

/// Default managed entry point signature: `int (void* arg, int32 size)`.
pub type ComponentEntryPointFn = unsafe extern "system" fn(arg: *mut c_void, size: i32) -> i32;

#[repr(C)]
struct HostfxrInitializeParameters {
    size: usize,
    host_path: *const PdChar,
    dotnet_root: *const PdChar,
}

/// Opens a native library, mapping failures to [`HostError::LoadLibrary`].
pub(crate) fn open_library(path: &Path) -> Result<lib::Library> {
    unsafe { lib::Library::new(path) }.map_err(|source| HostError::LoadLibrary {
        path: path.to_path_buf(),
        source,
    })
}

/// Copies an exported function pointer out of `library`.
///
/// The caller must keep `library` loaded for as long as the pointer is used
/// and `T` must match the export's real signature.
pub(crate) fn export<T: Copy>(library: &lib::Library, name: &'static str) -> Result<T> {
    let symbol: lib::Symbol<T> = unsafe { library.get(name.as_bytes()) }
        .map_err(|source| HostError::MissingExport { name, source })?;
    Ok(*symbol)
}

pub(crate) fn pd_string(s: impl AsRef<OsStr>) -> Result<PdCString> {
    let s = s.as_ref();
    PdCString::from_os_str(s).map_err(|_| HostError::InteriorNul(s.to_os_string()))
}

/// Copies a native NUL-terminated string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated `char_t` string.
pub(crate) unsafe fn read_pd_string(ptr: *const PdChar) -> OsString {
    if ptr.is_null() {
        return OsString::new();
    }
    PdCStr::from_str_ptr(ptr).to_os_string()
}

unsafe extern "C" fn write_hostfxr_error(message: *const PdChar) {
    let message = read_pd_string(message);
    tracing::error!(target: "hostfxr", "{}", message.to_string_lossy().trim_end());
}

/// A typed managed function pointer. It stays valid while the runtime that
/// produced it is loaded, which the `'fxr` borrow enforces.
pub struct ManagedDelegate<'fxr, T: 'fxr> {
    managed_pointer: *mut c_void,
    phantom: PhantomData<&'fxr T>,
}

impl<'fxr, T> Deref for ManagedDelegate<'fxr, T> {
    type Target = T;
    fn deref(&self) -> &T {
        debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());
        unsafe { &*(&self.managed_pointer as *const *mut c_void as *const T) }
    }
}

/// Initialization parameters for a runtime context. Only passed to hostfxr
/// when a dotnet root is configured.
#[derive(Debug, Default)]
pub struct InitOptions<'a> {
    pub host_path: Option<&'a Path>,
    pub dotnet_root: Option<&'a Path>,
}

#[derive(Debug)]
pub struct Hostfxr {
    // Keeps the function pointers below valid.
    _library: lib::Library,
    initialize_for_runtime_config: HostfxrInitializeForRuntimeConfigFn,
    get_runtime_delegate: HostfxrGetRuntimeDelegateFn,
    close: HostfxrCloseFn,
    set_error_writer: Option<HostfxrSetErrorWriterFn>,
}

impl Hostfxr {
    pub fn load(path: &Path) -> Result<Hostfxr> {
        let library = open_library(path)?;
        let initialize_for_runtime_config =
            export(&library, "hostfxr_initialize_for_runtime_config")?;
        let get_runtime_delegate = export(&library, "hostfxr_get_runtime_delegate")?;
        let close = export(&library, "hostfxr_close")?;
        // Older hostfxr builds predate the error writer.
        let set_error_writer = export(&library, "hostfxr_set_error_writer").ok();
        tracing::debug!(path = %path.display(), "loaded hostfxr");
        Ok(Hostfxr {
            _library: library,
            initialize_for_runtime_config,
            get_runtime_delegate,
            close,
            set_error_writer,
        })
    }

    /// Routes hostfxr's diagnostics for the current thread into the log.
    pub fn set_error_writer(&self) {
        match self.set_error_writer {
            Some(set_error_writer) => {
                unsafe { set_error_writer(Some(write_hostfxr_error)) };
            }
            None => tracing::debug!("hostfxr has no error writer export"),
        }
    }

    pub fn initialize_for_runtime_config(
        &self,
        runtime_config: &Path,
        options: &InitOptions<'_>,
    ) -> Result<HostfxrContext<'_>> {
        let call = HostingCall::InitializeForRuntimeConfig;
        let runtime_config = pd_string(runtime_config)?;

        // Keep the strings alive until the call returns.
        let host_path = options.host_path.map(pd_string).transpose()?;
        let dotnet_root = options.dotnet_root.map(pd_string).transpose()?;
        let parameters = HostfxrInitializeParameters {
            size: mem::size_of::<HostfxrInitializeParameters>(),
            host_path: host_path.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            dotnet_root: dotnet_root.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
        };
        let parameters_ptr = if dotnet_root.is_some() {
            &parameters as *const HostfxrInitializeParameters
        } else {
            ptr::null()
        };

        let mut handle = ptr::null_mut();
        let status = Status(unsafe {
            (self.initialize_for_runtime_config)(
                runtime_config.as_ptr(),
                parameters_ptr,
                &mut handle,
            )
        });

        // Wrap first so a handle returned alongside a failure still gets closed.
        let context = if handle.is_null() {
            None
        } else {
            Some(HostfxrContext { hostfxr: self, handle })
        };
        if status.is_failure() {
            return Err(HostError::Hosting { call, status });
        }
        if status.0 != 0 {
            tracing::debug!(%status, "runtime context initialized with a non-zero success code");
        }
        context.ok_or(HostError::NullPointer { call })
    }
}

/// An initialized hostfxr context; closed on drop.
#[derive(Debug)]
pub struct HostfxrContext<'fxr> {
    hostfxr: &'fxr Hostfxr,
    handle: HostfxrHandle,
}

impl Drop for HostfxrContext<'_> {
    fn drop(&mut self) {
        // Drop can't report failures, so the best we can do is log them.
        let status = Status(unsafe { (self.hostfxr.close)(self.handle) });
        if status.is_failure() {
            tracing::warn!(%status, "hostfxr_close failed");
        }
    }
}

impl<'fxr> HostfxrContext<'fxr> {
    /// The loader outlives the context: it only needs hostfxr to stay loaded.
    pub fn get_assembly_loader(&self) -> Result<AssemblyLoader<'fxr>> {
        let call = HostingCall::GetRuntimeDelegate;
        let mut delegate = ptr::null_mut();
        let status = Status(unsafe {
            (self.hostfxr.get_runtime_delegate)(
                self.handle,
                HDT_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER,
                &mut delegate,
            )
        });
        if status.is_failure() {
            return Err(HostError::Hosting { call, status });
        }
        if delegate.is_null() {
            return Err(HostError::NullPointer { call });
        }
        let load_assembly_and_get_function_pointer = unsafe {
            mem::transmute::<*mut c_void, LoadAssemblyAndGetFunctionPointerFn>(delegate)
        };
        Ok(AssemblyLoader {
            load_assembly_and_get_function_pointer,
            phantom: PhantomData,
        })
    }
}

pub struct AssemblyLoader<'fxr> {
    load_assembly_and_get_function_pointer: LoadAssemblyAndGetFunctionPointerFn,
    phantom: PhantomData<&'fxr Hostfxr>,
}

impl<'fxr> AssemblyLoader<'fxr> {
    /// Loads `assembly` and resolves `type_name::method_name` with the default
    /// [`ComponentEntryPointFn`] signature.
    pub fn get_function_pointer(
        &self,
        assembly: &Path,
        type_name: &str,
        method_name: &str,
    ) -> Result<ManagedDelegate<'fxr, ComponentEntryPointFn>> {
        let call = HostingCall::LoadAssemblyAndGetFunctionPointer;
        let assembly_ptr = pd_string(assembly)?;
        let type_name_ptr = pd_string(type_name)?;
        let method_name_ptr = pd_string(method_name)?;
        let mut managed_pointer = ptr::null_mut();
        let status = Status(unsafe {
            (self.load_assembly_and_get_function_pointer)(
                assembly_ptr.as_ptr(),
                type_name_ptr.as_ptr(),
                method_name_ptr.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                &mut managed_pointer,
            )
        });
        if status.is_failure() {
            Err(HostError::Hosting { call, status })
        } else if managed_pointer.is_null() {
            Err(HostError::NullPointer { call })
        } else {
            Ok(ManagedDelegate { managed_pointer, phantom: PhantomData })
        }
    }
}
