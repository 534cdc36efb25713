//! Locating the hostfxr library.
//!
//! An explicit path wins. Otherwise `nethost` is asked, when its library can
//! be found, and finally the `host/fxr` directories of the known install
//! roots are searched for the newest version.

use libloading as lib;
use netcorehost::pdcstring::PdChar;

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::error::{HostError, HostingCall, Result};
use crate::hostfxr::{export, open_library, pd_string, read_pd_string};
use crate::status::{self, Status};

const MAX_PATH: usize = 4096;

type GetHostfxrPathFn = unsafe extern "system" fn(
    buffer: *mut PdChar,
    buffer_size: *mut usize,
    parameters: *const GetHostfxrParameters,
) -> i32;

#[repr(C)]
struct GetHostfxrParameters {
    size: usize,
    assembly_path: *const PdChar,
    dotnet_root: *const PdChar,
}

#[cfg(windows)]
const DEFAULT_DOTNET_ROOTS: &[&str] = &[
    "C:\\Program Files\\dotnet",
    "C:\\Program Files (x86)\\dotnet",
];
#[cfg(target_os = "macos")]
const DEFAULT_DOTNET_ROOTS: &[&str] = &["/usr/local/share/dotnet"];
#[cfg(all(unix, not(target_os = "macos")))]
const DEFAULT_DOTNET_ROOTS: &[&str] = &[
    "/usr/share/dotnet",
    "/usr/lib/dotnet",
    "/usr/local/share/dotnet",
    "/opt/dotnet",
];

#[derive(Debug, Default)]
pub struct HostfxrLocator {
    /// Explicit hostfxr library; skips every other lookup.
    pub hostfxr: Option<PathBuf>,
    /// Explicit nethost library. Defaults to the one next to the host.
    pub nethost: Option<PathBuf>,
    pub dotnet_root: Option<PathBuf>,
    pub host_dir: PathBuf,
    /// Installs searched when nethost isn't available.
    pub search_roots: Vec<PathBuf>,
}

impl HostfxrLocator {
    pub fn new(host_dir: PathBuf) -> HostfxrLocator {
        HostfxrLocator {
            host_dir,
            search_roots: DEFAULT_DOTNET_ROOTS.iter().map(PathBuf::from).collect(),
            ..HostfxrLocator::default()
        }
    }

    /// `assembly` is passed to nethost so app-local runtimes are honoured.
    pub fn locate(&self, assembly: &Path) -> Result<PathBuf> {
        if let Some(hostfxr) = &self.hostfxr {
            if !hostfxr.is_file() {
                let reason = format!("'{}' does not exist", hostfxr.display());
                return Err(HostError::HostfxrNotFound(reason));
            }
            return Ok(hostfxr.clone());
        }

        let nethost = match &self.nethost {
            Some(nethost) => nethost.clone(),
            None => self.host_dir.join(lib::library_filename("nethost")),
        };
        if nethost.is_file() {
            return self.ask_nethost(&nethost, assembly);
        }
        tracing::debug!(path = %nethost.display(), "no nethost library, searching install roots");

        self.dotnet_root
            .iter()
            .chain(self.search_roots.iter())
            .find_map(|root| newest_hostfxr(root))
            .ok_or_else(|| {
                let reason = "no nethost library and no installed runtime found";
                HostError::HostfxrNotFound(reason.to_string())
            })
    }

    fn ask_nethost(&self, nethost: &Path, assembly: &Path) -> Result<PathBuf> {
        let library = open_library(nethost)?;
        let get_hostfxr_path: GetHostfxrPathFn = export(&library, "get_hostfxr_path")?;

        let assembly_path = pd_string(assembly)?;
        let dotnet_root = self.dotnet_root.as_ref().map(pd_string).transpose()?;
        let parameters = GetHostfxrParameters {
            size: mem::size_of::<GetHostfxrParameters>(),
            assembly_path: assembly_path.as_ptr(),
            dotnet_root: dotnet_root.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
        };

        let path = query_hostfxr_path(get_hostfxr_path, &parameters)?;
        tracing::debug!(
            nethost = %nethost.display(),
            hostfxr = %path.display(),
            "nethost resolved hostfxr"
        );
        Ok(path)
    }
}

/// Calls `get_hostfxr_path`, retrying once with the size it asks for when the
/// first buffer is too small.
fn query_hostfxr_path(
    get_hostfxr_path: GetHostfxrPathFn,
    parameters: &GetHostfxrParameters,
) -> Result<PathBuf> {
    let mut buffer: Vec<PdChar> = vec![0; MAX_PATH];
    let mut size = buffer.len();
    let mut rc = unsafe { get_hostfxr_path(buffer.as_mut_ptr(), &mut size, parameters) };
    if rc == status::HOST_API_BUFFER_TOO_SMALL {
        tracing::debug!(size, "hostfxr path buffer too small, retrying");
        buffer.resize(size, 0);
        size = buffer.len();
        rc = unsafe { get_hostfxr_path(buffer.as_mut_ptr(), &mut size, parameters) };
    }
    let status = Status(rc);
    if status.is_failure() {
        return Err(HostError::Hosting { call: HostingCall::GetHostfxrPath, status });
    }
    if let Some(last) = buffer.last_mut() {
        *last = 0;
    }
    Ok(PathBuf::from(unsafe { read_pd_string(buffer.as_ptr()) }))
}

/// Newest `<root>/host/fxr/<version>/<hostfxr library>`, if any.
fn newest_hostfxr(root: &Path) -> Option<PathBuf> {
    let fxr_dir = root.join("host").join("fxr");
    let library = lib::library_filename("hostfxr");
    fs::read_dir(&fxr_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let version = entry.file_name().to_str().and_then(FxrVersion::parse)?;
            let candidate = entry.path().join(&library);
            candidate.is_file().then_some((version, candidate))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, path)| path)
}

/// One dot-separated prerelease identifier. Numeric identifiers compare
/// numerically and sort below alphanumeric ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Identifier {
    Numeric(u64),
    Alphanumeric(String),
}

/// Orders `host/fxr` directory names. Components compare numerically and a
/// release sorts above its prereleases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FxrVersion {
    numbers: Vec<u64>,
    is_release: bool,
    prerelease: Vec<Identifier>,
}

impl FxrVersion {
    fn parse(name: &str) -> Option<FxrVersion> {
        let (core, prerelease) = match name.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (name, None),
        };
        let numbers = core
            .split('.')
            .map(|n| n.parse().ok())
            .collect::<Option<Vec<u64>>>()?;
        let prerelease = prerelease
            .map(|pre| {
                pre.split('.')
                    .map(|id| match id.parse() {
                        Ok(n) => Identifier::Numeric(n),
                        Err(_) => Identifier::Alphanumeric(id.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(FxrVersion {
            numbers,
            is_release: name.split_once('-').is_none(),
            prerelease,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    const RESOLVED: &str = "/usr/share/dotnet/host/fxr/8.0.1/libhostfxr.so";

    thread_local! {
        static CALLS: Cell<usize> = Cell::new(0);
        static LAST_SIZE: Cell<usize> = Cell::new(0);
    }

    fn count_call(size: usize) {
        CALLS.with(|calls| calls.set(calls.get() + 1));
        LAST_SIZE.with(|last| last.set(size));
    }

    unsafe fn write_path(buffer: *mut PdChar, text: &str) {
        let path = pd_string(text).unwrap();
        let mut len = 0;
        while *path.as_ptr().add(len) != 0 {
            len += 1;
        }
        ptr::copy_nonoverlapping(path.as_ptr(), buffer, len + 1);
    }

    /// Asks for a buffer larger than the default first.
    unsafe extern "system" fn wants_bigger_buffer(
        buffer: *mut PdChar,
        buffer_size: *mut usize,
        _parameters: *const GetHostfxrParameters,
    ) -> i32 {
        count_call(*buffer_size);
        if *buffer_size < 6000 {
            *buffer_size = 6000;
            return status::HOST_API_BUFFER_TOO_SMALL;
        }
        write_path(buffer, RESOLVED);
        0
    }

    unsafe extern "system" fn never_big_enough(
        _buffer: *mut PdChar,
        buffer_size: *mut usize,
        _parameters: *const GetHostfxrParameters,
    ) -> i32 {
        count_call(*buffer_size);
        *buffer_size += 1;
        status::HOST_API_BUFFER_TOO_SMALL
    }

    unsafe extern "system" fn no_runtime(
        _buffer: *mut PdChar,
        buffer_size: *mut usize,
        _parameters: *const GetHostfxrParameters,
    ) -> i32 {
        count_call(*buffer_size);
        0x80008083_u32 as i32
    }

    unsafe extern "system" fn resolves_first_time(
        buffer: *mut PdChar,
        buffer_size: *mut usize,
        _parameters: *const GetHostfxrParameters,
    ) -> i32 {
        count_call(*buffer_size);
        write_path(buffer, RESOLVED);
        0
    }

    fn empty_parameters() -> GetHostfxrParameters {
        CALLS.with(|calls| calls.set(0));
        GetHostfxrParameters {
            size: mem::size_of::<GetHostfxrParameters>(),
            assembly_path: ptr::null(),
            dotnet_root: ptr::null(),
        }
    }

    fn calls() -> usize {
        CALLS.with(Cell::get)
    }

    fn install(root: &Path, version: &str) -> PathBuf {
        let dir = root.join("host").join("fxr").join(version);
        fs::create_dir_all(&dir).unwrap();
        let library = dir.join(lib::library_filename("hostfxr"));
        fs::write(&library, b"").unwrap();
        library
    }

    fn locator(host_dir: &Path, roots: &[&Path]) -> HostfxrLocator {
        HostfxrLocator {
            host_dir: host_dir.to_path_buf(),
            search_roots: roots.iter().map(|r| r.to_path_buf()).collect(),
            ..HostfxrLocator::default()
        }
    }

    #[test]
    fn nethost_answer_is_read_from_the_buffer() {
        let parameters = empty_parameters();
        let path = query_hostfxr_path(resolves_first_time, &parameters).unwrap();
        assert_eq!(path, PathBuf::from(RESOLVED));
        assert_eq!(calls(), 1);
        assert_eq!(LAST_SIZE.with(Cell::get), MAX_PATH);
    }

    #[test]
    fn retries_once_with_the_requested_size() {
        let parameters = empty_parameters();
        let path = query_hostfxr_path(wants_bigger_buffer, &parameters).unwrap();
        assert_eq!(path, PathBuf::from(RESOLVED));
        assert_eq!(calls(), 2);
        assert_eq!(LAST_SIZE.with(Cell::get), 6000);
    }

    #[test]
    fn second_too_small_is_a_host_error() {
        let parameters = empty_parameters();
        let err = query_hostfxr_path(never_big_enough, &parameters).unwrap_err();
        assert!(matches!(err, HostError::Hosting { call: HostingCall::GetHostfxrPath, .. }));
        assert_eq!(err.category(), "Host Error");
        assert_eq!(calls(), 2);
    }

    #[test]
    fn nethost_failure_is_a_host_error() {
        let parameters = empty_parameters();
        let err = query_hostfxr_path(no_runtime, &parameters).unwrap_err();
        assert_eq!(err.category(), "Host Error");
        assert_eq!(
            err.to_string(),
            "get_hostfxr_path failed with status 0x80008083 (CoreHostLibMissingFailure)"
        );
        assert_eq!(calls(), 1);
    }

    #[test]
    fn versions_order_numerically() {
        let v = |s| FxrVersion::parse(s).unwrap();
        assert!(v("10.0.0") > v("9.0.1"));
        assert!(v("8.0.10") > v("8.0.9"));
        assert!(v("8.0.0") > v("8.0.0-rc.2.23502.2"));
        assert!(v("8.0.0-rc.2") > v("8.0.0-rc.1"));
        assert!(v("8.0.0-rc.10") > v("8.0.0-rc.2"));
        assert!(v("8.0.0-rc.1") > v("8.0.0-preview.7"));
        assert!(v("8.0.0-rc.1.1") > v("8.0.0-rc.1"));
        assert_eq!(FxrVersion::parse("latest"), None);
        assert_eq!(FxrVersion::parse("8..0"), None);
    }

    #[test]
    fn picks_newest_installed_fxr() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "6.0.25");
        let newest = install(root.path(), "8.0.1");
        install(root.path(), "8.0.1-preview.7");
        install(root.path(), "notaversion");
        // A version directory without the library is skipped.
        fs::create_dir_all(root.path().join("host/fxr/9.0.0")).unwrap();

        assert_eq!(newest_hostfxr(root.path()), Some(newest));
    }

    #[test]
    fn picks_newest_prerelease() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "9.0.0-rc.2");
        let newest = install(root.path(), "9.0.0-rc.10");
        assert_eq!(newest_hostfxr(root.path()), Some(newest));
    }

    #[test]
    fn dotnet_root_comes_before_search_roots() {
        let host = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let custom = tempfile::tempdir().unwrap();
        install(system.path(), "9.0.0");
        let expected = install(custom.path(), "7.0.0");

        let mut locator = locator(host.path(), &[system.path()]);
        locator.dotnet_root = Some(custom.path().to_path_buf());
        assert_eq!(locator.locate(Path::new("/apps/TestApp.dll")).unwrap(), expected);
    }

    #[test]
    fn falls_through_empty_roots() {
        let host = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let expected = install(system.path(), "8.0.0");

        let locator = locator(host.path(), &[empty.path(), system.path()]);
        assert_eq!(locator.locate(Path::new("/apps/TestApp.dll")).unwrap(), expected);
    }

    #[test]
    fn explicit_hostfxr_must_exist() {
        let host = tempfile::tempdir().unwrap();
        let mut locator = locator(host.path(), &[]);
        let missing = host.path().join("missing").join(lib::library_filename("hostfxr"));
        locator.hostfxr = Some(missing);
        let err = locator.locate(Path::new("/apps/TestApp.dll")).unwrap_err();
        assert!(matches!(err, HostError::HostfxrNotFound(_)));

        let present = install(host.path(), "8.0.0");
        locator.hostfxr = Some(present.clone());
        assert_eq!(locator.locate(Path::new("/apps/TestApp.dll")).unwrap(), present);
    }

    #[test]
    fn reports_when_nothing_is_installed() {
        let host = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let err = locator(host.path(), &[empty.path()])
            .locate(Path::new("/apps/TestApp.dll"))
            .unwrap_err();
        assert_eq!(err.category(), "Host Error");
    }

    #[test]
    fn broken_nethost_is_a_load_error() {
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join(lib::library_filename("nethost")), b"garbage").unwrap();
        let err = locator(host.path(), &[])
            .locate(Path::new("/apps/TestApp.dll"))
            .unwrap_err();
        assert!(matches!(err, HostError::LoadLibrary { .. }));
    }
}
