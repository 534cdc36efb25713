//! Status codes returned by the hosting components.

use std::fmt;

pub const HOST_API_BUFFER_TOO_SMALL: i32 = 0x80008098_u32 as i32;

/// A raw hosting status code. Negative values are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub i32);

impl Status {
    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 as u32 {
            0x0000_0000 => "Success",
            0x0000_0001 => "Success_HostAlreadyInitialized",
            0x0000_0002 => "Success_DifferentRuntimeProperties",
            0x8000_8081 => "InvalidArgFailure",
            0x8000_8082 => "CoreHostLibLoadFailure",
            0x8000_8083 => "CoreHostLibMissingFailure",
            0x8000_8084 => "CoreHostEntryPointFailure",
            0x8000_8085 => "CoreHostCurHostFindFailure",
            0x8000_8087 => "CoreClrResolveFailure",
            0x8000_8088 => "CoreClrBindFailure",
            0x8000_8089 => "CoreClrInitFailure",
            0x8000_808a => "CoreClrExeFailure",
            0x8000_808b => "ResolverInitFailure",
            0x8000_808c => "ResolverResolveFailure",
            0x8000_808e => "LibHostInitFailure",
            0x8000_8092 => "LibHostInvalidArgs",
            0x8000_8093 => "InvalidConfigFile",
            0x8000_8096 => "FrameworkMissingFailure",
            0x8000_8097 => "HostApiFailed",
            0x8000_8098 => "HostApiBufferTooSmall",
            0x8000_809c => "FrameworkCompatFailure",
            0x8000_80a2 => "HostApiUnsupportedVersion",
            0x8000_80a3 => "HostInvalidState",
            0x8000_80a5 => "CoreHostIncompatibleConfig",
            0x8000_80a6 => "HostApiUnsupportedScenario",
            0x8000_80a7 => "HostFeatureDisabled",
            0x8007_0002 => "FileNotFound",
            0x8013_1522 => "TypeLoadException",
            0x8013_1513 => "MissingMethodException",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)?;
        if let Some(name) = self.name() {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}
