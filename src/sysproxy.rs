//! System proxy hook.
//!
//! While a tunnel runs, unconfigured applications should route through
//! it; this module flips the per-user OS proxy settings on and off. On
//! Windows that means the WinINet `Internet Settings` registry values;
//! other platforms report the capability as unavailable and the tunnel
//! keeps working for explicitly configured clients.

use std::io;

/// Opaque set/clear capability used by the supervisor around a session.
pub trait SystemProxy: Send + Sync {
    /// Route HTTP/HTTPS through `http_addr` and everything else through
    /// `socks_addr`.
    fn set(&self, http_addr: &str, socks_addr: &str) -> io::Result<()>;

    /// Restore direct connectivity.
    fn clear(&self) -> io::Result<()>;
}

/// The platform's native backend.
pub struct PlatformProxy;

impl SystemProxy for PlatformProxy {
    #[cfg(windows)]
    fn set(&self, http_addr: &str, socks_addr: &str) -> io::Result<()> {
        windows::set(http_addr, socks_addr)
    }

    #[cfg(windows)]
    fn clear(&self) -> io::Result<()> {
        windows::clear()
    }

    #[cfg(not(windows))]
    fn set(&self, _http_addr: &str, _socks_addr: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "system proxy management is only implemented on Windows",
        ))
    }

    #[cfg(not(windows))]
    fn clear(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "system proxy management is only implemented on Windows",
        ))
    }
}

/// Hosts that must never go through the proxy.
#[cfg(windows)]
const BYPASS_LIST: &str = "localhost;127.*;10.*;192.168.*;<local>";

#[cfg(windows)]
mod windows {
    use super::*;
    use std::process::Command;
    use tracing::info;

    const INTERNET_SETTINGS: &str =
        r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;
    const INTERNET_OPTION_REFRESH: u32 = 37;

    fn reg_set(value: &str, kind: &str, data: &str) -> io::Result<()> {
        let status = Command::new("reg")
            .args(["add", INTERNET_SETTINGS, "/v", value, "/t", kind, "/d", data, "/f"])
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "reg add {value} exited with {status}"
            )));
        }
        Ok(())
    }

    fn reg_delete(value: &str) {
        // Missing value is fine.
        let _ = Command::new("reg")
            .args(["delete", INTERNET_SETTINGS, "/v", value, "/f"])
            .status();
    }

    /// Tell WinINet consumers the proxy settings changed so running
    /// browsers pick them up without a restart.
    fn notify() {
        #[link(name = "wininet")]
        extern "system" {
            fn InternetSetOptionW(
                internet: *mut core::ffi::c_void,
                option: u32,
                buffer: *mut core::ffi::c_void,
                length: u32,
            ) -> i32;
        }
        unsafe {
            InternetSetOptionW(
                core::ptr::null_mut(),
                INTERNET_OPTION_SETTINGS_CHANGED,
                core::ptr::null_mut(),
                0,
            );
            InternetSetOptionW(
                core::ptr::null_mut(),
                INTERNET_OPTION_REFRESH,
                core::ptr::null_mut(),
                0,
            );
        }
    }

    pub(super) fn set(http_addr: &str, socks_addr: &str) -> io::Result<()> {
        // Per-protocol proxy string: browsers use the HTTP entries,
        // everything else falls back to SOCKS.
        let server = format!("http={http_addr};https={http_addr};socks={socks_addr}");
        reg_set("ProxyEnable", "REG_DWORD", "1")?;
        reg_set("ProxyServer", "REG_SZ", &server)?;
        reg_set("ProxyOverride", "REG_SZ", super::BYPASS_LIST)?;
        notify();
        info!("system proxy set: {}", server);
        Ok(())
    }

    pub(super) fn clear() -> io::Result<()> {
        reg_set("ProxyEnable", "REG_DWORD", "0")?;
        reg_delete("ProxyServer");
        notify();
        info!("system proxy cleared");
        Ok(())
    }
}
