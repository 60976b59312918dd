//! # Elevation Module
//!
//! Handles User Account Control (UAC) privileges on Windows.
//!
//! The elevation state decides where an install lands:
//! - elevated: `HKLM\Software\Classes` and `%ProgramFiles%` for all users,
//! - not elevated: `HKCU\Software\Classes` and `%LOCALAPPDATA%\Programs` for the current user.
//!
//! Manifests with `require_admin` make the CLI relaunch itself through the `runas` verb
//! before anything is touched.

use log::info;
use crate::system::{RegistryScope, SystemOps};

/// Checks if the current process has administrative privileges.
///
/// Opens the current process token and queries `TokenElevation`.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut token = HANDLE::default();
    unsafe {
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return false;
        }
        let mut elevation = TOKEN_ELEVATION::default();
        let mut size = 0;
        let queried = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        )
        .is_ok();
        let _ = CloseHandle(token);
        queried && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    false
}

/// Relaunches the current executable with the same arguments through the "runas" verb.
///
/// Returns `true` if the elevated process was spawned. `false` means the user declined the
/// UAC prompt or the shell call failed.
#[cfg(windows)]
pub fn relaunch_as_admin() -> bool {
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::UI::Shell::ShellExecuteW;
    use windows::Win32::UI::WindowsAndMessaging::SW_SHOW;

    let Ok(exe_path) = std::env::current_exe() else {
        return false;
    };
    let args: Vec<String> = std::env::args().skip(1).map(|a| quote_arg(&a)).collect();
    let params = args.join(" ");
    info!("Relaunching as admin: {:?} {}", exe_path, params);

    let verb = HSTRING::from("runas");
    let file = HSTRING::from(exe_path.as_os_str());
    let params = HSTRING::from(params.as_str());

    let result = unsafe {
        ShellExecuteW(
            None,
            &verb,
            &file,
            &params,
            PCWSTR::null(),
            SW_SHOW,
        )
    };
    // ShellExecute returns an HINSTANCE > 32 on success.
    result.0 as isize > 32
}

#[cfg(not(windows))]
pub fn relaunch_as_admin() -> bool {
    info!("Elevation is only available on Windows");
    false
}

/// Quotes one command-line argument for `CommandLineToArgvW`-style parsing.
#[cfg(any(windows, test))]
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut out = String::from("\"");
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.push_str(&"\\".repeat(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.push_str(&"\\".repeat(backslashes * 2));
    out.push('"');
    out
}

/// Machine scope when elevated, user scope otherwise.
pub fn resolve_scope(system: &impl SystemOps) -> RegistryScope {
    if system.is_elevated() {
        RegistryScope::Machine
    } else {
        RegistryScope::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockSystem;

    #[test]
    fn scope_follows_elevation() {
        let admin = MockSystem { elevated: true, ..Default::default() };
        assert_eq!(resolve_scope(&admin), RegistryScope::Machine);
        assert_eq!(resolve_scope(&MockSystem::new()), RegistryScope::User);
    }

    #[test]
    fn quote_arg_leaves_plain_args() {
        assert_eq!(quote_arg("install"), "install");
        assert_eq!(quote_arg("--yes"), "--yes");
    }

    #[test]
    fn quote_arg_wraps_spaces_and_trailing_backslash() {
        assert_eq!(quote_arg(r"C:\Program Files\"), r#""C:\Program Files\\""#);
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(""), r#""""#);
    }
}
