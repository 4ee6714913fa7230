//! Open a URL in the user's default browser (OAuth consent page).

use std::process::{Command, Stdio};

/// Whether we run inside Windows Subsystem for Linux.
fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| {
            let v = v.to_lowercase();
            v.contains("microsoft") || v.contains("wsl")
        })
        .unwrap_or(false)
}

/// Launcher commands to try, in order, for the current platform.
fn launchers(url: &str) -> Vec<Command> {
    let mut cmds = Vec::new();

    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/c", "start", "", url]);
        cmds.push(cmd);
    } else if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmds.push(cmd);
    } else if is_wsl() {
        let mut wslview = Command::new("wslview");
        wslview.arg(url);
        cmds.push(wslview);

        // Run from C:\ so cmd.exe does not complain about UNC paths
        let mut cmd = Command::new("cmd.exe");
        cmd.current_dir("/mnt/c/")
            .args(["/c", "start", "", url])
            .stderr(Stdio::null());
        cmds.push(cmd);
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmds.push(cmd);
    }

    cmds
}

/// Open `url`; `false` when no launcher could be started.
///
/// The caller always prints the URL too, so failure is not fatal.
pub fn open_browser(url: &str) -> bool {
    launchers(url)
        .into_iter()
        .any(|mut cmd| cmd.stdout(Stdio::null()).spawn().is_ok())
}
