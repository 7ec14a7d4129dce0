use std::ffi::OsStr;
use std::process::{Command, Stdio};

/// Builds a command for one of the managed tools.
///
/// yt-dlp is a frozen Python program: without these variables it block-buffers
/// stdout when it is not a terminal and progress lines arrive in bursts.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    cmd.env("PYTHONUNBUFFERED", "1");
    cmd.env("PYTHONIOENCODING", "utf-8");
    configure_for_background(&mut cmd);
    cmd
}

/// Runs `program <arg>` and returns the first non-empty stdout line, if the
/// tool starts and exits successfully.
pub fn version_first_line(program: impl AsRef<OsStr>, arg: &str) -> Option<String> {
    let output = command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep console windows from flashing up behind the status-bar app.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}
