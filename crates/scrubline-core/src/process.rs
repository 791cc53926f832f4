//! Cross-platform process spawning helpers.
//!
//! Every subprocess the core starts (ffmpeg, ffprobe, worker processes) goes
//! through [`configure_tokio_command`] so that Windows does not flash a console
//! window and so that a dropped handle never leaves an orphaned child behind.

use std::process::Stdio;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific flags to a std process command.
pub fn configure_std_command(cmd: &mut std::process::Command) {
    cmd.stdin(Stdio::null());

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

/// Apply platform flags and supervision defaults to a tokio process command.
///
/// stdin is closed, and the child is killed when its handle is dropped.
pub fn configure_tokio_command(cmd: &mut tokio::process::Command) {
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

/// Same as [`configure_tokio_command`] but keeps stdin piped for protocol use.
pub fn configure_piped_command(cmd: &mut tokio::process::Command) {
    configure_tokio_command(cmd);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
}
