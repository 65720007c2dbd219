//! External collaborator commands.
//!
//! The EEPROM flash itself, the inventory of release images and the live
//! bootloader configuration all belong to other tools; this module only
//! shells out to them and surfaces their failures verbatim.

use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use log::{debug, info};
use thiserror::Error;

/// The firmware update tool that lists release images and schedules flashes
const UPDATE_TOOL: &str = "rpi-eeprom-update";

/// The firmware query tool that reports the running bootloader state
const FIRMWARE_TOOL: &str = "vcgencmd";

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{} exited with {}: {}", _0, _1, _2)]
    CommandFailed(&'static str, ExitStatus, String),

    #[error("{} did not print an image path", UPDATE_TOOL)]
    NoImagePath,

    #[error("The editor {:?} exited with {}", _0, _1)]
    EditorFailed(String, ExitStatus),

    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}

/// Runs `command` and returns its stdout, mapping a non-zero exit to
/// `HostError::CommandFailed`
fn run(name: &'static str, command: &mut Command) -> Result<String, HostError> {
    debug!("Running {:?}", command);

    let output = command.output()?;

    if !output.status.success() {
        return Err(HostError::CommandFailed(
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns the path of the latest release image known to the update tool
pub fn latest_eeprom_image() -> Result<PathBuf, HostError> {
    let stdout = run(UPDATE_TOOL, Command::new(UPDATE_TOOL).arg("-l"))?;

    let path = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(PathBuf::from)
        .ok_or(HostError::NoImagePath)?;

    info!("Latest release image is {:?}", path);

    Ok(path)
}

/// Schedules `image` to be flashed to the EEPROM on the next reboot
pub fn schedule_update(image: &Path) -> Result<(), HostError> {
    info!("Scheduling EEPROM update with {:?}", image);

    run(
        UPDATE_TOOL,
        Command::new(UPDATE_TOOL).arg("-d").arg("-f").arg(image),
    )?;

    Ok(())
}

/// Reads the configuration the running bootloader reported at boot
pub fn current_bootloader_config() -> Result<String, HostError> {
    run(FIRMWARE_TOOL, Command::new(FIRMWARE_TOOL).arg("bootloader_config"))
}

/// Opens `path` in the user's editor and blocks until it exits
pub fn edit_file(path: &Path) -> Result<(), HostError> {
    let editor = env::var("EDITOR").unwrap_or_else(|_| String::from("vi"));

    debug!("Opening {:?} in {:?}", path, editor);

    let status = Command::new(&editor).arg(path).status()?;

    if !status.success() {
        return Err(HostError::EditorFailed(editor, status));
    }

    Ok(())
}

/// Prints `prompt` and waits for the operator to confirm with `y`
pub fn confirm(prompt: &str) -> Result<bool, HostError> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    Ok(matches!(line.trim(), "y" | "Y"))
}
