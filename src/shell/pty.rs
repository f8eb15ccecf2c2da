//! PTY allocation, command spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd is kept alive for
//! the command's lifetime so resize keeps working; I/O runs on dup'd fds.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::fs::File;
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program` on the slave side of the PTY as a session leader with
/// the slave as its controlling terminal.
pub fn spawn_command_pty(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    env: &[(String, String)],
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    cmd.env("TERM", "xterm-256color");
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    // stdio is wired to the slave in pre_exec.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Independent reader and writer handles on the PTY master.
pub fn master_io(master: &OwnedFd) -> std::io::Result<(File, File)> {
    let reader = std::fs::File::from(master.try_clone()?);
    let writer = std::fs::File::from(master.try_clone()?);
    Ok((File::from_std(reader), File::from_std(writer)))
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_spawn_and_echo_through_pty() {
        let pty = allocate_pty(24, 80).unwrap();
        let mut child = spawn_command_pty(&pty, "/bin/cat", &[], &[]).unwrap();
        let (mut reader, mut writer) = master_io(&pty.master).unwrap();
        writer.write_all(b"hello\r").await.unwrap();
        writer.flush().await.unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&seen).contains("hello") {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        resize_pty(&pty.master, 40, 120).unwrap();
        child.kill().await.unwrap();
    }
}
