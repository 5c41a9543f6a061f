//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal, spawns an argv on its slave side and hands the
//! master's reader and writer to the caller, keeping resize and kill here.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use shellroom_core::{RoomError, RoomResult};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// A managed PTY instance.
pub struct PtyHandle {
    /// Master side, kept for resize (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Taken by whoever waits for the exit status.
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
    size: Mutex<(u16, u16)>,
}

/// Master-side byte streams of a freshly spawned PTY.
pub struct PtyStreams {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl PtyHandle {
    /// Spawn `argv` under a new PTY of the given size.
    pub fn spawn(argv: &[String], cols: u16, rows: u16) -> RoomResult<(Self, PtyStreams)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RoomError::SessionCreationFailed("empty command".into()))?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RoomError::SessionCreationFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RoomError::SessionCreationFailed(format!("failed to spawn {program}: {e}")))?;
        // Only the child may hold the slave, or reads never see EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RoomError::SessionCreationFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RoomError::SessionCreationFailed(format!("failed to take PTY writer: {e}")))?;

        info!(program = %program, pid = ?child.process_id(), cols, rows, "PTY spawned");

        let handle = Self {
            master: Mutex::new(pair.master),
            killer: Mutex::new(child.clone_killer()),
            child: Mutex::new(Some(child)),
            killed: AtomicBool::new(false),
            size: Mutex::new((cols, rows)),
        };
        Ok((handle, PtyStreams { reader, writer }))
    }

    /// Resize the terminal seen by the child.
    pub fn resize(&self, cols: u16, rows: u16) -> RoomResult<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RoomError::Other(format!("PTY resize failed: {e}")))?;
        drop(master);
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = (cols, rows);
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Block until the child exits. Only the first caller gets a status.
    pub fn wait_blocking(&self) -> Option<i32> {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut child = child?;
        match child.wait() {
            Ok(status) => {
                let code = status.exit_code() as i32;
                debug!(code, "PTY child exited");
                Some(code)
            }
            Err(e) => {
                debug!(error = %e, "PTY wait failed");
                None
            }
        }
    }

    /// Kill the child. Safe to call any number of times.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = killer.kill() {
            // Usually the child already exited.
            debug!(error = %e, "PTY kill failed");
        }
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
