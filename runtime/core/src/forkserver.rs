// SPDX-License-Identifier: GPL-3.0-or-later
//! The forkserver dispatch loop: two listening sockets, a long-lived parent, and a
//! short-lived per-request child that owns the entire SEND/END session machine for one
//! client. The fork boundary is the trust boundary for TA crashes — the parent never
//! touches TEE state in the hot path.

use crate::error::Result;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_: libc::c_int) {
    STOP_SOON.store(true, Ordering::SeqCst);
}

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::SeqCst)
}

fn set_stop_soon() {
    STOP_SOON.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

fn reset_signal_handlers_to_default() -> Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

/// The five-method capability record every TEE backend implements. Only `execute` is
/// mandatory; the lifecycle hooks default to no-ops so a backend with nothing to do at, say,
/// `pre_execute` doesn't have to say so.
pub trait BackendOps {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn pre_execute(&mut self, _status: &mut TcpStream) -> Result<()> {
        Ok(())
    }

    /// Runs inside the forked child with a fresh data connection; returns the process exit
    /// code the parent should observe (0 after END, 130 after TERMINATE).
    fn execute(&mut self, data: TcpStream) -> i32;

    fn post_execute(&mut self, _status: &mut TcpStream) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct Forkserver;

impl Forkserver {
    /// Run the dispatch loop to completion, returning the exit code the `executor` binary
    /// should report to its own caller. Always 0 after a clean stop (signal-driven or
    /// TERMINATE-driven — the 130 only ever appears as a child's own exit status) and 1 if
    /// backend initialization failed.
    pub fn run<O: BackendOps>(mut ops: O, port: u16) -> Result<i32> {
        install_signal_handlers()?;

        if let Err(e) = ops.init() {
            tracing::error!(error = %e, "backend initialization failed");
            return Ok(1);
        }

        let status_listener = TcpListener::bind(("0.0.0.0", port))?;
        let data_listener = TcpListener::bind(("0.0.0.0", port + 1))?;
        tracing::info!(port, "forkserver listening");

        let (mut status_stream, _) = status_listener.accept()?;

        while !stop_soon() {
            if let Err(e) = ops.pre_execute(&mut status_stream) {
                tracing::warn!(error = %e, "pre_execute failed");
            }

            let data_stream = match data_listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "data accept failed");
                    break;
                }
            };

            let span = tracing::debug_span!("request");
            let _enter = span.enter();

            match unsafe { fork() }? {
                ForkResult::Parent { child } => {
                    drop(data_stream);
                    match waitpid(child, None) {
                        Ok(WaitStatus::Exited(_, code)) => {
                            tracing::debug!(?child, code, "child exited");
                            if code == crate::CHILD_EXIT_TERMINATE {
                                set_stop_soon();
                            }
                        }
                        Ok(other) => {
                            tracing::warn!(?other, "child did not exit normally");
                            set_stop_soon();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "waitpid failed");
                            set_stop_soon();
                        }
                    }
                }
                ForkResult::Child => {
                    let _ = reset_signal_handlers_to_default();
                    let code = ops.execute(data_stream);
                    std::process::exit(code);
                }
            }

            if let Err(e) = ops.post_execute(&mut status_stream) {
                tracing::warn!(error = %e, "post_execute failed");
            }
        }

        if let Err(e) = ops.deinit() {
            tracing::warn!(error = %e, "deinit failed");
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    struct EchoTerminateBackend;

    impl BackendOps for EchoTerminateBackend {
        fn execute(&mut self, mut data: TcpStream) -> i32 {
            let mut header = [0u8; 5];
            if data.read_exact(&mut header).is_err() {
                return 1;
            }
            let cmd = header[0];
            let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            let _ = data.read_exact(&mut body);
            if cmd == crate::Command::Terminate as u8 {
                crate::CHILD_EXIT_TERMINATE
            } else {
                0
            }
        }
    }

    #[test]
    fn terminate_command_stops_the_loop_and_exits_zero() {
        // Exercises the accept/fork/wait bookkeeping end to end against a stand-in backend;
        // no real vendor library or TEE driver is involved.
        let port = 18127;
        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _status = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let mut data = TcpStream::connect(("127.0.0.1", port + 1)).unwrap();
            let mut frame = vec![crate::Command::Terminate as u8];
            frame.extend_from_slice(&0u32.to_le_bytes());
            data.write_all(&frame).unwrap();
        });

        let code = Forkserver::run(EchoTerminateBackend, port).unwrap();
        assert_eq!(code, 0);
        client.join().unwrap();
    }
}
