// SPDX-License-Identifier: GPL-3.0-or-later
//! The TC (Huawei TrustedCore) backend: opens `/dev/tc_ns_client` directly and drives its
//! login/session/send ioctls, loading the TA's `.sec` image from a fixed search path first if
//! necessary.

mod ffi;

use executor_core::bytestream::ByteStream;
use executor_core::error::{ExecutorError, Result};
use executor_core::forkserver::BackendOps;
use executor_core::framing;
use executor_core::gp::{self, pack_param_types, Parameter};
use executor_core::Command;
use ffi::{TcNsClientContext, TcNsClientLoad, TcNsClientLogin, TcNsClientParam};
use std::fs::OpenOptions;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;

const DEVICE_PATH: &str = "/dev/tc_ns_client";
const MAX_LOGIN_BLOB: usize = 2048;
const MAX_PROCESS_NAME: usize = 64;
const SEC_SEARCH_DIRS: [&str; 2] = ["/system/bin", "/vendor/bin"];

pub struct TcBackend {
    device: Option<OwnedFd>,
}

impl Default for TcBackend {
    fn default() -> Self {
        Self { device: None }
    }
}

impl BackendOps for TcBackend {
    fn init(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEVICE_PATH)
            .map_err(|e| {
                ExecutorError::VendorLibrary(format!("failed to open {DEVICE_PATH}: {e}"))
            })?;
        self.device = Some(file.into());
        Ok(())
    }

    fn execute(&mut self, mut data: TcpStream) -> i32 {
        let fd = self.device.as_ref().expect("init must run before execute").as_raw_fd();
        let mut session = TcNsClientContext::default();
        let mut session_open = false;

        let result = loop {
            let (cmd_byte, body) = match framing::recv_tlv(&mut data) {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };
            let cmd = match Command::from_byte(cmd_byte) {
                Ok(cmd) => cmd,
                Err(e) => break Err(e),
            };

            match cmd {
                Command::Start => match start_session(fd, &mut session, &body) {
                    Ok(()) => session_open = true,
                    Err(e) => break Err(e),
                },
                Command::Send => {
                    if let Err(e) = handle_send(fd, &mut session, &body, &mut data) {
                        break Err(e);
                    }
                }
                Command::End => break Ok(0),
                Command::Terminate => break Ok(executor_core::CHILD_EXIT_TERMINATE),
            }
        };

        if session_open {
            let mut close_ctx = TcNsClientContext { session_id: session.session_id, ..Default::default() };
            if let Err(e) = unsafe { ffi::ioctl_session_close(fd, &mut close_ctx) } {
                tracing::warn!(error = %e, "TC_NS_CLIENT_IOCTL_SES_CLOSE_REQ failed");
            }
        }

        match result {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "session terminated abnormally");
                1
            }
        }
    }
}

/// START receives `uuid` (16 bytes), `login_blob` (<=2048 bytes), `process_name`, and `uid`
/// named items. Loads the `.sec` image if present under either search directory, logs in, then
/// opens the session.
fn start_session(fd: i32, session: &mut TcNsClientContext, body: &[u8]) -> Result<()> {
    let mut ds = ByteStream::from_vec(body.to_vec());
    let (name, uuid_item) = framing::recv_item_by_name(&mut ds, 16)?;
    expect_name("uuid", &name)?;
    if uuid_item.len() != 16 {
        return Err(ExecutorError::Marshal(format!(
            "uuid item must be 16 bytes, got {}",
            uuid_item.len()
        )));
    }
    let (name, login_blob) = framing::recv_item_by_name(&mut ds, MAX_LOGIN_BLOB)?;
    expect_name("login_blob", &name)?;
    let (name, process_name) = framing::recv_item_by_name(&mut ds, MAX_PROCESS_NAME)?;
    expect_name("process_name", &name)?;
    let (name, uid_item) = framing::recv_item_by_name(&mut ds, 4)?;
    expect_name("uid", &name)?;
    if uid_item.len() != 4 {
        return Err(ExecutorError::Marshal(format!(
            "uid item must be 4 bytes, got {}",
            uid_item.len()
        )));
    }
    let uid = u32::from_le_bytes(uid_item.try_into().unwrap());

    let uuid: [u8; 16] = uuid_item.try_into().unwrap();

    if login_blob.len() < 8 {
        return Err(ExecutorError::Marshal(format!(
            "login_blob must be at least 8 bytes to carry method/mdata, got {}",
            login_blob.len()
        )));
    }
    let mut login = TcNsClientLogin {
        method: u32::from_le_bytes(login_blob[0..4].try_into().unwrap()),
        mdata: u32::from_le_bytes(login_blob[4..8].try_into().unwrap()),
    };
    unsafe { ffi::ioctl_login(fd, &mut login) }.map_err(|e| {
        ExecutorError::VendorLibrary(format!("TC_NS_CLIENT_IOCTL_LOGIN failed: {e}"))
    })?;
    tracing::debug!(process_name = %String::from_utf8_lossy(&process_name), "TC login completed");

    load_sec_image(fd, &uuid)?;

    if unsafe { libc::setgid(uid) } != 0 {
        return Err(ExecutorError::VendorLibrary(format!(
            "setgid({uid}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(ExecutorError::VendorLibrary(format!(
            "setuid({uid}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    session.uuid = uuid;
    session.started = 1;
    unsafe { ffi::ioctl_session_open(fd, session) }.map_err(|e| {
        ExecutorError::VendorLibrary(format!("TC_NS_CLIENT_IOCTL_SES_OPEN_REQ failed: {e}"))
    })?;
    Ok(())
}

/// Searches `/system/bin/<uuid>.sec` then `/vendor/bin/<uuid>.sec`; loads the first one found.
/// Absence of any `.sec` image is not an error — the TA may already be resident.
fn load_sec_image(fd: i32, uuid: &[u8; 16]) -> Result<()> {
    let hex: String = uuid.iter().map(|b| format!("{b:02x}")).collect();
    let filename = format!("{hex}.sec");

    for dir in SEC_SEARCH_DIRS {
        let path = Path::new(dir).join(&filename);
        if !path.exists() {
            continue;
        }
        let mut name_buf = [0 as std::os::raw::c_char; 64];
        for (slot, byte) in name_buf.iter_mut().zip(filename.bytes()) {
            *slot = byte as std::os::raw::c_char;
        }
        let mut load = TcNsClientLoad {
            file_name: name_buf,
            file_addr: 0,
            file_size: std::fs::metadata(&path).map(|m| m.len() as u32).unwrap_or(0),
        };
        unsafe { ffi::ioctl_load_app(fd, &mut load) }.map_err(|e| {
            ExecutorError::VendorLibrary(format!(
                "TC_NS_CLIENT_IOCTL_LOAD_APP_REQ failed for {}: {e}",
                path.display()
            ))
        })?;
        return Ok(());
    }
    Ok(())
}

fn handle_send(
    fd: i32,
    session: &mut TcNsClientContext,
    body: &[u8],
    data: &mut TcpStream,
) -> Result<()> {
    let mut ds = ByteStream::from_vec(body.to_vec());
    let mut operation = match gp::deserialize_input(&mut ds) {
        Ok(op) => op,
        Err(e) => {
            gp::serialize_marshal_error(data)?;
            return Err(e);
        }
    };

    session.cmd_id = operation.invoke_arg.cmd_id;
    session.param_types = pack_param_types(&operation.param_types);

    // Buffers for MEMREF parameters must outlive the ioctl call.
    let mut buffers: [Vec<u8>; 4] = Default::default();
    for (i, param) in operation.params.iter_mut().enumerate() {
        session.params[i] = to_tc_param(param, &mut buffers[i]);
    }

    let rc = unsafe { ffi::ioctl_send_cmd(fd, session) };
    let (ret_code, ret_origin) = match rc {
        Ok(_) => (session.ret_val, 0),
        Err(e) => {
            tracing::warn!(error = %e, "TC_NS_CLIENT_IOCTL_SEND_CMD_REQ failed");
            (u32::MAX, 0)
        }
    };
    operation.invoke_arg.ret_code = ret_code;
    operation.invoke_arg.ret_origin = ret_origin;

    if ret_code == gp::TEEC_SUCCESS {
        for (param, buffer) in operation.params.iter_mut().zip(buffers.into_iter()) {
            if let Parameter::MemrefTemp { buffer: slot, .. } = param {
                *slot = buffer;
            }
        }
    }

    let response = gp::serialize_response(&operation);
    framing::send_all(data, &response)
}

/// VALUE parameters are laid out as two adjacent `u32` fields within one `TcNsClientParam`
/// slot (the struct's own field order gives the four-bytes-apart layout the driver expects,
/// rather than allocating `a`/`b` as two separate heap words).
fn to_tc_param(param: &mut Parameter, buffer_slot: &mut Vec<u8>) -> TcNsClientParam {
    match param {
        Parameter::None => TcNsClientParam::default(),
        Parameter::Value { a, b } => TcNsClientParam {
            value_a: *a,
            value_b: *b,
            ..Default::default()
        },
        Parameter::MemrefTemp { buffer, size } => {
            *buffer_slot = std::mem::take(buffer);
            TcNsClientParam {
                buffer_addr: buffer_slot.as_mut_ptr() as u64,
                buffer_size: *size,
                ..Default::default()
            }
        }
    }
}

fn expect_name(expected: &str, got: &str) -> Result<()> {
    if got != expected {
        return Err(ExecutorError::Marshal(format!(
            "expected named item '{expected}', got '{got}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_param_packs_a_and_b_contiguously() {
        let mut param = Parameter::Value { a: 0x1111, b: 0x2222 };
        let mut scratch = Vec::new();
        let tc_param = to_tc_param(&mut param, &mut scratch);
        assert_eq!(tc_param.value_a, 0x1111);
        assert_eq!(tc_param.value_b, 0x2222);
    }
}
