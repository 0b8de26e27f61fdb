// SPDX-License-Identifier: GPL-3.0-or-later
//! The QSEE backend: drives `libQSEEComAPI.so` through `QSEECom_send_cmd` /
//! `QSEECom_send_modified_cmd`, with bandwidth toggling bracketing each SEND.

mod ffi;

use executor_core::bytestream::ByteStream;
use executor_core::error::{ExecutorError, Result};
use executor_core::forkserver::BackendOps;
use executor_core::framing;
use executor_core::gp::{self, Parameter};
use executor_core::loader::VendorLibrary;
use executor_core::Command;
use ffi::{IonAllocation, IonInfo, QseeOps, QseecomHandle};
use std::ffi::{c_void, CString};
use std::net::TcpStream;

const DEFAULT_LIBRARY_PATH: &str = "/vendor/lib/libQSEEComAPI.so";
const MAX_PATH_ITEM: usize = 256;
const MAX_FNAME_ITEM: usize = 64;

/// Selects `QSEECom_send_modified_cmd` over `QSEECom_send_cmd`: set when the host marks the
/// top bit of `ret_origin` in the SEND body, the one field the wire format leaves unused on
/// input. Undocumented by the source distribution; recorded as a resolved open question.
const MODIFIED_CMD_FLAG: u32 = 0x8000_0000;

pub struct QseeBackend {
    library_path: String,
    vendor: Option<VendorLibrary<QseeOps>>,
    handle: *mut QseecomHandle,
    ion: Option<IonAllocation>,
}

impl Default for QseeBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LIBRARY_PATH)
    }
}

// Safety: the raw handle is only ever touched from the single forked child that owns this
// backend instance; it never crosses a thread boundary.
unsafe impl Send for QseeBackend {}

impl QseeBackend {
    pub fn new(library_path: impl Into<String>) -> Self {
        Self {
            library_path: library_path.into(),
            vendor: None,
            handle: std::ptr::null_mut(),
            ion: None,
        }
    }

    fn ops(&self) -> &QseeOps {
        &self.vendor.as_ref().expect("init must run before execute").ops
    }
}

impl BackendOps for QseeBackend {
    fn init(&mut self) -> Result<()> {
        self.vendor = Some(ffi::load(&self.library_path)?);
        Ok(())
    }

    fn execute(&mut self, mut data: TcpStream) -> i32 {
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
                Command::Start => match self.start_app(&body) {
                    Ok(()) => {}
                    Err(e) => break Err(e),
                },
                Command::Send => {
                    if let Err(e) = self.handle_send(&body, &mut data) {
                        break Err(e);
                    }
                }
                Command::End => break Ok(0),
                Command::Terminate => break Ok(executor_core::CHILD_EXIT_TERMINATE),
            }
        };

        match result {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "session terminated abnormally");
                1
            }
        }
    }

    fn deinit(&mut self) -> Result<()> {
        if !self.handle.is_null() {
            if let Some(vendor) = &self.vendor {
                unsafe { (vendor.ops.shutdown_app)(&mut self.handle) };
            }
        }
        Ok(())
    }
}

impl QseeBackend {
    /// START receives `path`, `fname`, `sb_size` named items and starts the TA image.
    fn start_app(&mut self, body: &[u8]) -> Result<()> {
        let mut ds = ByteStream::from_vec(body.to_vec());
        let (name, path_item) = framing::recv_item_by_name(&mut ds, MAX_PATH_ITEM)?;
        expect_name("path", &name)?;
        let (name, fname_item) = framing::recv_item_by_name(&mut ds, MAX_FNAME_ITEM)?;
        expect_name("fname", &name)?;
        let (name, sb_size_item) = framing::recv_item_by_name(&mut ds, 4)?;
        expect_name("sb_size", &name)?;
        if sb_size_item.len() != 4 {
            return Err(ExecutorError::Marshal(format!(
                "sb_size item must be 4 bytes, got {}",
                sb_size_item.len()
            )));
        }
        let sb_size = u32::from_le_bytes(sb_size_item.try_into().unwrap());

        let path = CString::new(path_item)
            .map_err(|e| ExecutorError::Marshal(format!("path item contains a NUL byte: {e}")))?;
        let fname = CString::new(fname_item)
            .map_err(|e| ExecutorError::Marshal(format!("fname item contains a NUL byte: {e}")))?;

        let rc = unsafe {
            (self.ops().start_app)(&mut self.handle, path.as_ptr(), fname.as_ptr(), sb_size)
        };
        if rc != 0 {
            return Err(ExecutorError::VendorLibrary(format!(
                "QSEECom_start_app failed: {rc}"
            )));
        }
        Ok(())
    }

    fn handle_send(&mut self, body: &[u8], data: &mut TcpStream) -> Result<()> {
        let mut ds = ByteStream::from_vec(body.to_vec());
        let mut operation = match gp::deserialize_input(&mut ds) {
            Ok(op) => op,
            Err(e) => {
                gp::serialize_marshal_error(data)?;
                return Err(e);
            }
        };

        let use_modified = operation.invoke_arg.ret_origin & MODIFIED_CMD_FLAG != 0;
        let mut send_buf = match &operation.params[0] {
            Parameter::MemrefTemp { buffer, .. } => buffer.clone(),
            _ => Vec::new(),
        };
        let recv_len = match &operation.params[1] {
            Parameter::MemrefTemp { buffer, .. } => buffer.len(),
            _ => 0,
        };
        let mut recv_buf = vec![0u8; recv_len];

        if use_modified && self.ion.is_none() {
            self.ion = Some(IonAllocation::new()?);
        }

        let ops = self.ops();
        let handle = self.handle;
        unsafe { (ops.set_bandwidth)(handle, true) };
        let rc = if use_modified {
            let ion = self.ion.as_ref().expect("allocated above");
            let mut ion_info = IonInfo::default();
            ion_info.data[0].fd = ion.fd();
            ion_info.data[0].cmd_buf_offset = ion.cmd_buf_offset();
            unsafe {
                (ops.send_modified_cmd)(
                    handle,
                    send_buf.as_mut_ptr() as *mut c_void,
                    send_buf.len() as u32,
                    recv_buf.as_mut_ptr() as *mut c_void,
                    recv_buf.len() as u32,
                    &mut ion_info as *mut IonInfo,
                )
            }
        } else {
            unsafe {
                (ops.send_cmd)(
                    handle,
                    send_buf.as_mut_ptr() as *mut c_void,
                    send_buf.len() as u32,
                    recv_buf.as_mut_ptr() as *mut c_void,
                    recv_buf.len() as u32,
                )
            }
        };
        unsafe { (ops.set_bandwidth)(handle, false) };

        operation.invoke_arg.ret_code = if rc == 0 { gp::TEEC_SUCCESS } else { rc as u32 };
        operation.invoke_arg.ret_origin = 0;

        if rc == 0 {
            let trimmed = trim_response(&recv_buf);
            if let Parameter::MemrefTemp { buffer, size } = &mut operation.params[1] {
                *buffer = recv_buf;
                *size = trimmed;
            }
        }

        let response = gp::serialize_response(&operation);
        framing::send_all(data, &response)
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

/// Trims trailing zero padding from a QSEECom response buffer. Scans from offset 4 (the
/// command's own status word), tracking the index one past the last non-zero byte seen; a
/// non-zero status word at offset 0 short-circuits to a bare 4-byte response.
fn trim_response(buf: &[u8]) -> u32 {
    if buf.len() >= 4 && u32::from_le_bytes(buf[0..4].try_into().unwrap()) != 0 {
        return 4;
    }
    let mut offset = buf.len().min(4);
    for (i, byte) in buf.iter().enumerate().skip(4) {
        if *byte != 0 {
            offset = i + 1;
        }
    }
    offset as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_response_reports_offset_past_last_nonzero_byte() {
        let mut buf = vec![0u8; 32];
        buf[4] = 0xAA;
        buf[10] = 0xBB;
        assert_eq!(trim_response(&buf), 11);
    }

    #[test]
    fn trim_response_truncates_to_four_bytes_on_ta_error_status() {
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&7u32.to_le_bytes());
        buf[20] = 0xFF;
        assert_eq!(trim_response(&buf), 4);
    }

    #[test]
    fn trim_response_on_all_zero_body_reports_header_length() {
        let buf = vec![0u8; 16];
        assert_eq!(trim_response(&buf), 4);
    }
}
