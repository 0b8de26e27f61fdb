// SPDX-License-Identifier: GPL-3.0-or-later
//! The OP-TEE coverage path: a shared-memory region registered with both the TEE context and
//! the `shm_pta` pseudo-TA, scanned after each run either to dump a per-run PC list or to
//! report a single new-coverage bit to the status socket.

use executor_core::error::{ExecutorError, Result};
use executor_core::teec::{
    TeecOps, TeecOperation, TeecParameter, TeecRegisteredMemoryReference, TeecSession,
    TeecSharedMemory, TeecUuid, TEEC_MEMREF_PARTIAL_INOUT, TEEC_MEM_INPUT, TEEC_MEM_OUTPUT,
    TEEC_SUCCESS,
};
use std::ffi::c_void;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;

/// `3e1c44bf-f8c6-4c3c-1337-5da21400d0cb`.
pub const SHM_PTA_UUID: TeecUuid = TeecUuid {
    time_low: 0x3e1c44bf,
    time_mid: 0xf8c6,
    time_hi_and_version: 0x4c3c,
    clock_seq_and_node: [0x13, 0x37, 0x5d, 0xa2, 0x14, 0x00, 0xd0, 0xcb],
};

const SHM_PTA_CMD_REGISTER: u32 = 0;
const SHM_PTA_CMD_UNREGISTER: u32 = 3;

/// `{ nentries: u64, faddr: u64, pcs: [u64] }`, little-endian, at the head of the region.
const HEADER_SIZE: usize = 16;

struct CoverageRegion {
    ptr: *mut u8,
    len: usize,
}

impl CoverageRegion {
    fn map(len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ExecutorError::Coverage(format!(
                "mmap({len}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn as_ptr(&self) -> *mut c_void {
        self.ptr as *mut c_void
    }
}

impl Drop for CoverageRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.as_ptr(), self.len);
        }
    }
}

// Safety: the region is single-writer (child) / single-reader (parent, after waitpid
// establishes a happens-before), matching the concurrency model in the design notes.
unsafe impl Send for CoverageRegion {}

enum Mode {
    PcDump { dir: PathBuf },
    Feedback { bitmap: Vec<u8> },
    /// `SHMSZ` is set but neither `COVFEEDBACK` nor `COVCOLLECTDIR` is — the region is still
    /// registered with `shm_pta` but nothing is read back after a run.
    None,
}

pub struct Coverage {
    region: CoverageRegion,
    shared_memory: TeecSharedMemory,
    shm_session: TeecSession,
    mode: Mode,
}

impl Coverage {
    /// Reads `SHMSZ`/`COVFEEDBACK`/`COVCOLLECTDIR` from the environment; returns `Ok(None)`
    /// if `SHMSZ` is absent (coverage disabled).
    pub fn from_env(
        ops: &TeecOps,
        context: *mut executor_core::teec::TeecContext,
    ) -> Result<Option<Self>> {
        let Ok(shmsz) = std::env::var("SHMSZ") else {
            return Ok(None);
        };
        let len: usize = shmsz
            .parse()
            .map_err(|e| ExecutorError::Config(format!("SHMSZ must be a positive decimal: {e}")))?;

        let mut region = CoverageRegion::map(len)?;
        region.as_mut_slice().fill(0);

        let mut shared_memory =
            TeecSharedMemory::new(region.as_ptr(), len, TEEC_MEM_INPUT | TEEC_MEM_OUTPUT);
        let rc = unsafe { (ops.register_shared_memory)(context, &mut shared_memory) };
        if rc != TEEC_SUCCESS {
            return Err(ExecutorError::Coverage(format!(
                "TEEC_RegisterSharedMemory failed: {rc:#x}"
            )));
        }

        let mut shm_session = TeecSession::default();
        let mut ret_origin = 0u32;
        let rc = unsafe {
            (ops.open_session)(
                context,
                &mut shm_session,
                &SHM_PTA_UUID,
                executor_core::teec::TEEC_LOGIN_PUBLIC,
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut ret_origin,
            )
        };
        if rc != TEEC_SUCCESS {
            return Err(ExecutorError::Coverage(format!(
                "failed to open shm_pta session: {rc:#x}"
            )));
        }

        invoke_shm_pta(ops, &mut shm_session, SHM_PTA_CMD_UNREGISTER, None)?;
        invoke_shm_pta(ops, &mut shm_session, SHM_PTA_CMD_REGISTER, Some(&mut shared_memory))?;

        let mode = if std::env::var("COVFEEDBACK").is_ok() {
            Mode::Feedback { bitmap: vec![0u8; len] }
        } else if let Ok(dir) = std::env::var("COVCOLLECTDIR") {
            Mode::PcDump { dir: PathBuf::from(dir) }
        } else {
            Mode::None
        };

        Ok(Some(Self {
            region,
            shared_memory,
            shm_session,
            mode,
        }))
    }

    pub fn pre_execute(&mut self) {
        if let Mode::PcDump { .. } = &self.mode {
            self.region.as_mut_slice()[HEADER_SIZE..].fill(0);
        }
    }

    pub fn post_execute(&mut self, status: &mut TcpStream) -> Result<()> {
        let snapshot = self.region.as_slice().to_vec();
        match &mut self.mode {
            Mode::PcDump { dir } => {
                let nentries = u64::from_le_bytes(snapshot[0..8].try_into().unwrap());
                if nentries > 0 {
                    write_pc_dump(dir, &snapshot, nentries)?;
                }
            }
            Mode::Feedback { bitmap } => {
                let mut any_new = false;
                for (seen, observed) in bitmap.iter_mut().zip(snapshot.iter()) {
                    if *observed != 0 && *seen == 0 {
                        *seen = *observed;
                        any_new = true;
                    }
                }
                let flag: u32 = if any_new { 1 } else { 0 };
                status.write_all(&flag.to_le_bytes())?;
            }
            Mode::None => {}
        }
        Ok(())
    }

    pub fn teardown(&mut self, ops: &TeecOps) {
        if let Err(e) = invoke_shm_pta(ops, &mut self.shm_session, SHM_PTA_CMD_UNREGISTER, None) {
            tracing::warn!(error = %e, "shm_pta unregister during teardown failed");
        }
        unsafe {
            (ops.close_session)(&mut self.shm_session);
            (ops.release_shared_memory)(&mut self.shared_memory);
        }
    }
}

fn invoke_shm_pta(
    ops: &TeecOps,
    session: &mut TeecSession,
    cmd_id: u32,
    shared_memory: Option<&mut TeecSharedMemory>,
) -> Result<()> {
    let mut operation = TeecOperation::default();
    if let Some(shared_memory) = shared_memory {
        operation.param_types = TEEC_MEMREF_PARTIAL_INOUT;
        let size = shared_memory.size;
        operation.params[0] = TeecParameter {
            memref: TeecRegisteredMemoryReference {
                parent: shared_memory as *mut TeecSharedMemory,
                size,
                offset: 0,
            },
        };
    }
    let mut ret_origin = 0u32;
    let rc = unsafe { (ops.invoke_command)(session, cmd_id, &mut operation, &mut ret_origin) };
    if rc != TEEC_SUCCESS {
        return Err(ExecutorError::Coverage(format!(
            "shm_pta command {cmd_id} failed: {rc:#x}"
        )));
    }
    Ok(())
}

fn write_pc_dump(dir: &std::path::Path, region: &[u8], nentries: u64) -> Result<()> {
    let pid = std::process::id();
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    let filename = format!("time:{now_ms:08},pid:{pid}.cov");
    let path = dir.join(filename);
    let body_len = HEADER_SIZE + nentries as usize * 8;
    let body = &region[..body_len.min(region.len())];
    match std::fs::File::create(&path).and_then(|mut f| f.write_all(body)) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to write coverage dump");
            Ok(())
        }
    }
}
