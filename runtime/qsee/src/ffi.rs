// SPDX-License-Identifier: GPL-3.0-or-later
//! The QSEECom client ABI (`libQSEEComAPI.so`): a fixed table of `extern "C"` entry points,
//! bound once at backend init and never looked up again.

use executor_core::error::{ExecutorError, Result};
use executor_core::loader::{bind_symbol, VendorLibrary};
use libloading::Library;
use nix::ioctl_readwrite;
use std::ffi::c_void;
use std::os::raw::c_char;
use std::os::unix::io::{AsRawFd, OwnedFd};

/// Opaque per-app session handle; QSEECom leaves its layout implementation-defined, so this
/// stands in as a fixed-size byte buffer the vendor library indexes by pointer only.
#[repr(C, align(16))]
pub struct QseecomHandle {
    _opaque: [u8; 64],
}

/// `struct QSEECom_ion_fd_data`: one ION-backed buffer's fd and the byte offset into the
/// command buffer where the TA expects to find it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct QseeIonFdData {
    pub fd: i32,
    pub cmd_buf_offset: u32,
}

/// `struct QSEECom_ion_fd_info`: the fourth argument to `QSEECom_send_modified_cmd`, up to four
/// ION buffer references per call. This crate only ever populates slot 0.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IonInfo {
    pub data: [QseeIonFdData; 4],
}

const ION_IOC_MAGIC: u8 = b'I';
/// `ion_user_handle_t`, a 32-bit opaque handle the driver hands back from `ION_IOC_ALLOC` and
/// expects on `ION_IOC_MAP`.
type IonUserHandle = i32;

#[repr(C)]
#[derive(Debug, Default)]
struct IonAllocationData {
    len: usize,
    align: usize,
    heap_id_mask: u32,
    flags: u32,
    handle: IonUserHandle,
}

#[repr(C)]
#[derive(Debug, Default)]
struct IonFdData {
    handle: IonUserHandle,
    fd: i32,
}

ioctl_readwrite!(ion_ioc_alloc, ION_IOC_MAGIC, 0, IonAllocationData);
ioctl_readwrite!(ion_ioc_map, ION_IOC_MAGIC, 2, IonFdData);

const ION_HEAP_ID_MASK: u32 = 0x0800_0000;
const ION_BUFFER_LEN: usize = 4096;
const ION_BUFFER_ALIGN: usize = 0x1000;

/// A single `/dev/ion` allocation, mapped into this process and shareable with the TA by fd.
/// Mirrors `finger_alloc_shared()`: one `ION_IOC_ALLOC` to get a handle, one `ION_IOC_MAP` to
/// turn the handle into a dma-buf fd, then `mmap` that fd.
pub struct IonAllocation {
    _ion_device: OwnedFd,
    addr: *mut c_void,
    len: usize,
    fd: i32,
}

impl IonAllocation {
    pub fn new() -> Result<Self> {
        let ion_device: OwnedFd = std::fs::File::open("/dev/ion")
            .map_err(|e| ExecutorError::VendorLibrary(format!("open /dev/ion failed: {e}")))?
            .into();

        let mut alloc = IonAllocationData {
            len: ION_BUFFER_LEN,
            align: ION_BUFFER_ALIGN,
            heap_id_mask: ION_HEAP_ID_MASK,
            flags: 0,
            handle: 0,
        };
        unsafe { ion_ioc_alloc(ion_device.as_raw_fd(), &mut alloc) }
            .map_err(|e| ExecutorError::VendorLibrary(format!("ION_IOC_ALLOC failed: {e}")))?;

        let mut fd_data = IonFdData { handle: alloc.handle, fd: -1 };
        unsafe { ion_ioc_map(ion_device.as_raw_fd(), &mut fd_data) }
            .map_err(|e| ExecutorError::VendorLibrary(format!("ION_IOC_MAP failed: {e}")))?;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ION_BUFFER_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd_data.fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ExecutorError::VendorLibrary(format!(
                "mmap of ion fd {} failed: {}",
                fd_data.fd,
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self { _ion_device: ion_device, addr, len: ION_BUFFER_LEN, fd: fd_data.fd })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// The `cmd_buf_offset` this crate always registers the allocation at (offset 4 into the
    /// command buffer, matching every call site in the original that populates `ifd_data`).
    pub fn cmd_buf_offset(&self) -> u32 {
        4
    }
}

impl Drop for IonAllocation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

// Safety: `addr` points at ION-backed memory the kernel keeps alive for as long as the fd is
// open; nothing aliases it outside this struct's own accessors.
unsafe impl Send for IonAllocation {}

pub type StartAppFn = unsafe extern "C" fn(
    handle: *mut *mut QseecomHandle,
    path: *const c_char,
    fname: *const c_char,
    sb_size: u32,
) -> i32;
pub type ShutdownAppFn = unsafe extern "C" fn(handle: *mut *mut QseecomHandle) -> i32;
pub type RegisterListenerFn =
    unsafe extern "C" fn(handle: *mut QseecomHandle, listener_id: u32) -> i32;
pub type UnregisterListenerFn =
    unsafe extern "C" fn(handle: *mut QseecomHandle, listener_id: u32) -> i32;
pub type SendCmdFn = unsafe extern "C" fn(
    handle: *mut QseecomHandle,
    send_buf: *mut c_void,
    sbuf_len: u32,
    recv_buf: *mut c_void,
    rbuf_len: u32,
) -> i32;
pub type SendModifiedCmdFn = unsafe extern "C" fn(
    handle: *mut QseecomHandle,
    send_buf: *mut c_void,
    sbuf_len: u32,
    recv_buf: *mut c_void,
    rbuf_len: u32,
    ion_info: *mut IonInfo,
) -> i32;
pub type ReceiveReqFn = unsafe extern "C" fn(handle: *mut QseecomHandle) -> i32;
pub type SendRespFn = unsafe extern "C" fn(handle: *mut QseecomHandle) -> i32;
pub type SetBandwidthFn = unsafe extern "C" fn(handle: *mut QseecomHandle, high: bool) -> i32;
pub type AppLoadQueryFn =
    unsafe extern "C" fn(handle: *mut *mut QseecomHandle, fname: *const c_char) -> i32;

pub struct QseeOps {
    pub start_app: StartAppFn,
    pub shutdown_app: ShutdownAppFn,
    pub register_listener: RegisterListenerFn,
    pub unregister_listener: UnregisterListenerFn,
    pub send_cmd: SendCmdFn,
    pub send_modified_cmd: SendModifiedCmdFn,
    pub receive_req: ReceiveReqFn,
    pub send_resp: SendRespFn,
    pub set_bandwidth: SetBandwidthFn,
    pub app_load_query: AppLoadQueryFn,
}

fn bind(library: &Library) -> Result<QseeOps> {
    unsafe {
        Ok(QseeOps {
            start_app: bind_symbol(library, "QSEECom_start_app")?,
            shutdown_app: bind_symbol(library, "QSEECom_shutdown_app")?,
            register_listener: bind_symbol(library, "QSEECom_register_listener")?,
            unregister_listener: bind_symbol(library, "QSEECom_unregister_listener")?,
            send_cmd: bind_symbol(library, "QSEECom_send_cmd")?,
            send_modified_cmd: bind_symbol(library, "QSEECom_send_modified_cmd")?,
            receive_req: bind_symbol(library, "QSEECom_receive_req")?,
            send_resp: bind_symbol(library, "QSEECom_send_resp")?,
            set_bandwidth: bind_symbol(library, "QSEECom_set_bandwidth")?,
            app_load_query: bind_symbol(library, "QSEECom_app_load_query")?,
        })
    }
}

pub fn load(path: &str) -> Result<VendorLibrary<QseeOps>> {
    VendorLibrary::load(path, bind)
}
