// SPDX-License-Identifier: GPL-3.0-or-later
//! The TEEC-style client ABI shared by OP-TEE's `libteec.so` and Beanpod's
//! `libTEECommon.so` — both vendor libraries export the same GlobalPlatform client API
//! symbol names and structure layout, so one binding serves both backends.
//!
//! `TeecContext`/`TeecSession` are opaque to us: the GlobalPlatform spec leaves their layout
//! implementation-defined, and the vendor library is the only code that ever dereferences
//! them. A fixed-size byte buffer large enough for any known implementation's internal state
//! is sufficient since we only ever pass a pointer to it across the FFI boundary.

use crate::error::Result;
use crate::loader::{bind_symbol, VendorLibrary};
use libloading::Library;
use std::ffi::{c_char, c_void};

const OPAQUE_HANDLE_SIZE: usize = 64;

#[repr(C, align(16))]
pub struct TeecContext([u8; OPAQUE_HANDLE_SIZE]);

impl Default for TeecContext {
    fn default() -> Self {
        Self([0; OPAQUE_HANDLE_SIZE])
    }
}

#[repr(C, align(16))]
pub struct TeecSession([u8; OPAQUE_HANDLE_SIZE]);

impl Default for TeecSession {
    fn default() -> Self {
        Self([0; OPAQUE_HANDLE_SIZE])
    }
}

pub use crate::gp::GroupedUuid as TeecUuid;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TeecValue {
    pub a: u32,
    pub b: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TeecTempMemoryReference {
    pub buffer: *mut c_void,
    pub size: usize,
}

#[repr(C)]
pub struct TeecSharedMemory {
    pub buffer: *mut c_void,
    pub size: usize,
    pub flags: u32,
    _impl: [u8; 32],
}

impl TeecSharedMemory {
    pub fn new(buffer: *mut c_void, size: usize, flags: u32) -> Self {
        Self { buffer, size, flags, _impl: [0; 32] }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TeecRegisteredMemoryReference {
    pub parent: *mut TeecSharedMemory,
    pub size: usize,
    pub offset: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union TeecParameter {
    pub value: TeecValue,
    pub tmpref: TeecTempMemoryReference,
    pub memref: TeecRegisteredMemoryReference,
}

#[repr(C)]
pub struct TeecOperation {
    pub started: u32,
    pub param_types: u32,
    pub params: [TeecParameter; 4],
}

impl Default for TeecOperation {
    fn default() -> Self {
        let zero = TeecParameter { value: TeecValue { a: 0, b: 0 } };
        Self {
            started: 0,
            param_types: 0,
            params: [zero, zero, zero, zero],
        }
    }
}

pub const TEEC_NONE: u32 = 0x0;
pub const TEEC_VALUE_INPUT: u32 = 0x1;
pub const TEEC_VALUE_OUTPUT: u32 = 0x2;
pub const TEEC_VALUE_INOUT: u32 = 0x3;
pub const TEEC_MEMREF_TEMP_INPUT: u32 = 0x5;
pub const TEEC_MEMREF_TEMP_OUTPUT: u32 = 0x6;
pub const TEEC_MEMREF_TEMP_INOUT: u32 = 0x7;
pub const TEEC_MEMREF_PARTIAL_INOUT: u32 = 0xF;
pub const TEEC_MEM_INPUT: u32 = 0x1;
pub const TEEC_MEM_OUTPUT: u32 = 0x2;
pub const TEEC_LOGIN_PUBLIC: u32 = 0x0;
pub const TEEC_SUCCESS: u32 = 0x0000_0000;

type InitializeContextFn = unsafe extern "C" fn(*const c_char, *mut TeecContext) -> u32;
type FinalizeContextFn = unsafe extern "C" fn(*mut TeecContext);
type OpenSessionFn = unsafe extern "C" fn(
    *mut TeecContext,
    *mut TeecSession,
    *const TeecUuid,
    u32,
    *const c_void,
    *mut TeecOperation,
    *mut u32,
) -> u32;
type CloseSessionFn = unsafe extern "C" fn(*mut TeecSession);
type InvokeCommandFn =
    unsafe extern "C" fn(*mut TeecSession, u32, *mut TeecOperation, *mut u32) -> u32;
type RegisterSharedMemoryFn = unsafe extern "C" fn(*mut TeecContext, *mut TeecSharedMemory) -> u32;
type AllocateSharedMemoryFn = unsafe extern "C" fn(*mut TeecContext, *mut TeecSharedMemory) -> u32;
type ReleaseSharedMemoryFn = unsafe extern "C" fn(*mut TeecSharedMemory);
type RequestCancellationFn = unsafe extern "C" fn(*mut TeecOperation);

/// The dispatch table bound from either `libteec.so` or `libTEECommon.so`.
pub struct TeecOps {
    pub initialize_context: InitializeContextFn,
    pub finalize_context: FinalizeContextFn,
    pub open_session: OpenSessionFn,
    pub close_session: CloseSessionFn,
    pub invoke_command: InvokeCommandFn,
    pub register_shared_memory: RegisterSharedMemoryFn,
    pub allocate_shared_memory: AllocateSharedMemoryFn,
    pub release_shared_memory: ReleaseSharedMemoryFn,
    pub request_cancellation: RequestCancellationFn,
}

fn bind(library: &Library) -> Result<TeecOps> {
    unsafe {
        Ok(TeecOps {
            initialize_context: bind_symbol(library, "TEEC_InitializeContext")?,
            finalize_context: bind_symbol(library, "TEEC_FinalizeContext")?,
            open_session: bind_symbol(library, "TEEC_OpenSession")?,
            close_session: bind_symbol(library, "TEEC_CloseSession")?,
            invoke_command: bind_symbol(library, "TEEC_InvokeCommand")?,
            register_shared_memory: bind_symbol(library, "TEEC_RegisterSharedMemory")?,
            allocate_shared_memory: bind_symbol(library, "TEEC_AllocateSharedMemory")?,
            release_shared_memory: bind_symbol(library, "TEEC_ReleaseSharedMemory")?,
            request_cancellation: bind_symbol(library, "TEEC_RequestCancellation")?,
        })
    }
}

pub fn load(path: &str) -> Result<VendorLibrary<TeecOps>> {
    VendorLibrary::load(path, bind)
}

/// Pack four GP parameter types into the `u32` the TEEC ABI expects, mirroring
/// [`crate::gp::pack_param_types`] but over the TEEC constants above rather than the wire
/// parameter-type enum (the two numeric spaces agree except for the partial-memref forms,
/// which only ever appear inside the shm_pta registration call, never on the wire).
pub fn pack_types(types: [u32; 4]) -> u32 {
    types.iter().enumerate().fold(0u32, |word, (i, t)| word | (t << (i * 4)))
}
