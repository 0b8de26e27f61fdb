// SPDX-License-Identifier: GPL-3.0-or-later
//! The Beanpod backend: the same TEEC client ABI as OP-TEE (`libTEECommon.so`), but the START
//! body's 16 UUID bytes are the legacy big-endian-grouped convention, and there is no coverage
//! shared-memory path.

use executor_core::error::{ExecutorError, Result};
use executor_core::forkserver::BackendOps;
use executor_core::framing;
use executor_core::gp::{self, Parameter, ParamType};
use executor_core::loader::VendorLibrary;
use executor_core::teec::{
    self, TeecContext, TeecOperation, TeecParameter, TeecSession, TeecTempMemoryReference,
    TeecValue, TeecOps, TEEC_LOGIN_PUBLIC, TEEC_SUCCESS,
};
use executor_core::Command;
use std::net::TcpStream;

const DEFAULT_LIBRARY_PATH: &str = "/vendor/lib/libTEECommon.so";

pub struct BeanpodBackend {
    library_path: String,
    vendor: Option<VendorLibrary<TeecOps>>,
    context: Box<TeecContext>,
}

impl Default for BeanpodBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LIBRARY_PATH)
    }
}

impl BeanpodBackend {
    pub fn new(library_path: impl Into<String>) -> Self {
        Self {
            library_path: library_path.into(),
            vendor: None,
            context: Box::new(TeecContext::default()),
        }
    }

    fn ops(&self) -> &TeecOps {
        &self.vendor.as_ref().expect("init must run before execute").ops
    }
}

impl BackendOps for BeanpodBackend {
    fn init(&mut self) -> Result<()> {
        let vendor = teec::load(&self.library_path)?;
        let rc = unsafe {
            (vendor.ops.initialize_context)(std::ptr::null(), self.context.as_mut())
        };
        if rc != TEEC_SUCCESS {
            return Err(ExecutorError::VendorLibrary(format!(
                "TEEC_InitializeContext failed: {rc:#x}"
            )));
        }
        self.vendor = Some(vendor);
        Ok(())
    }

    fn execute(&mut self, mut data: TcpStream) -> i32 {
        let ops = self.ops();
        let mut session = TeecSession::default();
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
                Command::Start => {
                    match start_session(ops, self.context.as_mut(), &mut session, &body) {
                        Ok(()) => session_open = true,
                        Err(e) => break Err(e),
                    }
                }
                Command::Send => {
                    if let Err(e) = handle_send(ops, &mut session, &body, &mut data) {
                        break Err(e);
                    }
                }
                Command::End => break Ok(0),
                Command::Terminate => break Ok(executor_core::CHILD_EXIT_TERMINATE),
            }
        };

        if session_open {
            unsafe { (ops.close_session)(&mut session) };
        }

        match result {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "session terminated abnormally");
                1
            }
        }
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(vendor) = &self.vendor {
            unsafe { (vendor.ops.finalize_context)(self.context.as_mut()) };
        }
        Ok(())
    }
}

/// START receives a single named `uuid` item of 16 raw bytes, reassembled via the legacy
/// big-endian-grouped convention rather than the modern raw-native-layout one.
fn start_session(
    ops: &TeecOps,
    context: &mut TeecContext,
    session: &mut TeecSession,
    body: &[u8],
) -> Result<()> {
    let mut ds = executor_core::bytestream::ByteStream::from_vec(body.to_vec());
    let (name, item) = framing::recv_item_by_name(&mut ds, 16)?;
    if name != "uuid" || item.len() != 16 {
        return Err(ExecutorError::Marshal(format!(
            "START expected a 16-byte 'uuid' item, got '{name}' of {} bytes",
            item.len()
        )));
    }
    let raw: [u8; 16] = item.try_into().unwrap();
    let uuid = gp::group_uuid_be(&raw);

    let mut ret_origin = 0u32;
    let rc = unsafe {
        (ops.open_session)(
            context,
            session,
            &uuid,
            TEEC_LOGIN_PUBLIC,
            std::ptr::null(),
            std::ptr::null_mut(),
            &mut ret_origin,
        )
    };
    if rc != TEEC_SUCCESS {
        return Err(ExecutorError::VendorLibrary(format!(
            "TEEC_OpenSession failed: {rc:#x} (origin {ret_origin:#x})"
        )));
    }
    Ok(())
}

fn handle_send(
    ops: &TeecOps,
    session: &mut TeecSession,
    body: &[u8],
    data: &mut TcpStream,
) -> Result<()> {
    let mut ds = executor_core::bytestream::ByteStream::from_vec(body.to_vec());
    let mut operation = match gp::deserialize_input(&mut ds) {
        Ok(op) => op,
        Err(e) => {
            gp::serialize_marshal_error(data)?;
            return Err(e);
        }
    };

    let mut teec_operation = TeecOperation::default();
    teec_operation.started = 1;
    teec_operation.param_types = teec::pack_types(operation.param_types.map(to_teec_type));
    let mut buffers: [Vec<u8>; 4] = Default::default();
    for (i, param) in operation.params.iter_mut().enumerate() {
        teec_operation.params[i] = to_teec_parameter(param, &mut buffers[i]);
    }

    let mut ret_origin = 0u32;
    let rc = unsafe {
        (ops.invoke_command)(
            session,
            operation.invoke_arg.cmd_id,
            &mut teec_operation,
            &mut ret_origin,
        )
    };
    operation.invoke_arg.ret_code = rc;
    operation.invoke_arg.ret_origin = ret_origin;

    if rc == TEEC_SUCCESS {
        for (param, buffer) in operation.params.iter_mut().zip(buffers.into_iter()) {
            if let Parameter::MemrefTemp { buffer: slot, .. } = param {
                *slot = buffer;
            }
        }
    }

    let response = gp::serialize_response(&operation);
    framing::send_all(data, &response)
}

fn to_teec_type(ptype: ParamType) -> u32 {
    match ptype {
        ParamType::None => teec::TEEC_NONE,
        ParamType::ValueInput => teec::TEEC_VALUE_INPUT,
        ParamType::ValueOutput => teec::TEEC_VALUE_OUTPUT,
        ParamType::ValueInout => teec::TEEC_VALUE_INOUT,
        ParamType::MemrefTempInput => teec::TEEC_MEMREF_TEMP_INPUT,
        ParamType::MemrefTempOutput => teec::TEEC_MEMREF_TEMP_OUTPUT,
        ParamType::MemrefTempInout => teec::TEEC_MEMREF_TEMP_INOUT,
    }
}

fn to_teec_parameter(param: &mut Parameter, buffer_slot: &mut Vec<u8>) -> TeecParameter {
    match param {
        Parameter::None => TeecParameter { value: TeecValue { a: 0, b: 0 } },
        Parameter::Value { a, b } => TeecParameter { value: TeecValue { a: *a, b: *b } },
        Parameter::MemrefTemp { buffer, size } => {
            *buffer_slot = std::mem::take(buffer);
            let tmpref = TeecTempMemoryReference {
                buffer: buffer_slot.as_mut_ptr() as *mut std::ffi::c_void,
                size: *size as usize,
            };
            TeecParameter { tmpref }
        }
    }
}
