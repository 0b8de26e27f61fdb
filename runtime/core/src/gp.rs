// SPDX-License-Identifier: GPL-3.0-or-later
//! GlobalPlatform-style operation marshaling: the wire schema shared by the OP-TEE and
//! Beanpod backends (both speak the TEEC-style ABI). TC layers its own "double LV" value
//! encoding on top of the same parameter-type vocabulary; see the `tc` backend crate.

use crate::bytestream::ByteStream;
use crate::error::{ExecutorError, Result};
use std::io::Write;

/// A parameter's type tag, already normalized: the wire's partial-memref nibbles
/// (`0xD`/`0xE`/`0xF`) fold into their temp-memref counterparts before this type is ever
/// constructed, so no partial-memref variant exists here to forget to handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParamType {
    None = 0,
    ValueInput = 1,
    ValueOutput = 2,
    ValueInout = 3,
    MemrefTempInput = 5,
    MemrefTempOutput = 6,
    MemrefTempInout = 7,
}

impl ParamType {
    /// Normalize a wire nibble (subtracting 8 from partial-memref values `0xD`-`0xF`) and
    /// resolve it to a recognized type, or fail.
    pub fn from_nibble(nibble: u8) -> Result<Self> {
        let normalized = if (0xD..=0xF).contains(&nibble) {
            nibble - 8
        } else {
            nibble
        };
        match normalized {
            0 => Ok(Self::None),
            1 => Ok(Self::ValueInput),
            2 => Ok(Self::ValueOutput),
            3 => Ok(Self::ValueInout),
            5 => Ok(Self::MemrefTempInput),
            6 => Ok(Self::MemrefTempOutput),
            7 => Ok(Self::MemrefTempInout),
            other => Err(ExecutorError::Marshal(format!(
                "unrecognized parameter type nibble {other:#x}"
            ))),
        }
    }

    pub fn as_nibble(self) -> u8 {
        self as u8
    }
}

pub fn unpack_param_types(word: u32) -> Result<[ParamType; 4]> {
    let mut out = [ParamType::None; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        let nibble = ((word >> (i * 4)) & 0xF) as u8;
        *slot = ParamType::from_nibble(nibble)?;
    }
    Ok(out)
}

pub fn pack_param_types(types: &[ParamType; 4]) -> u32 {
    types
        .iter()
        .enumerate()
        .fold(0u32, |word, (i, t)| word | ((t.as_nibble() as u32) << (i * 4)))
}

/// A single deserialized parameter. `MemrefTemp` always carries the buffer it owns plus the
/// size the TEE should see, which may be smaller than `buffer.len()` (the clamp for
/// INPUT/INOUT, or the signaled size for OUTPUT).
#[derive(Debug, Clone)]
pub enum Parameter {
    None,
    Value { a: u32, b: u32 },
    MemrefTemp { buffer: Vec<u8>, size: u32 },
}

/// The fixed-size struct exchanged at the head of every request and response: the command
/// id the host asked for, and (on the way back) the TEE's own return code and origin.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeArg {
    pub cmd_id: u32,
    pub ret_code: u32,
    pub ret_origin: u32,
}

pub const INVOKE_ARG_STRUCT_SIZE: usize = 12;
/// TEEC_SUCCESS.
pub const TEEC_SUCCESS: u32 = 0;

impl InvokeArg {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != INVOKE_ARG_STRUCT_SIZE {
            return Err(ExecutorError::Marshal(format!(
                "invoke_arg_struct must be {INVOKE_ARG_STRUCT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            cmd_id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            ret_code: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ret_origin: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }

    pub fn to_bytes(self) -> [u8; INVOKE_ARG_STRUCT_SIZE] {
        let mut out = [0u8; INVOKE_ARG_STRUCT_SIZE];
        out[0..4].copy_from_slice(&self.cmd_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.ret_code.to_le_bytes());
        out[8..12].copy_from_slice(&self.ret_origin.to_le_bytes());
        out
    }
}

/// A fully deserialized GP operation, ready to hand to a vendor `InvokeCommand` call.
#[derive(Debug, Clone)]
pub struct Operation {
    pub invoke_arg: InvokeArg,
    pub param_types: [ParamType; 4],
    pub params: [Parameter; 4],
}

/// Deserialize the host's SEND body: `invoke_arg_struct` bytes, `param_types: u32`, then four
/// parameter bodies in wire order.
pub fn deserialize_input(ds: &mut ByteStream) -> Result<Operation> {
    let arg_bytes = ds.read_vec(INVOKE_ARG_STRUCT_SIZE)?;
    let invoke_arg = InvokeArg::from_bytes(&arg_bytes)?;
    let param_types = unpack_param_types(ds.read_u32()?)?;

    let mut params = [Parameter::None, Parameter::None, Parameter::None, Parameter::None];
    for (slot, ptype) in params.iter_mut().zip(param_types.iter()) {
        *slot = deserialize_parameter(ds, *ptype)?;
    }

    Ok(Operation {
        invoke_arg,
        param_types,
        params,
    })
}

fn deserialize_parameter(ds: &mut ByteStream, ptype: ParamType) -> Result<Parameter> {
    match ptype {
        ParamType::None => Ok(Parameter::None),
        ParamType::ValueInput | ParamType::ValueInout => {
            let a = ds.read_u32()?;
            let b = ds.read_u32()?;
            Ok(Parameter::Value { a, b })
        }
        ParamType::ValueOutput => {
            // Host still sends two placeholder u32s; their content is irrelevant, the
            // executor allocates fresh zeroed backing storage for the TEE to write into.
            ds.read_u32()?;
            ds.read_u32()?;
            Ok(Parameter::Value { a: 0, b: 0 })
        }
        ParamType::MemrefTempInput | ParamType::MemrefTempInout => {
            let len = ds.read_u32()? as usize;
            let buffer = ds.read_vec(len)?;
            let requested_size = ds.read_u32()?;
            // Clamp: never let the TEE read past the buffer the host actually sent.
            let size = requested_size.min(len as u32);
            Ok(Parameter::MemrefTemp { buffer, size })
        }
        ParamType::MemrefTempOutput => {
            let actual_size = ds.read_u32()? as usize;
            let signaled_size = ds.read_u32()?;
            Ok(Parameter::MemrefTemp {
                buffer: vec![0u8; actual_size],
                size: signaled_size,
            })
        }
    }
}

/// Serialize a fully-executed operation into a response buffer, ready to send whole.
/// Per-parameter output blocks are included only when the TEE call itself succeeded
/// (`ret_code == TEEC_SUCCESS`); a non-success `ret_code` is still reported to the host as an
/// executor-level success, carrying the TEE's own code as the interesting signal.
pub fn serialize_response(op: &Operation) -> Vec<u8> {
    let mut out = ByteStream::new();
    out.write(&(crate::EXECUTOR_SUCCESS).to_le_bytes());
    let payload_hole = out.write_placeholder(4);

    let arg_bytes = op.invoke_arg.to_bytes();
    out.write_u32(arg_bytes.len() as u32);
    out.write(&arg_bytes);

    if op.invoke_arg.ret_code == TEEC_SUCCESS {
        for (ptype, param) in op.param_types.iter().zip(op.params.iter()) {
            serialize_output_parameter(&mut out, *ptype, param);
        }
    }

    let total = out.len();
    let payload_size = (total - 8) as u32;
    out.patch_u32(payload_hole, payload_size);
    out.into_inner()
}

fn serialize_output_parameter(out: &mut ByteStream, ptype: ParamType, param: &Parameter) {
    match ptype {
        ParamType::None | ParamType::ValueInput | ParamType::MemrefTempInput => {
            out.write_u32(0);
        }
        ParamType::ValueOutput | ParamType::ValueInout => {
            if let Parameter::Value { a, b } = param {
                out.write_u32(8);
                out.write_u32(*a);
                out.write_u32(*b);
            } else {
                out.write_u32(0);
            }
        }
        ParamType::MemrefTempOutput | ParamType::MemrefTempInout => {
            if let Parameter::MemrefTemp { buffer, size } = param {
                let size = *size as usize;
                out.write_u32(size as u32);
                if size > 0 {
                    out.write(&buffer[..size.min(buffer.len())]);
                }
            } else {
                out.write_u32(0);
            }
        }
    }
}

/// Write a single EXECUTOR_ERROR status word and nothing else — the whole response to a
/// marshaling failure.
pub fn serialize_marshal_error<W: Write>(stream: &mut W) -> Result<()> {
    crate::framing::send_all(stream, &(crate::EXECUTOR_ERROR).to_le_bytes())
}

/// A UUID reassembled into the big-endian grouped fields some TEE client ABIs use, built
/// from plain `u8`s so there is no sign-extension path to get wrong. Layout matches the
/// GlobalPlatform `TEEC_UUID` struct exactly, so backends bind it straight into FFI calls.
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GroupedUuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_and_node: [u8; 8],
}

pub fn group_uuid_be(raw: &[u8; 16]) -> GroupedUuid {
    GroupedUuid {
        time_low: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        time_mid: u16::from_be_bytes([raw[4], raw[5]]),
        time_hi_and_version: u16::from_be_bytes([raw[6], raw[7]]),
        clock_seq_and_node: raw[8..16].try_into().unwrap(),
    }
}

/// The "raw bytes" UUID convention (modern OP-TEE, TC): the 16 wire bytes are the struct's
/// native memory layout directly, with no field reassembly.
pub fn uuid_from_raw_bytes(raw: &[u8; 16]) -> GroupedUuid {
    GroupedUuid {
        time_low: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        time_mid: u16::from_le_bytes(raw[4..6].try_into().unwrap()),
        time_hi_and_version: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
        clock_seq_and_node: raw[8..16].try_into().unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_with_param_types(word: u32, param_body: &[u8]) -> ByteStream {
        let mut buf = Vec::new();
        buf.extend_from_slice(&InvokeArg { cmd_id: 1, ret_code: 0, ret_origin: 0 }.to_bytes());
        buf.extend_from_slice(&word.to_le_bytes());
        buf.extend_from_slice(param_body);
        ByteStream::from_vec(buf)
    }

    #[test]
    fn memref_temp_inout_round_trips_through_echo() {
        // slot 0: MEMREF_TEMP_INOUT, rest NONE
        let types = [
            ParamType::MemrefTempInout,
            ParamType::None,
            ParamType::None,
            ParamType::None,
        ];
        let word = pack_param_types(&types);
        let mut body = Vec::new();
        body.extend_from_slice(&5u32.to_le_bytes());
        body.extend_from_slice(b"hello");
        body.extend_from_slice(&5u32.to_le_bytes());
        let mut ds = input_with_param_types(word, &body);
        let mut op = deserialize_input(&mut ds).unwrap();
        op.invoke_arg.ret_code = TEEC_SUCCESS;

        let response = serialize_response(&op);
        // status(4) + payload_size(4) + arg_struct_size(4) + arg(12) + param size(4) + "hello"(5)
        assert_eq!(response.len(), 4 + 4 + 4 + 12 + 4 + 5);
        assert_eq!(&response[0..4], &(crate::EXECUTOR_SUCCESS).to_le_bytes());
        let payload_size = u32::from_le_bytes(response[4..8].try_into().unwrap());
        assert_eq!(payload_size as usize, response.len() - 8);
        assert_eq!(&response[response.len() - 5..], b"hello");
    }

    #[test]
    fn partial_memref_normalizes_identically_to_temp() {
        assert_eq!(
            ParamType::from_nibble(0xD).unwrap(),
            ParamType::from_nibble(0x5).unwrap()
        );
        assert_eq!(
            ParamType::from_nibble(0xE).unwrap(),
            ParamType::from_nibble(0x6).unwrap()
        );
        assert_eq!(
            ParamType::from_nibble(0xF).unwrap(),
            ParamType::from_nibble(0x7).unwrap()
        );
    }

    #[test]
    fn memref_temp_output_allocates_actual_size_and_signals_other_size() {
        let types = [
            ParamType::MemrefTempOutput,
            ParamType::None,
            ParamType::None,
            ParamType::None,
        ];
        let word = pack_param_types(&types);
        let mut body = Vec::new();
        body.extend_from_slice(&64u32.to_le_bytes()); // actual_size
        body.extend_from_slice(&10u32.to_le_bytes()); // signaled_size
        let mut ds = input_with_param_types(word, &body);
        let op = deserialize_input(&mut ds).unwrap();
        match &op.params[0] {
            Parameter::MemrefTemp { buffer, size } => {
                assert_eq!(buffer.len(), 64);
                assert_eq!(*size, 10);
            }
            _ => panic!("expected MemrefTemp"),
        }
    }

    #[test]
    fn memref_temp_input_clamps_size_to_received_length() {
        let types = [
            ParamType::MemrefTempInput,
            ParamType::None,
            ParamType::None,
            ParamType::None,
        ];
        let word = pack_param_types(&types);
        let mut body = Vec::new();
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(b"abcd");
        body.extend_from_slice(&999u32.to_le_bytes());
        let mut ds = input_with_param_types(word, &body);
        let op = deserialize_input(&mut ds).unwrap();
        match &op.params[0] {
            Parameter::MemrefTemp { buffer, size } => {
                assert_eq!(buffer.len(), 4);
                assert_eq!(*size, 4);
            }
            _ => panic!("expected MemrefTemp"),
        }
    }

    #[test]
    fn value_output_allocates_backing_storage_regardless_of_wire_content() {
        let types = [
            ParamType::ValueOutput,
            ParamType::None,
            ParamType::None,
            ParamType::None,
        ];
        let word = pack_param_types(&types);
        let mut body = Vec::new();
        body.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        body.extend_from_slice(&0xcafebabeu32.to_le_bytes());
        let mut ds = input_with_param_types(word, &body);
        let mut op = deserialize_input(&mut ds).unwrap();
        op.invoke_arg.ret_code = TEEC_SUCCESS;
        if let Parameter::Value { a, b } = &mut op.params[0] {
            *a = 7;
            *b = 9;
        }
        let response = serialize_response(&op);
        let tail = &response[response.len() - 12..];
        assert_eq!(u32::from_le_bytes(tail[0..4].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(tail[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(tail[8..12].try_into().unwrap()), 9);
    }

    #[test]
    fn non_success_ret_code_omits_parameter_outputs() {
        let types = [
            ParamType::MemrefTempInout,
            ParamType::None,
            ParamType::None,
            ParamType::None,
        ];
        let word = pack_param_types(&types);
        let mut body = Vec::new();
        body.extend_from_slice(&5u32.to_le_bytes());
        body.extend_from_slice(b"hello");
        body.extend_from_slice(&5u32.to_le_bytes());
        let mut ds = input_with_param_types(word, &body);
        let mut op = deserialize_input(&mut ds).unwrap();
        op.invoke_arg.ret_code = 0xFFFF0007;
        let response = serialize_response(&op);
        assert_eq!(response.len(), 4 + 4 + 4 + 12);
    }

    #[test]
    fn grouped_uuid_treats_bytes_as_unsigned() {
        let raw: [u8; 16] = [
            0xFF, 0x00, 0x00, 0x01, 0xFF, 0x02, 0xFF, 0x03, 0xFF, 0x04, 0x05, 0x06, 0x07, 0x08,
            0x09, 0x0A,
        ];
        let grouped = group_uuid_be(&raw);
        assert_eq!(grouped.time_low, 0xFF000001);
        assert_eq!(grouped.time_mid, 0xFF02);
        assert_eq!(grouped.time_hi_and_version, 0xFF03);
    }
}
