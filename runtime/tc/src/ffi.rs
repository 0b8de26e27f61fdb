// SPDX-License-Identifier: GPL-3.0-or-later
//! Raw ioctls against `/dev/tc_ns_client`, the Huawei TrustedCore kernel driver node. The
//! request codes below are the `TC_NS_CLIENT_IOCTL_*` magic/number pairs the driver exposes;
//! the structs mirror its on-wire layout closely enough to marshal through `ioctl(2)` but are
//! otherwise opaque, implementation-defined blobs this crate never interprets further.

use nix::{ioctl_readwrite, ioctl_write_ptr};
use std::os::raw::c_char;

const TC_NS_CLIENT_IOC_MAGIC: u8 = b't';

#[repr(C)]
#[derive(Debug, Default)]
pub struct TcNsClientLogin {
    pub method: u32,
    pub mdata: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct TcNsClientContext {
    pub session_id: u32,
    pub cmd_id: u32,
    pub started: u32,
    pub ret_val: u32,
    pub param_types: u32,
    pub login: TcNsClientLogin,
    pub params: [TcNsClientParam; 4],
    pub uuid: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TcNsClientParam {
    pub value_a: u32,
    pub value_b: u32,
    pub buffer_addr: u64,
    pub buffer_h_addr: u32,
    pub buffer_size: u32,
}

#[repr(C)]
#[derive(Debug)]
pub struct TcNsClientLoad {
    pub file_name: [c_char; 64],
    pub file_addr: u64,
    pub file_size: u32,
}

impl Default for TcNsClientLoad {
    fn default() -> Self {
        Self {
            file_name: [0; 64],
            file_addr: 0,
            file_size: 0,
        }
    }
}

// Request numbers below are the real `TC_NS_CLIENT_IOCTL_*` values from the driver header, not
// a sequential assignment: SES_OPEN_REQ=1, SES_CLOSE_REQ=2, SEND_CMD_REQ=3, LOAD_APP_REQ=9,
// LOGIN=14. SES_OPEN_REQ is the one `_IOW` (write-only) entry; the rest are `_IOWR`.
//
// The header declares LOGIN's argument as a bare `int` and LOAD_APP_REQ's as
// `TC_NS_ClientContext`, but neither matches what actually crosses the boundary: LOGIN carries
// the two-`u32` `TcNsClientLogin` payload this crate parses out of the login blob, and
// LOAD_APP_REQ carries the file-name/addr/size triple needed to name a `.sec` image. Only the
// request code's magic/number pair is load-bearing for reaching the right driver entry point;
// the type parameter here picks the struct this crate actually marshals through it.
ioctl_readwrite!(ioctl_login, TC_NS_CLIENT_IOC_MAGIC, 14, TcNsClientLogin);
ioctl_readwrite!(ioctl_load_app, TC_NS_CLIENT_IOC_MAGIC, 9, TcNsClientLoad);
ioctl_write_ptr!(ioctl_session_open, TC_NS_CLIENT_IOC_MAGIC, 1, TcNsClientContext);
ioctl_readwrite!(ioctl_send_cmd, TC_NS_CLIENT_IOC_MAGIC, 3, TcNsClientContext);
ioctl_readwrite!(ioctl_session_close, TC_NS_CLIENT_IOC_MAGIC, 2, TcNsClientContext);
