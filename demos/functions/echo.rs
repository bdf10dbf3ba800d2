// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native function served at /echo: replies with the method, path, query,
//! and request body.

use std::ffi::c_void;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Str {
    ptr: *const u8,
    len: usize,
}

impl Str {
    fn from(bytes: &[u8]) -> Self {
        Str { ptr: bytes.as_ptr(), len: bytes.len() }
    }
}

#[repr(C)]
pub struct Header {
    name: Str,
    value: Str,
}

#[repr(C)]
pub struct Request {
    method: Str,
    path: Str,
    query: Str,
    headers: *const Header,
    headers_len: usize,
    body: Str,
}

#[repr(C)]
pub struct ResponseSink {
    context: *mut c_void,
    set_status: extern "C" fn(*mut c_void, u16),
    set_header: extern "C" fn(*mut c_void, Str, Str),
    write: extern "C" fn(*mut c_void, Str),
}

#[no_mangle]
pub static HANDLER_SIGNATURE: [u8; 40] = *b"fn(*const ResponseSink, *const Request)\0";

#[no_mangle]
pub extern "C" fn Handler(sink: *const ResponseSink, request: *const Request) {
    let sink = unsafe { &*sink };
    let request = unsafe { &*request };

    (sink.set_status)(sink.context, 200);
    (sink.set_header)(sink.context, Str::from(b"content-type"), Str::from(b"text/plain"));
    for part in [request.method, request.path, request.query, request.body] {
        (sink.write)(sink.context, part);
        (sink.write)(sink.context, Str::from(b"\n"));
    }
}
