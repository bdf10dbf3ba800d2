// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! C ABI between the gateway and native function modules.
//!
//! A native function is a single Rust source file compiled as a `cdylib`.
//! It must export two symbols:
//!
//! ```text
//! #[no_mangle]
//! pub static HANDLER_SIGNATURE: [u8; 40] = *b"fn(*const ResponseSink, *const Request)\0";
//!
//! #[no_mangle]
//! pub extern "C" fn Handler(sink: *const ResponseSink, request: *const Request) { ... }
//! ```
//!
//! The signature tag is checked before `Handler` is ever resolved, so a module
//! whose handler has some other shape is rejected at load time instead of
//! being called through a mismatched function pointer.
//!
//! All strings crossing the boundary are borrowed `(ptr, len)` pairs that stay
//! valid only for the duration of the call. The handler writes its response
//! through the sink callbacks; the gateway owns every buffer.

use std::ffi::c_void;
use std::slice;

use bytes::Bytes;

/// Exported handler symbol (NUL-terminated for the loader).
pub const HANDLER_SYMBOL: &[u8] = b"Handler\0";

/// Exported signature tag symbol (NUL-terminated for the loader).
pub const SIGNATURE_SYMBOL: &[u8] = b"HANDLER_SIGNATURE\0";

/// Required value of the signature tag, without its trailing NUL.
pub const HANDLER_SIGNATURE: &[u8] = b"fn(*const ResponseSink, *const Request)";

/// Borrowed byte string.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Str {
    /// Start of the buffer; may be null when `len` is zero.
    pub ptr: *const u8,
    /// Length in bytes.
    pub len: usize,
}

impl Str {
    /// Borrow `bytes` for the duration of a call.
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// View the bytes behind this string.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that outlive `'a`.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            &[]
        } else {
            // SAFETY: upheld by the caller.
            unsafe { slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

/// One request header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Header name.
    pub name: Str,
    /// Header value.
    pub value: Str,
}

/// Request as seen by a native handler.
#[repr(C)]
#[derive(Debug)]
pub struct Request {
    /// HTTP method.
    pub method: Str,
    /// Path after the gateway's handle prefix was stripped.
    pub path: Str,
    /// Raw query string without `?`.
    pub query: Str,
    /// Pointer to `headers_len` headers.
    pub headers: *const Header,
    /// Number of headers.
    pub headers_len: usize,
    /// Request body.
    pub body: Str,
}

/// Callbacks the handler uses to produce its response.
#[repr(C)]
pub struct ResponseSink {
    /// Opaque gateway state, passed back to every callback.
    pub context: *mut c_void,
    /// Set the status code (defaults to 200).
    pub set_status: extern "C" fn(*mut c_void, u16),
    /// Append a response header.
    pub set_header: extern "C" fn(*mut c_void, Str, Str),
    /// Append bytes to the response body.
    pub write: extern "C" fn(*mut c_void, Str),
}

/// Type of the exported `Handler` symbol.
pub type HandlerFn = unsafe extern "C" fn(*const ResponseSink, *const Request);

/// Owned request handed to a native function.
#[derive(Debug, Clone, Default)]
pub struct NativeRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string.
    pub query: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Buffered body.
    pub body: Bytes,
}

/// Response collected from a native function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeResponse {
    /// Status code.
    pub status: u16,
    /// Headers in the order the handler set them.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Default for NativeResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

extern "C" fn sink_set_status(context: *mut c_void, status: u16) {
    // SAFETY: `context` is the `NativeResponse` owned by `call_handler`.
    let response = unsafe { &mut *context.cast::<NativeResponse>() };
    response.status = status;
}

extern "C" fn sink_set_header(context: *mut c_void, name: Str, value: Str) {
    // SAFETY: see `sink_set_status`; strings are valid for this call.
    let response = unsafe { &mut *context.cast::<NativeResponse>() };
    let (name, value) = unsafe { (name.as_bytes(), value.as_bytes()) };
    response.headers.push((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ));
}

extern "C" fn sink_write(context: *mut c_void, chunk: Str) {
    // SAFETY: see `sink_set_status`.
    let response = unsafe { &mut *context.cast::<NativeResponse>() };
    response.body.extend_from_slice(unsafe { chunk.as_bytes() });
}

/// Call `handler` with `request` and collect what it writes.
///
/// # Safety
///
/// `handler` must be a function with the [`HandlerFn`] signature that only
/// touches the request and sink for the duration of the call.
pub unsafe fn call_handler(handler: HandlerFn, request: &NativeRequest) -> NativeResponse {
    let headers: Vec<Header> = request
        .headers
        .iter()
        .map(|(name, value)| Header {
            name: Str::new(name.as_bytes()),
            value: Str::new(value.as_bytes()),
        })
        .collect();

    let ffi_request = Request {
        method: Str::new(request.method.as_bytes()),
        path: Str::new(request.path.as_bytes()),
        query: Str::new(request.query.as_bytes()),
        headers: headers.as_ptr(),
        headers_len: headers.len(),
        body: Str::new(&request.body),
    };

    let mut response = NativeResponse::default();
    let sink = ResponseSink {
        context: (&mut response as *mut NativeResponse).cast(),
        set_status: sink_set_status,
        set_header: sink_set_header,
        write: sink_write,
    };

    // SAFETY: upheld by the caller; every pointer above outlives the call.
    unsafe { handler(&sink, &ffi_request) };

    response
}
