// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generated server bootstrap for script functions.
//!
//! The bootstrap `require()`s the bundle, picks the exported callable (the
//! export itself, or its `default`), and serves it on the function's route
//! from Node's built-in `http` module. A thin compatibility layer provides
//! the request/response helpers handlers usually rely on (`req.query`,
//! `req.body`, `res.status()`, `res.send()`, `res.json()`), so no framework
//! has to be installed next to the functions.
//!
//! Once listening, it prints [`READY_MARKER`] followed by the port on stdout.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Line prefix printed by the bootstrap once it accepts connections.
pub const READY_MARKER: &str = "FUNCGATE_READY";

/// Exit code used when the bundle exports nothing callable.
pub const EXIT_NO_HANDLER: i32 = 78;

const TEMPLATE: &str = r#"'use strict';
const http = require('http');
const querystring = require('querystring');

const ROUTE = __ROUTE__;
const PORT = __PORT__;
const HOST = '127.0.0.1';

const exported = require(__BUNDLE__);
const handler = typeof exported === 'function'
  ? exported
  : exported && typeof exported.default === 'function'
    ? exported.default
    : null;

if (handler === null) {
  console.error('funcgate: ' + __SOURCE__ + ' must export a function or an object with a default function');
  process.exit(__EXIT_NO_HANDLER__);
}

function normalize(path) {
  const trimmed = path.replace(/\/+$/, '');
  return trimmed === '' ? '/' : trimmed;
}

function parseBody(req, raw) {
  if (raw.length === 0) return {};
  const type = String(req.headers['content-type'] || '').split(';')[0].trim().toLowerCase();
  if (type === 'application/json' || type.endsWith('+json')) {
    return JSON.parse(raw.toString('utf8'));
  }
  if (type === 'application/x-www-form-urlencoded') {
    return querystring.parse(raw.toString('utf8'));
  }
  if (type.startsWith('text/')) return raw.toString('utf8');
  return raw;
}

function decorate(res) {
  res.status = function (code) {
    res.statusCode = code;
    return res;
  };
  res.set = res.header = function (field, value) {
    if (typeof field === 'object') {
      for (const key of Object.keys(field)) res.setHeader(key, field[key]);
    } else {
      res.setHeader(field, value);
    }
    return res;
  };
  res.get = function (field) {
    return res.getHeader(field);
  };
  res.json = function (value) {
    if (!res.hasHeader('content-type')) res.setHeader('content-type', 'application/json; charset=utf-8');
    res.end(JSON.stringify(value));
    return res;
  };
  res.send = function (body) {
    if (body === undefined || body === null) {
      res.end();
      return res;
    }
    if (Buffer.isBuffer(body)) {
      if (!res.hasHeader('content-type')) res.setHeader('content-type', 'application/octet-stream');
      res.end(body);
      return res;
    }
    if (typeof body === 'object') return res.json(body);
    if (!res.hasHeader('content-type')) res.setHeader('content-type', 'text/html; charset=utf-8');
    res.end(String(body));
    return res;
  };
  res.sendStatus = function (code) {
    res.statusCode = code;
    res.setHeader('content-type', 'text/plain; charset=utf-8');
    res.end(http.STATUS_CODES[code] || String(code));
    return res;
  };
  res.redirect = function (a, b) {
    const code = typeof a === 'number' ? a : 302;
    res.statusCode = code;
    res.setHeader('location', typeof a === 'number' ? b : a);
    res.end();
    return res;
  };
  return res;
}

const server = http.createServer((req, res) => {
  const url = new URL(req.url, 'http://' + HOST);
  decorate(res);
  if (normalize(url.pathname) !== ROUTE) {
    res.sendStatus(404);
    return;
  }

  const chunks = [];
  req.on('data', (chunk) => chunks.push(chunk));
  req.on('end', () => {
    const raw = Buffer.concat(chunks);
    req.path = url.pathname;
    req.query = querystring.parse(url.search.slice(1));
    req.rawBody = raw;
    try {
      req.body = parseBody(req, raw);
    } catch (err) {
      res.sendStatus(400);
      return;
    }
    Promise.resolve()
      .then(() => handler(req, res))
      .catch((err) => {
        console.error(err && err.stack ? err.stack : err);
        if (!res.headersSent) res.sendStatus(500);
        else res.end();
      });
  });
});

server.on('error', (err) => {
  console.error('funcgate: ' + err.message);
  process.exit(1);
});

server.listen(PORT, HOST, () => {
  console.log(__READY_MARKER__ + ' ' + PORT);
});
"#;

/// Render the bootstrap source for one function instance.
pub fn render(route: &str, bundle: &Path, source: &Path, port: u16) -> String {
    let values = [
        ("__ROUTE__", js_string(route)),
        ("__PORT__", port.to_string()),
        ("__BUNDLE__", js_string(&bundle.to_string_lossy())),
        ("__SOURCE__", js_string(&source.to_string_lossy())),
        ("__EXIT_NO_HANDLER__", EXIT_NO_HANDLER.to_string()),
        ("__READY_MARKER__", js_string(READY_MARKER)),
    ];
    substitute(TEMPLATE, &values)
}

/// Replace placeholders in a single pass. Inserted values are never rescanned.
fn substitute(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len() + 512);
    let mut rest = template;
    'scan: while let Some(start) = rest.find("__") {
        for (placeholder, value) in values {
            if rest[start..].starts_with(placeholder) {
                out.push_str(&rest[..start]);
                out.push_str(value);
                rest = &rest[start + placeholder.len()..];
                continue 'scan;
            }
        }
        out.push_str(&rest[..=start]);
        rest = &rest[start + 1..];
    }
    out.push_str(rest);
    out
}

/// Write `contents` to a fresh `<stem>-server-XXXXXX.js` file in `dir`.
pub fn write(dir: &Path, stem: &str, contents: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}-server-", stem))
        .suffix(".js")
        .tempfile_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Parse a ready line, returning the announced port.
pub fn parse_ready_line(line: &str) -> Option<u16> {
    line.trim()
        .strip_prefix(READY_MARKER)?
        .trim()
        .parse()
        .ok()
}

// JSON string literals are valid JavaScript string literals.
fn js_string(value: &str) -> String {
    Value::from(value).to_string()
}
