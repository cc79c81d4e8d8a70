// Copyright 2020 Joyent, Inc.

//! fast-image: still image delivery over the Fast RPC protocol
//!
//! A server built on this crate exposes one image file to remote clients.
//! Clients connect over TCP, authenticate with a shared secret, call
//! `initRender` once, and then fetch the image with `stillRender`, which
//! returns the file contents base64-encoded.
//!
//! Fast protocol messages have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer.  The only supported values are:
//!
//!     * STATUS_DATA  0x1  indicates a "data" message
//!
//!     * STATUS_END   0x2  indicates an "end" message
//!
//!     * STATUS_ERROR 0x3  indicates an "error" message
//!
//! * MSGID1...MSGID4    4-byte big-endian unsigned integer, a unique identifier
//!                    for this message
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload.  This is a JSON-encoded object (for TYPE =
//!                    TYPE_JSON).  The encoding length in bytes is given by the
//!                    DLEN0...DLEN4 bytes.
//!
//! Message IDs: each Fast message has a message id, which is scoped to the Fast
//! connection.  These are allocated sequentially from a circular 31-bit space.
//!
//! RPC methods:
//!
//! * `authenticate`  `[{"secret": "..."}]`, required before any other call
//!
//! * `initRender`    `[]`, marks the image as ready to serve
//!
//! * `stillRender`   `[options]`, returns the image or `{}` before `initRender`

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
