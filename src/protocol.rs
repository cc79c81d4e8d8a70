// Copyright 2020 Joyent, Inc.

use std::io::{Error, ErrorKind};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use chrono::Utc;
use crc16::*;
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/*
 * Message IDs: each Fast message has a message id, which is scoped to the Fast
 * connection.  We allocate these sequentially from a circular 31-bit space.
 */
const FP_MSGID_MAX: u32 = i32::max_value() as u32;

const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

/// Largest data payload accepted from a peer.  Longer frames are rejected
/// from the header alone, before any payload is buffered.
pub const FP_MAX_DATA_LEN: usize = 64 * 1024 * 1024;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum FastMessageType {
    Json = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

/// Errors from parsing a buffer.  `NotEnoughBytes` is not fatal: the caller
/// should wait for more input and try again.
#[derive(Debug)]
pub enum FastParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for FastParseError {
    fn from(error: io::Error) -> Self {
        FastParseError::IOError(error)
    }
}

impl From<FastParseError> for io::Error {
    fn from(pfr: FastParseError) -> Self {
        match pfr {
            FastParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse message: not enough bytes";
                Error::new(ErrorKind::Other, msg)
            }
            FastParseError::IOError(e) => e,
        }
    }
}

struct FastMessageHeader {
    msg_type: FastMessageType,
    status: FastMessageStatus,
    id: u32,
    data_len: usize,
}

/// Sequential message id allocator for one connection.
#[derive(Debug, Default)]
pub struct FastMessageId(u32);

impl FastMessageId {
    pub fn new() -> Self {
        FastMessageId(0)
    }
}

impl Iterator for FastMessageId {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        // Ids wrap within the 31-bit space and skip zero
        self.0 = self.0 % FP_MSGID_MAX + 1;
        Some(self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FastMessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = Utc::now();
        let now_micros = now.timestamp() as u64 * 1_000_000
            + u64::from(now.timestamp_subsec_micros());

        FastMessageMetaData {
            uts: now_micros,
            name: n,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FastMessageData {
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(n),
            d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FastMessage {
    pub msg_type: FastMessageType,
    pub status: FastMessageStatus,
    pub id: u32,
    pub msg_size: Option<usize>,
    pub data: FastMessageData,
}

impl PartialEq for FastMessage {
    fn eq(&self, other: &FastMessage) -> bool {
        self.msg_type == other.msg_type
            && self.status == other.status
            && self.id == other.id
            && self.data == other.data
    }
}

impl FastMessage {
    pub fn parse(buf: &[u8]) -> Result<FastMessage, FastParseError> {
        FastMessage::check_buffer_size(buf)?;
        let header = FastMessage::parse_header(buf)?;

        FastMessage::validate_data_length(buf, header.data_len)?;
        // node-fast computes the CRC with a buggy crc library, so the CRC
        // field is not verified on receipt.
        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + header.data_len];
        let data = FastMessage::parse_data(raw_data)?;

        Ok(FastMessage {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            msg_size: Some(FP_HEADER_SZ + header.data_len),
            data,
        })
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), FastParseError> {
        if buf.len() < FP_HEADER_SZ {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_header(buf: &[u8]) -> Result<FastMessageHeader, FastParseError> {
        if buf[FP_OFF_VERSION] != FP_VERSION_CURRENT {
            let msg = format!(
                "Unsupported protocol version: {}",
                buf[FP_OFF_VERSION]
            );
            return Err(Error::new(ErrorKind::Other, msg).into());
        }
        let msg_type = FromPrimitive::from_u8(buf[FP_OFF_TYPE])
            .ok_or_else(|| {
                let msg = "Failed to parse message type";
                Error::new(ErrorKind::Other, msg)
            })?;
        let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS])
            .ok_or_else(|| {
                let msg = "Failed to parse message status";
                Error::new(ErrorKind::Other, msg)
            })?;
        let msg_id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;
        if data_len > FP_MAX_DATA_LEN {
            let msg = format!(
                "Data payload of {} bytes exceeds the {} byte limit",
                data_len, FP_MAX_DATA_LEN
            );
            return Err(Error::new(ErrorKind::Other, msg).into());
        }

        Ok(FastMessageHeader {
            msg_type,
            status,
            id: msg_id,
            data_len,
        })
    }

    fn validate_data_length(
        buf: &[u8],
        data_length: usize,
    ) -> Result<(), FastParseError> {
        if buf.len() < (FP_HEADER_SZ + data_length) {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<FastMessageData, FastParseError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
                let msg = "Failed to parse data payload as JSON";
                FastParseError::IOError(Error::new(ErrorKind::Other, msg))
            }),
            Err(_) => {
                let msg = "Failed to parse data payload as UTF-8";
                Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)))
            }
        }
    }

    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    pub fn end(msg_id: u32, method: String) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            msg_size: None,
            data: FastMessageData::new(method, Value::Array(vec![])),
        }
    }

    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            msg_size: None,
            data,
        }
    }
}

pub struct FastRpc;

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, io::Error> {
        match FastMessage::parse(&buf[..]) {
            Ok(parsed_msg) => {
                // msg_size is always set by parse
                let consumed = parsed_msg.msg_size.unwrap_or(buf.len());
                buf.advance(consumed);
                Ok(Some(parsed_msg))
            }
            Err(FastParseError::NotEnoughBytes(_)) => Ok(None),
            Err(FastParseError::IOError(e)) => {
                let msg = format!("failed to parse Fast request: {}", e);
                Err(Error::new(ErrorKind::Other, msg))
            }
        }
    }
}

impl Encoder<Vec<FastMessage>> for FastRpc {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: Vec<FastMessage>,
        buf: &mut BytesMut,
    ) -> Result<(), io::Error> {
        item.iter()
            .try_for_each(|msg| encode_msg(msg, buf))
            .map_err(|errs| Error::new(ErrorKind::Other, errs))
    }
}

pub fn encode_msg(msg: &FastMessage, buf: &mut BytesMut) -> Result<(), String> {
    let m_msg_type_u8 = ToPrimitive::to_u8(&msg.msg_type);
    let m_status_u8 = ToPrimitive::to_u8(&msg.status);
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let data_str = serde_json::to_string(&msg.data)
                .map_err(|e| format!("Failed to encode data payload: {}", e))?;
            let data_len = data_str.len();
            buf.reserve(FP_HEADER_SZ + data_len);
            buf.put_u8(FP_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u32(msg.id);
            buf.put_u32(State::<ARC>::calculate(data_str.as_bytes()) as u32);
            buf.put_u32(data_len as u32);
            buf.put_slice(data_str.as_bytes());
            Ok(())
        }
        (None, Some(_)) => Err(String::from("Invalid message type")),
        (Some(_), None) => Err(String::from("Invalid status")),
        (None, None) => Err(String::from("Invalid message type and status")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::quickcheck;
    use serde_json::json;

    fn encoded(msg: &FastMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_msg(msg, &mut buf).expect("failed to encode message");
        buf
    }

    quickcheck! {
        fn prop_encoded_message_parses(id: u32, name: String, arg: String) -> bool {
            let data = FastMessageData::new(name, json!([arg]));
            let msg = FastMessage::data(id, data);
            let buf = encoded(&msg);
            match FastMessage::parse(&buf) {
                Ok(parsed) => parsed == msg && parsed.msg_size == Some(buf.len()),
                Err(_) => false,
            }
        }
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let msg = FastMessage::end(7, String::from("stillRender"));
        let buf = encoded(&msg);

        match FastMessage::parse(&buf[..FP_HEADER_SZ - 1]) {
            Err(FastParseError::NotEnoughBytes(n)) => {
                assert_eq!(n, FP_HEADER_SZ - 1)
            }
            _ => panic!("expected NotEnoughBytes for a truncated header"),
        }

        match FastMessage::parse(&buf[..buf.len() - 1]) {
            Err(FastParseError::NotEnoughBytes(_)) => (),
            _ => panic!("expected NotEnoughBytes for a truncated payload"),
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let msg = FastMessage::data(
            1,
            FastMessageData::new(String::from("initRender"), json!([])),
        );
        let mut buf = encoded(&msg);
        buf[FP_OFF_VERSION] = 0x2;

        match FastMessage::parse(&buf) {
            Err(FastParseError::IOError(e)) => {
                assert!(e.to_string().contains("version"))
            }
            _ => panic!("expected version error"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_u8(FP_VERSION_CURRENT);
        buf.put_u8(FastMessageType::Json as u8);
        buf.put_u8(FastMessageStatus::Data as u8);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(u32::max_value());
        buf.put_slice(b"{\"m\":");

        match FastMessage::parse(&buf) {
            Err(FastParseError::IOError(e)) => {
                assert!(e.to_string().contains("exceeds"))
            }
            _ => panic!("expected an error for an oversized frame"),
        }
        assert!(FastRpc.decode(&mut buf).is_err());
    }

    #[test]
    fn crc_mismatch_is_tolerated() {
        let msg = FastMessage::data(
            9,
            FastMessageData::new(String::from("stillRender"), json!([{}])),
        );
        let mut buf = encoded(&msg);
        buf[FP_OFF_CRC] ^= 0xff;

        let parsed = FastMessage::parse(&buf).expect("crc is not verified");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn decoder_consumes_one_frame_at_a_time() {
        let first = FastMessage::data(
            1,
            FastMessageData::new(String::from("initRender"), json!([])),
        );
        let second = FastMessage::end(1, String::from("initRender"));

        let mut buf = BytesMut::new();
        FastRpc
            .encode(vec![first.clone(), second.clone()], &mut buf)
            .expect("failed to encode batch");
        let total = buf.len();

        let decoded = FastRpc.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, first);
        assert_eq!(buf.len(), total - decoded.msg_size.unwrap());

        let decoded = FastRpc.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, second);
        assert!(buf.is_empty());
        assert!(FastRpc.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn message_ids_wrap_and_skip_zero() {
        let mut ids = FastMessageId(FP_MSGID_MAX - 1);
        assert_eq!(ids.next(), Some(FP_MSGID_MAX));
        assert_eq!(ids.next(), Some(1));
        assert_eq!(FastMessageId::new().next(), Some(1));
    }
}
