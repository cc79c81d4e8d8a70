// Copyright 2020 Joyent, Inc.

use std::io::{Error, ErrorKind};

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol;
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageId, FastMessageStatus,
    FastParseError,
};

enum BufferAction {
    Keep,
    Trim(usize),
    Done,
}

/// Sends a single request for `method`.  `args` should be a JSON array.
pub async fn send(
    method: String,
    args: Value,
    msg_id: &mut FastMessageId,
    stream: &mut TcpStream,
) -> Result<usize, Error> {
    let id = msg_id.next().unwrap_or(1);
    let msg = FastMessage::data(id, FastMessageData::new(method, args));
    let mut write_buf = BytesMut::new();
    protocol::encode_msg(&msg, &mut write_buf)
        .map_err(|err_str| Error::new(ErrorKind::Other, err_str))?;
    stream.write_all(write_buf.as_ref()).await?;
    Ok(write_buf.len())
}

/// Reads responses until the END message, passing each DATA message to
/// `response_handler`.  An ERROR message from the server ends the call with
/// an error of the form `"<name>: <message>"`.
pub async fn receive<F>(
    stream: &mut TcpStream,
    mut response_handler: F,
) -> Result<usize, Error>
where
    F: FnMut(&FastMessage) -> Result<(), Error>,
{
    let mut msg_buf: Vec<u8> = Vec::new();
    let mut total_bytes = 0;

    loop {
        let mut read_buf = [0; 4096];
        let byte_count = stream.read(&mut read_buf).await?;
        if byte_count == 0 {
            let msg = "connection closed before end of response";
            return Err(Error::new(ErrorKind::UnexpectedEof, msg));
        }
        total_bytes += byte_count;
        msg_buf.extend_from_slice(&read_buf[0..byte_count]);

        match parse_and_handle_messages(
            msg_buf.as_slice(),
            &mut response_handler,
        )? {
            BufferAction::Keep => (),
            BufferAction::Trim(rest_offset) => {
                msg_buf.drain(..rest_offset);
            }
            BufferAction::Done => return Ok(total_bytes),
        }
    }
}

fn parse_and_handle_messages<F>(
    read_buf: &[u8],
    response_handler: &mut F,
) -> Result<BufferAction, Error>
where
    F: FnMut(&FastMessage) -> Result<(), Error>,
{
    let mut offset = 0;
    let mut result = BufferAction::Keep;

    loop {
        match FastMessage::parse(&read_buf[offset..]) {
            Ok(ref fm) if fm.status == FastMessageStatus::End => {
                return Ok(BufferAction::Done);
            }
            Ok(ref fm) if fm.status == FastMessageStatus::Error => {
                return Err(server_error(fm));
            }
            Ok(fm) => {
                offset += fm.msg_size.unwrap_or(read_buf.len() - offset);
                response_handler(&fm)?;
                result = BufferAction::Trim(offset);
            }
            Err(FastParseError::NotEnoughBytes(_bytes)) => {
                return Ok(result);
            }
            Err(FastParseError::IOError(e)) => {
                return Err(e);
            }
        }
    }
}

fn server_error(msg: &FastMessage) -> Error {
    let name = msg.data.d["name"].as_str().unwrap_or("Error");
    let message = msg.data.d["message"].as_str().unwrap_or("");
    Error::new(ErrorKind::Other, format!("{}: {}", name, message))
}
