// Copyright 2020 Joyent, Inc.

use std::fs;
use std::io::Error;
use std::net::SocketAddr;
use std::process;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::{json, Value};
use tokio::net::TcpStream;

use fast_image::client;
use fast_image::config::{DEFAULT_AUTH_KEY, DEFAULT_HOST, DEFAULT_PORT};
use fast_image::protocol::{FastMessage, FastMessageId};
use fast_image::registry::AUTH_METHOD;

static APP: &str = "imagecall";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for calling an image delivery server")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("authKey")
                .help("Secret key expected by the server")
                .long("authKey")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded arguments for RPC method call")
                .long("args")
                .takes_value(true)
                .default_value("[]"),
        )
        .arg(
            Arg::with_name("decode")
                .help("Write the decoded stillRender image to this path")
                .long("decode")
                .takes_value(true),
        )
        .get_matches()
}

/// Issues one call and collects the DATA payloads of the response.
async fn call(
    method: &str,
    args: Value,
    msg_id: &mut FastMessageId,
    stream: &mut TcpStream,
) -> Result<Vec<Value>, Error> {
    let mut replies = Vec::new();
    client::send(String::from(method), args, msg_id, stream).await?;
    client::receive(stream, |msg: &FastMessage| {
        if let Value::Array(values) = &msg.data.d {
            replies.extend(values.iter().cloned());
        }
        Ok(())
    })
    .await?;
    Ok(replies)
}

fn write_image(reply: &Value, path: &str) -> Result<(), String> {
    let image = reply["image"]
        .as_str()
        .ok_or_else(|| String::from("reply has no image; call initRender first"))?;
    let bytes = STANDARD
        .decode(image)
        .map_err(|e| format!("image is not valid base64: {}", e))?;
    fs::write(path, bytes).map_err(|e| format!("{}: {}", path, e))
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let method =
        String::from(matches.value_of("method").unwrap_or_else(|| {
            eprintln!("Failed to parse method argument as String");
            process::exit(1)
        }));
    let args = value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit());
    let secret = matches.value_of("authKey").unwrap_or(DEFAULT_AUTH_KEY);

    let mut stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let mut msg_id = FastMessageId::new();
    let auth_args = json!([{ "secret": secret }]);
    if let Err(e) = call(AUTH_METHOD, auth_args, &mut msg_id, &mut stream).await {
        eprintln!("Error: {}", e);
        process::exit(1)
    }

    match call(&method, args, &mut msg_id, &mut stream).await {
        Ok(replies) => match (matches.value_of("decode"), replies.first()) {
            (Some(path), Some(reply)) => {
                if let Err(e) = write_image(reply, path) {
                    eprintln!("Error: {}", e);
                    process::exit(1)
                }
            }
            _ => {
                for reply in replies {
                    println!("{}", reply);
                }
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
