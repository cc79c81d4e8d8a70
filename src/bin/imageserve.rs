// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;

use fast_image::config::{
    listen_addr, ServerConfig, UpstreamConfig, DEFAULT_AUTH_KEY, DEFAULT_HOST,
    DEFAULT_PORT, DEFAULT_UPSTREAM_PORT,
};
use fast_image::delivery::ImageDelivery;
use fast_image::registry::ProtocolRegistry;
use fast_image::server;

static APP: &str = "imageserve";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serve a still image over the Fast RPC protocol")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address to listen on (Default: 127.0.0.1)")
                .long("host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("authKey")
                .help("Secret key clients must provide to make any call")
                .long("authKey")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("file")
                .help("Image file to serve")
                .long("file")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ds_host")
                .help("Hostname of the data server")
                .long("ds-host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ds_port")
                .help("Port of the data server (Default: 11111)")
                .long("ds-port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rs_host")
                .help("Hostname of the render server")
                .long("rs-host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rs_port")
                .help("Port of the render server (Default: 11111)")
                .long("rs-port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("read_timeout")
                .help("Milliseconds to wait for an image read (Default: 5000)")
                .long("read-timeout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("debug")
                .help("Log at debug level")
                .long("debug")
                .short("d")
                .takes_value(false),
        )
        .get_matches()
}

fn upstream(matches: &ArgMatches, host: &str, port: &str) -> UpstreamConfig {
    UpstreamConfig {
        host: matches.value_of(host).map(String::from),
        port: value_t!(matches, port, u16).unwrap_or(DEFAULT_UPSTREAM_PORT),
    }
}

fn build_config(matches: &ArgMatches, log: &Logger) -> ServerConfig {
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let listen = listen_addr(host, port).unwrap_or_else(|e| {
        error!(log, "failed to build listen address"; "err" => %e);
        process::exit(1)
    });

    let mut config = ServerConfig::new(listen)
        .with_auth_key(matches.value_of("authKey").unwrap_or(DEFAULT_AUTH_KEY));
    if let Some(file) = matches.value_of("file") {
        config = config.with_file(file);
    }
    if let Ok(millis) = value_t!(matches, "read_timeout", u64) {
        config = config.with_read_timeout(Duration::from_millis(millis));
    }
    config.data_server = upstream(matches, "ds_host", "ds_port");
    config.render_server = upstream(matches, "rs_host", "rs_port");
    config
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let level = if matches.is_present("debug") {
        Level::Debug
    } else {
        Level::Info
    };

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let config = build_config(&matches, &root_log);
    config.warn_if_incomplete(&root_log);
    info!(root_log, "upstream servers are not contacted";
          "ds_host" => config.data_server.host.clone().unwrap_or_default(),
          "ds_port" => config.data_server.port,
          "rs_host" => config.render_server.host.clone().unwrap_or_default(),
          "rs_port" => config.render_server.port);

    let mut registry = ProtocolRegistry::new(&config.auth_key);
    let delivery = Arc::new(ImageDelivery::new(&config));
    if let Some(file) = delivery.file() {
        info!(root_log, "serving image"; "file" => %file.display());
    }
    if let Err(e) = registry.register(delivery) {
        error!(root_log, "failed to register image delivery"; "err" => %e);
        process::exit(1)
    }
    let registry = Arc::new(registry);

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(root_log, "failed to bind"; "err" => %e);
        process::exit(1)
    });
    info!(root_log, "listening for fast requests";
          "address" => %config.listen,
          "methods" => registry.methods().join(","));

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    server::make_task(socket, registry, Some(&process_log))
                        .await;
                });
            }
            Err(e) => {
                error!(root_log, "failed to accept socket"; "err" => %e)
            }
        }
    }
}
