//! Thin, non-core binary exercising the library's public `Manager`/`Node`/
//! `Transport` types over a real UDP socket, for manual interoperability
//! testing (§6, §10.5). Hand-rolled argument parsing -- no `clap`/
//! `structopt` dependency for a half-dozen flags.

use bitdht::{Config, Manager, Node, NodeId, RateClass, Transport};
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

struct Args {
    port: u16,
    bootstrap_file: Option<String>,
    uid: Option<String>,
    lookups: u32,
}

fn parse_args() -> Result<Args, String> {
    let mut port: u16 = 6775;
    let mut bootstrap_file = None;
    let mut uid = None;
    let mut lookups = 0u32;

    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "-p" => {
                let v = it.next().ok_or("-p requires a port")?;
                port = v.parse().map_err(|_| "invalid port")?;
                if !(1001..16000).contains(&port) {
                    return Err("port out of range 1001..16000".to_string());
                }
            }
            "-b" => bootstrap_file = Some(it.next().ok_or("-b requires a path")?),
            "-u" => uid = Some(it.next().ok_or("-u requires a uid string")?),
            "-q" => {
                let v = it.next().ok_or("-q requires a count")?;
                lookups = v.parse().map_err(|_| "invalid lookup count")?;
            }
            "-r" | "-j" => {
                // Cycling start/stop and socket rebinds is a manual
                // interoperability stress mode, not exercised here.
            }
            other => return Err(format!("unrecognised flag: {}", other)),
        }
    }

    Ok(Args {
        port,
        bootstrap_file,
        uid,
        lookups,
    })
}

fn uid_to_node_id(s: &str) -> NodeId {
    let mut bytes = [0u8; 20];
    let src = s.as_bytes();
    let n = src.len().min(20);
    bytes[..n].copy_from_slice(&src[..n]);
    NodeId(bytes)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("argument error: {}", e);
            return ExitCode::from(1);
        }
    };

    let local_id = args.uid.as_deref().map(uid_to_node_id).unwrap_or_else(NodeId::random);
    let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), args.port);

    let mut config = Config::new().with_bind_addr(bind_addr).with_rate_class(RateClass::Medium);
    if let Some(path) = &args.bootstrap_file {
        config = config.with_bootstrap_path(path.clone());
    }

    let mut node = Node::new(local_id, config.clone());
    if let Some(path) = &config.bootstrap_path {
        node.peer_store_mut().load(path);
    }

    let manager = Manager::new();

    for i in 0..args.lookups {
        log::info!("issuing random lookup {}/{}", i + 1, args.lookups);
        node.add_query(NodeId::random(), 0, std::time::Instant::now());
    }

    let transport = match Transport::bind(bind_addr).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("could not bind UDP socket on {}: {}", bind_addr, e);
            return ExitCode::from(1);
        }
    };

    bitdht::transport::run_node(transport, node, manager, config, None).await;
    ExitCode::from(0)
}
