//! Minimal wirehub server.
//!
//! Run:
//! - cargo run -p wirehub --example server
//! - cargo run -p wirehub --example server -- 127.0.0.1:8888
//! - cargo run -p wirehub --example server -- 127.0.0.1:8888 127.0.0.1:9999
//!
//! The first argument is the listen address, the optional second is a
//! peer server to link with.

use std::{env, net::SocketAddr};

use wirehub::{Config, Reactor};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut args = env::args().skip(1);
    let listen: SocketAddr =
        args.next().and_then(|s| s.parse().ok()).unwrap_or_else(|| "127.0.0.1:8888".parse().unwrap());
    let peer: Option<SocketAddr> = args.next().and_then(|s| s.parse().ok());

    let mut config = Config::default();
    config.server_name = format!("wirehub-{}", listen.port());
    // a lenient demo limit; production meshes tune these per class
    config.flood_commands = 50;

    let mut reactor = Reactor::new(config)?;
    let local = reactor.listen(listen)?;
    println!("wirehub listening on {}", local);

    if let Some(peer) = peer {
        reactor.connect_server(peer)?;
        println!("linking with {}", peer);
    }

    reactor.run()?;
    Ok(())
}
