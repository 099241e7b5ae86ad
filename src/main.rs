use std::process;

use clap::Parser;
use tracing::{error, info, warn};

use dejitun::config::Options;
use dejitun::net::{Transport, Tunnel};
use dejitun::tun_tap::Tun;

fn main() {
    let opts = Options::parse();

    if let Err(err) = dejitun::log::init(opts.debug_file.as_deref()) {
        eprintln!("dejitun: {err}");
        process::exit(1);
    }

    if let Err(err) = run(&opts) {
        error!("{err}");
        process::exit(1);
    }
}

/// Opens both endpoints and runs the tunnel until a shutdown signal arrives.
fn run(opts: &Options) -> dejitun::Result<()> {
    let delays = opts.delays()?;
    let peer = opts.peer_addr()?;

    if delays.jitter_ms > 0 && delays.min_ms == 0 {
        warn!("jitter has no effect without a min delay");
    }

    let nic = Tun::open(&opts.interface, !opts.no_packet_info)?;
    nic.set_non_blocking()?;

    let net = Transport::bind(opts.port, peer)?;

    info!(
        packet_info = nic.packet_info(),
        "dejitun {} is up on {}, peer {}",
        env!("CARGO_PKG_VERSION"),
        nic.name(),
        net.peer_addr()
    );

    let mut tunnel = Tunnel::new(nic, net, delays)?.catch_signals()?;
    tunnel.run()
}
