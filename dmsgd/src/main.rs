// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMSG transport daemon: accepts (or dials) a connection, wraps it in a
//! `dmsg_core::IOCom`, and runs the `poll(2)` reactor over it. Mirrors the
//! daemon-wiring shape of `nvme-driver/src/main.rs` -- init logging the
//! same way, build the core state, hand it to a per-connection loop -- but
//! swaps Redox's `EventQueue`/IRQ-file plumbing for a self-pipe and a
//! `poll(2)` loop.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use dmsg_core::{CryptoAdapter, IOCom, PlaintextAdapter};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::{DmsgConfig, Mode};
use crate::reactor::Wakeup;

mod config;
mod reactor;

fn main() {
    redox_log::init!();
    info!("starting dmsg daemon");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match args.first() {
        Some(a) => DmsgConfig::from_args(a),
        None => DmsgConfig::default(),
    };

    if cfg.aux_buffer_cap > dmsg_core::header::MAX_AUX_BYTES {
        error!(
            "dmsg: aux_buffer_cap={} exceeds protocol maximum {}, clamping",
            cfg.aux_buffer_cap,
            dmsg_core::header::MAX_AUX_BYTES
        );
    }
    info!("dmsg: mode={:?} addr={} encryption={}", cfg.mode, cfg.addr, cfg.encryption_enabled);

    match cfg.mode {
        Mode::Listen => run_listener(&cfg),
        Mode::Connect => run_dialer(&cfg),
    }
}

fn spawn_connection(cfg: &DmsgConfig, stream: TcpStream, peer_label: String) {
    if cfg.encryption_enabled {
        warn!("dmsg: no CryptoAdapter implementation is wired in yet, running {} in plaintext", peer_label);
    }
    // `with_crypto` is the real entry point once a session-crypto adapter
    // is plugged in (spec §6); there is none in this tree yet, so every
    // connection runs the identity `PlaintextAdapter`.
    let crypto: Box<dyn CryptoAdapter> = Box::new(PlaintextAdapter);
    let iocom = match IOCom::with_crypto(peer_label.clone(), cfg.salt_seed, crypto) {
        Ok(i) => Arc::new(Mutex::new(i)),
        Err(e) => {
            error!("dmsg: crypto negotiation failed for {}: {}", peer_label, e);
            return;
        }
    };
    let wakeup = match Wakeup::new() {
        Ok(w) => w,
        Err(e) => {
            error!("dmsg: failed to create wakeup pipe for {}: {}", peer_label, e);
            return;
        }
    };

    thread::spawn(move || {
        if let Err(e) = reactor::run(iocom, stream, wakeup) {
            error!("dmsg: connection {} ended with error: {}", peer_label, e);
        } else {
            info!("dmsg: connection {} closed", peer_label);
        }
    });
}

fn run_listener(cfg: &DmsgConfig) {
    let listener = match TcpListener::bind(&cfg.addr) {
        Ok(l) => l,
        Err(e) => {
            error!("dmsg: failed to bind {}: {}", cfg.addr, e);
            return;
        }
    };
    info!("dmsg: listening on {}", cfg.addr);

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let label = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown-peer".to_string());
                info!("dmsg: accepted connection from {}", label);
                spawn_connection(cfg, stream, label);
            }
            Err(e) => {
                error!("dmsg: accept failed: {}", e);
            }
        }
    }
}

fn run_dialer(cfg: &DmsgConfig) {
    match TcpStream::connect(&cfg.addr) {
        Ok(stream) => {
            info!("dmsg: connected to {}", cfg.addr);
            spawn_connection(cfg, stream, cfg.addr.clone());
            loop {
                thread::park();
            }
        }
        Err(e) => {
            error!("dmsg: failed to connect to {}: {}", cfg.addr, e);
        }
    }
}
