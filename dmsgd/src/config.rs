// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Daemon-wide configuration (spec's Configuration section): which address
//! to listen on or connect to, whether the crypto handshake is required,
//! and the aux-buffer ceiling `dmsg-core`'s decoder enforces.

/// Whether this instance listens for an incoming connection or dials out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Listen,
    Connect,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Listen
    }
}

/// Daemon-wide tunables, normally populated from defaults and overridden by
/// scheme-mount-style `key=value` arguments on the command line.
#[derive(Debug, Clone)]
pub struct DmsgConfig {
    pub mode: Mode,
    /// `host:port` to bind (listen mode) or dial (connect mode).
    pub addr: String,
    /// Whether a real `CryptoAdapter` handshake is required before the
    /// link is considered up, or the `PlaintextAdapter` no-op is used.
    pub encryption_enabled: bool,
    /// Upper bound on a single message's aux-data length; the decoder
    /// rejects anything larger with `DmsgError::Field` (spec §6, §7).
    pub aux_buffer_cap: u32,
    /// Random seed handed to the egress flusher's salt RNG at startup.
    pub salt_seed: u64,
}

impl Default for DmsgConfig {
    fn default() -> Self {
        DmsgConfig {
            mode: Mode::default(),
            addr: "127.0.0.1:4730".to_string(),
            encryption_enabled: false,
            aux_buffer_cap: crate::reactor::DEFAULT_AUX_CAP,
            salt_seed: 0x444d_5347_6461_656d,
        }
    }
}

impl DmsgConfig {
    /// Parses `key=value,key=value` arguments, falling back to defaults
    /// for anything unrecognized or malformed.
    pub fn from_args(args: &str) -> Self {
        let mut cfg = DmsgConfig::default();
        for pair in args.split(',') {
            let mut it = pair.splitn(2, '=');
            let (Some(key), Some(value)) = (it.next(), it.next()) else {
                continue;
            };
            match key.trim() {
                "mode" => {
                    cfg.mode = match value.trim() {
                        "connect" => Mode::Connect,
                        "listen" => Mode::Listen,
                        _ => cfg.mode,
                    };
                }
                "addr" => cfg.addr = value.trim().to_string(),
                "encryption" => {
                    cfg.encryption_enabled = value.trim() != "off" && value.trim() != "0";
                }
                "aux_buffer_cap" => {
                    if let Ok(v) = value.trim().parse() {
                        cfg.aux_buffer_cap = v;
                    }
                }
                "salt_seed" => {
                    if let Ok(v) = value.trim().parse() {
                        cfg.salt_seed = v;
                    }
                }
                _ => {}
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DmsgConfig::default();
        assert_eq!(cfg.mode, Mode::Listen);
        assert!(!cfg.encryption_enabled);
    }

    #[test]
    fn parses_recognized_keys_and_ignores_unknown_ones() {
        let cfg = DmsgConfig::from_args("mode=connect,addr=10.0.0.1:9000,bogus=1,encryption=on");
        assert_eq!(cfg.mode, Mode::Connect);
        assert_eq!(cfg.addr, "10.0.0.1:9000");
        assert!(cfg.encryption_enabled);
    }

    #[test]
    fn malformed_pairs_are_skipped_without_panicking() {
        let cfg = DmsgConfig::from_args("mode,=5,,addr=host:1");
        assert_eq!(cfg.addr, "host:1");
    }
}
