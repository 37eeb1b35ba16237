// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `rpmsgctl`: inspect core profiles and validate layout files.

use std::fmt::Write as _;

use crate::channel::DispatchMode;
use crate::config::Config;
use crate::link::{IrqStyle, RemoteCore};

/// Returns the CLI usage string.
pub fn help() -> &'static str {
    "rpmsgctl inspects rpmsg links. Usage: rpmsgctl [--help] | profiles | layout <file.toml>"
}

/// Executes the CLI using provided arguments.
pub fn execute(args: &[&str]) -> String {
    match args {
        [] => help().to_string(),
        _ if args.contains(&"--help") => help().to_string(),
        ["profiles"] => profiles(),
        ["layout", path] => match Config::load(path) {
            Ok(config) => layout(&config),
            Err(err) => format!("error: {err}"),
        },
        _ => format!("error: unrecognised arguments {args:?}\n{}", help()),
    }
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

fn profiles() -> String {
    let mut out = String::new();
    for core in RemoteCore::ALL {
        let p = core.profile();
        let irq = match p.irq {
            IrqStyle::SetClear => "sb2",
            IrqStyle::Direct => "ve3",
        };
        let notify = p.notify.map_or_else(|| "-".to_string(), |n| format!("+{}", n.word));
        let _ = writeln!(
            out,
            "{:<10} order={:?} layout={:?} sync=+{} notify={} irq={irq}/{:#x}",
            p.name,
            p.order,
            p.layout,
            p.sync_flag,
            notify,
            p.to_bit.bits()
        );
    }
    out.pop();
    out
}

fn layout(config: &Config) -> String {
    let mut out = String::new();
    let r = &config.region;
    let _ = writeln!(out, "region {:#010x}+{:#x} ipc {:#010x}", r.phys_base, r.size, r.ipc_base());
    for link in &config.links {
        let params = link.params();
        let _ = writeln!(
            out,
            "{} handshake={} hwlock={} channels={}",
            link.core,
            if params.skip_handshake {
                "skip".to_string()
            } else {
                format!("{}x{:?}", params.handshake_polls, params.handshake_interval)
            },
            link.hwlock,
            link.channels.len()
        );
        for ch in &link.channels {
            let mode = ch.dispatch.unwrap_or_else(|| DispatchMode::for_channel_name(&ch.name));
            let _ = writeln!(
                out,
                "  {} [{mode}] tx {:#010x}@{:#010x} rx {:#010x}@{:#010x} size {:#x}",
                ch.name, ch.tx_fifo, ch.tx_header, ch.rx_fifo, ch.rx_header, ch.size
            );
        }
    }
    out.pop();
    out
}

#[cfg(test)]
mod tests {
    use super::{execute, help};

    #[test]
    fn help_contains_name() {
        assert!(help().contains("rpmsgctl"));
        assert_eq!(execute(&["--help"]), help());
    }

    #[test]
    fn profiles_lists_every_core() {
        let out = execute(&["profiles"]);
        assert_eq!(out.lines().count(), 6);
        assert!(out.contains("ve3-rpc"));
        assert!(out.contains("irq=ve3/0x1"));
    }

    #[test]
    fn unknown_arguments_are_reported() {
        assert!(execute(&["frobnicate"]).starts_with("error:"));
        assert!(execute(&["layout", "/nonexistent/rpmsg.toml"]).starts_with("error:"));
    }
}
