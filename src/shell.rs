//! Line commands that drive the FOTA module from a console.

use std::fmt::Write;
use std::time::Duration;

use crate::fota::{Fota, FotaError, FotaParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStatus {
    Ok,
    UnknownArgs,
    Error,
    UnknownCommand,
}

type Handler = fn(&Fota, &[&str], &mut String) -> ShellStatus;

pub struct ShellCommand {
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
    handler: Handler,
}

pub const COMMANDS: &[ShellCommand] = &[
    ShellCommand {
        name: "fota_http",
        usage: "fota_http <server> <port> <uri>",
        help: "Run firmware update over HTTP",
        handler: fota_http,
    },
    ShellCommand {
        name: "fota_timer",
        usage: "fota_timer <delay_ms>",
        help: "Request an update every <delay_ms>",
        handler: fota_timer,
    },
    ShellCommand {
        name: "fota_skip",
        usage: "fota_skip",
        help: "Close the current round without downloading",
        handler: fota_skip,
    },
    ShellCommand {
        name: "fota_status",
        usage: "fota_status",
        help: "Show FOTA state, parameters and timer",
        handler: fota_status,
    },
    ShellCommand {
        name: "help",
        usage: "help",
        help: "List commands",
        handler: help,
    },
];

/// Run one command line. Output goes to `out`, one line per message.
pub fn execute(fota: &Fota, line: &str, out: &mut String) -> ShellStatus {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(name) = args.first() else {
        return ShellStatus::Ok;
    };

    match COMMANDS.iter().find(|command| command.name == *name) {
        Some(command) => (command.handler)(fota, &args, out),
        None => {
            let _ = writeln!(out, "Unknown command: {} (try 'help')", name);
            ShellStatus::UnknownCommand
        }
    }
}

fn fota_http(fota: &Fota, args: &[&str], out: &mut String) -> ShellStatus {
    if !fota.is_started() {
        let _ = writeln!(out, "FOTA module is not started");
        return ShellStatus::Error;
    }
    if args.len() < 4 {
        return ShellStatus::UnknownArgs;
    }

    let Ok(port) = args[2].parse::<u16>() else {
        let _ = writeln!(out, "Invalid server port");
        return ShellStatus::UnknownArgs;
    };
    let params = match FotaParameters::new(args[1], port, args[3]) {
        Ok(params) => params,
        Err(_) => {
            let _ = writeln!(out, "Server name or URI too long");
            return ShellStatus::UnknownArgs;
        }
    };

    let _ = writeln!(out, "*************** FOTA TEST ***************");
    if let Err(e) = fota.request_update(params) {
        match e {
            FotaError::Busy => {
                let _ = writeln!(out, "FOTA update already in progress");
            }
            e => {
                let _ = writeln!(out, "Failed to request FOTA update: {}", e);
            }
        }
        return ShellStatus::Error;
    }

    match fota.wait_for_completion() {
        Ok(()) => {
            let _ = writeln!(out, "*************** FOTA SHELL SUCCESS ******");
            ShellStatus::Ok
        }
        Err(e) => {
            let _ = writeln!(out, "*************** FOTA SHELL ERROR ({}) ***", e);
            ShellStatus::Error
        }
    }
}

fn fota_timer(fota: &Fota, args: &[&str], out: &mut String) -> ShellStatus {
    if !fota.is_started() {
        let _ = writeln!(out, "FOTA module is not started");
        return ShellStatus::Error;
    }
    let Some(delay_ms) = args.get(1).and_then(|arg| arg.parse::<u64>().ok()) else {
        return ShellStatus::UnknownArgs;
    };
    if delay_ms == 0 {
        return ShellStatus::UnknownArgs;
    }

    let armed = fota
        .set_timer(Duration::from_millis(delay_ms))
        .and_then(|_| fota.start_timer());
    match armed {
        Ok(()) => {
            let _ = writeln!(out, "FOTA timer armed: every {} ms", delay_ms);
            ShellStatus::Ok
        }
        Err(e) => {
            let _ = writeln!(out, "Failed to arm FOTA timer: {}", e);
            ShellStatus::Error
        }
    }
}

fn fota_skip(fota: &Fota, _args: &[&str], out: &mut String) -> ShellStatus {
    match fota.skip_update() {
        Ok(()) => ShellStatus::Ok,
        Err(e) => {
            let _ = writeln!(out, "Cannot skip: {}", e);
            ShellStatus::Error
        }
    }
}

fn fota_status(fota: &Fota, _args: &[&str], out: &mut String) -> ShellStatus {
    let params = fota.parameters();
    let _ = writeln!(out, "state:  {}", fota.state().as_str());
    let _ = writeln!(out, "server: {}:{}", params.server, params.port);
    let _ = writeln!(out, "uri:    {}", params.uri);
    match fota.timer_period() {
        Some(period) => {
            let _ = writeln!(
                out,
                "timer:  {} ms ({})",
                period.as_millis(),
                if fota.timer_running() { "running" } else { "stopped" }
            );
        }
        None => {
            let _ = writeln!(out, "timer:  not configured");
        }
    }
    ShellStatus::Ok
}

fn help(_fota: &Fota, _args: &[&str], out: &mut String) -> ShellStatus {
    for command in COMMANDS {
        let _ = writeln!(out, "{:<34} {}", command.usage, command.help);
    }
    ShellStatus::Ok
}
