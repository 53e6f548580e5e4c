//! Fixture worker binary for integration tests
//!
//! This binary implements a minimal worker that speaks the `id`/`reply_to`
//! JSON-line RPC envelope, used exclusively by integration tests to
//! exercise `ManagedProcess`/`WorkerGroup` without requiring a real
//! long-lived worker program.
//!
//! # RPC transport selection
//!
//! If `RPC_SOCKET_FD` is set, RPC is carried over that inherited duplex
//! socket and stdout/stderr are free for log lines. Otherwise RPC is
//! carried over stdin/stdout.
//!
//! # Handled actions
//!
//! - `add` -- responds with `result: a + b`.
//! - `notify_progress` -- emits `count` (default 3) progress notifications
//!   with `percent` values evenly spaced up to 100, then responds `status:
//!   "done"`.
//! - `hang` -- never responds; used to exercise request timeouts.
//! - `emit_logs` -- writes one line to the real process stdout and one to
//!   stderr (meaningful only in `socket-rpc` mode, where stdout/stderr are
//!   not the RPC wire), then responds `status: "ok"`.
//! - `__shutdown__` -- responds `status: "shutting_down"` and exits, unless
//!   `FIXTURE_IGNORE_SIGNALS` is set, in which case it is silently ignored.
//! - anything else -- responds with an `error` field.
//!
//! # Environment knobs
//!
//! - `FIXTURE_IGNORE_SIGNALS=1` -- installs `SIG_IGN` for `SIGTERM` and
//!   ignores the `__shutdown__` handshake, so only `SIGKILL` terminates the
//!   process. Exercises `ManagedProcess::stop`'s full three-phase escalation.
//! - `FIXTURE_EXIT_AFTER_MS` + `FIXTURE_EXIT_CODE` -- spawns a background
//!   thread that exits the process with the given code after the given
//!   delay, independent of the RPC loop. Exercises `WorkerGroup` fail-fast.

use std::io::{self, BufRead, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

fn main() {
    if std::env::var("FIXTURE_IGNORE_SIGNALS").is_ok() {
        // SAFETY: installing SIG_IGN for SIGTERM at startup, before any
        // other signal-sensitive state exists.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    let should_self_destruct = match (
        std::env::var("FIXTURE_FAIL_INDEX"),
        std::env::var("WORKER_INDEX"),
    ) {
        (Ok(fail_index), Ok(worker_index)) => fail_index == worker_index,
        (Err(_), Ok(_)) => false,
        (Err(_), Err(_)) => std::env::var("FIXTURE_EXIT_AFTER_MS").is_ok(),
        _ => false,
    };
    if should_self_destruct {
        if let (Ok(delay_ms), Ok(code)) = (
            std::env::var("FIXTURE_EXIT_AFTER_MS").unwrap_or_default().parse::<u64>(),
            std::env::var("FIXTURE_EXIT_CODE").unwrap_or_default().parse::<i32>(),
        ) {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay_ms));
                std::process::exit(code);
            });
        }
    }

    let socket_fd: Option<RawFd> = std::env::var("RPC_SOCKET_FD")
        .ok()
        .and_then(|s| s.parse().ok());

    let (mut reader, mut writer): (Box<dyn BufRead>, Box<dyn Write>) = match socket_fd {
        Some(fd) => {
            // SAFETY: `fd` was handed to us by the parent via
            // `RPC_SOCKET_FD`; it names a socket we now own exclusively.
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            let write_half = stream.try_clone().expect("clone RPC socket for writing");
            (
                Box::new(io::BufReader::new(stream)),
                Box::new(write_half),
            )
        }
        None => (
            Box::new(io::BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        ),
    };

    let ignore_signals = std::env::var("FIXTURE_IGNORE_SIGNALS").is_ok();
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).unwrap_or(0);
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => continue,
        };
        handle_request(&request, writer.as_mut(), ignore_signals);
    }
}

fn handle_request(request: &serde_json::Value, writer: &mut dyn Write, ignore_signals: bool) {
    let id = request.get("id").and_then(|v| v.as_str()).map(String::from);
    let action = request.get("action").and_then(|v| v.as_str()).unwrap_or("");

    match action {
        "__shutdown__" => {
            if ignore_signals {
                return;
            }
            if let Some(id) = &id {
                send_line(writer, &serde_json::json!({"reply_to": id, "status": "shutting_down"}));
            }
            std::process::exit(0);
        }
        "add" => {
            let a = request.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = request.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            if let Some(id) = &id {
                send_line(writer, &serde_json::json!({"reply_to": id, "result": a + b}));
            }
        }
        "notify_progress" => {
            let count = request.get("count").and_then(|v| v.as_u64()).unwrap_or(3).max(1);
            for i in 0..count {
                let percent = (100 * (i + 1) + count / 2) / count;
                send_line(writer, &serde_json::json!({"percent": percent}));
            }
            if let Some(id) = &id {
                send_line(writer, &serde_json::json!({"reply_to": id, "status": "done"}));
            }
        }
        "hang" => {
            // Intentionally never respond.
        }
        "emit_logs" => {
            println!("stdout line 1");
            let _ = io::stdout().flush();
            eprintln!("stderr line 1");
            let _ = io::stderr().flush();
            if let Some(id) = &id {
                send_line(writer, &serde_json::json!({"reply_to": id, "status": "ok"}));
            }
        }
        other => {
            if let Some(id) = &id {
                send_line(
                    writer,
                    &serde_json::json!({"reply_to": id, "error": format!("unknown action: {other}")}),
                );
            }
        }
    }
}

fn send_line(writer: &mut dyn Write, value: &serde_json::Value) {
    if writeln!(writer, "{}", value).is_err() {
        return;
    }
    let _ = writer.flush();
}
