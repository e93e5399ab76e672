//! Line-based operator commands and the status ticker.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use deskrec::merge::MergeOutcome;
use deskrec::session::format_elapsed;
use deskrec::{log_debug, RecorderError, SegmentSession, SessionState};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

const STATUS_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    TogglePause,
    Stop,
}

pub(crate) fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "p" | "pause" | "r" | "resume" => Some(Command::TogglePause),
        "s" | "q" | "stop" | "quit" => Some(Command::Stop),
        _ => None,
    }
}

/// Read stdin lines into commands. EOF counts as stop so a closed pipe
/// never leaves a recording running.
pub(crate) fn spawn_command_thread(tx: Sender<Command>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    log_debug(&format!("stdin read error: {err}"));
                    break;
                }
            };
            match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!(
                    "\nUnknown command '{}'; use p (pause/resume) or s (stop)",
                    line.trim()
                ),
            }
        }
        let _ = tx.send(Command::Stop);
    })
}

fn print_status(session: &SegmentSession) {
    let marker = match session.state() {
        SessionState::Recording => "REC",
        SessionState::Paused => "PAUSED",
        SessionState::Stopped => "STOPPED",
    };
    print!(
        "\r[{marker}] {}  segments: {}   ",
        format_elapsed(session.elapsed()),
        session.segments().len()
    );
    let _ = io::stdout().flush();
}

fn toggle(session: &mut SegmentSession) -> Result<(), RecorderError> {
    match session.state() {
        SessionState::Recording => session.pause(),
        SessionState::Paused => session.resume(),
        SessionState::Stopped => Ok(()),
    }
}

/// Drive the session from operator commands until stop, then merge.
pub(crate) fn run(
    session: &mut SegmentSession,
    commands: &Receiver<Command>,
) -> Result<MergeOutcome, RecorderError> {
    loop {
        print_status(session);
        match commands.recv_timeout(STATUS_TICK) {
            Ok(Command::TogglePause) => {
                if let Err(err) = toggle(session) {
                    eprintln!("\n{err}");
                    if !err.is_device_error() {
                        log_debug(&format!("toggle failed: {err}"));
                    }
                }
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    println!("\nStopping and merging segments...");
    session.stop()
}
