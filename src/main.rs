use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jamsync::clock::SystemWallClock;
use jamsync::config::SessionConfig;
use jamsync::controller::SessionController;
use jamsync::engine::MonotonicEngine;
use jamsync::logging::{LogHistory, LogObserver, ObservedLogger};
use jamsync::media::DetachedMedia;
use jamsync::metronome::MetronomeCommand;
use jamsync::net::{TcpSignaling, DEFAULT_PORT};

type Session = SessionController<TcpSignaling, MonotonicEngine, DetachedMedia, SystemWallClock>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared click track for a networked jam session", long_about = None)]
struct Args {
    /// Room server address (host:port)
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Room to join
    #[arg(short, long, default_value = "default")]
    room: String,

    /// JSON session config (defaults apply to anything missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a JSON status snapshot here every status interval
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Click sample to load instead of the built-in click
    #[arg(long)]
    click_sample: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum UserCommand {
    Metronome(MetronomeCommand),
    Resume,
    Volume(String, u8),
    Mute(String, bool),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<UserCommand>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let number = |what: &str| -> Result<u64> {
        arg.ok_or_else(|| anyhow!("'{}' needs a {}", word, what))?
            .parse::<u64>()
            .map_err(|e| anyhow!("Bad {} for '{}': {}", what, word, e))
    };

    let cmd = match word.to_lowercase().as_str() {
        "start" => UserCommand::Metronome(MetronomeCommand::Start),
        "stop" => UserCommand::Metronome(MetronomeCommand::Stop),
        "tempo" => {
            let bpm = u16::try_from(number("tempo")?).map_err(|_| anyhow!("Tempo out of range"))?;
            UserCommand::Metronome(MetronomeCommand::ChangeTempo(bpm))
        }
        "meter" => {
            let beats = u8::try_from(number("beat count")?).map_err(|_| anyhow!("Meter out of range"))?;
            UserCommand::Metronome(MetronomeCommand::ChangeMeter(beats))
        }
        "resume" => UserCommand::Resume,
        "volume" => {
            let participant = arg.ok_or_else(|| anyhow!("'volume' needs a participant"))?;
            let level: u8 = words
                .next()
                .ok_or_else(|| anyhow!("'volume' needs a level 0-100"))?
                .parse()
                .map_err(|e| anyhow!("Bad volume: {}", e))?;
            if level > 100 {
                return Err(anyhow!("Volume must be 0-100"));
            }
            UserCommand::Volume(participant.to_string(), level)
        }
        "mute" | "unmute" => {
            let participant = arg.ok_or_else(|| anyhow!("'{}' needs a participant", word))?;
            UserCommand::Mute(participant.to_string(), word.eq_ignore_ascii_case("mute"))
        }
        "status" => UserCommand::Status,
        "quit" | "exit" => UserCommand::Quit,
        other => return Err(anyhow!("Unknown command '{}'", other)),
    };
    Ok(Some(cmd))
}

/// Returns false when the user asked to quit.
fn run_command(session: &mut Session, history: &LogHistory, cmd: UserCommand) -> bool {
    match cmd {
        UserCommand::Metronome(m) => {
            if let Err(e) = session.command(m) {
                warn!("{}", e);
            }
        }
        UserCommand::Resume => match session.user_resume_audio() {
            Ok(()) => info!("Audio output running"),
            Err(e) => error!("Could not resume audio: {}", e),
        },
        UserCommand::Volume(participant, level) => match session.set_volume(&participant, level) {
            Ok(true) => info!("Volume for {} set to {}", participant, level),
            Ok(false) => warn!("No stream from {}", participant),
            Err(e) => warn!("Volume change failed: {}", e),
        },
        UserCommand::Mute(participant, muted) => match session.set_muted(&participant, muted) {
            Ok(true) => info!("{} {}", if muted { "Muted" } else { "Unmuted" }, participant),
            Ok(false) => warn!("No stream from {}", participant),
            Err(e) => warn!("Mute change failed: {}", e),
        },
        UserCommand::Status => {
            session.log_status();
            session.log_track_stats();
            let problems = history.problems();
            if problems > 0 {
                info!("[Status] {} recent warning(s) or error(s)", problems);
            }
        }
        UserCommand::Quit => return false,
    }
    true
}

fn main() -> Result<()> {
    let history = Arc::new(LogHistory::new(100));
    ObservedLogger::install(vec![history.clone() as Arc<dyn LogObserver>])?;
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let signaling = TcpSignaling::connect(&args.server)?;
    let engine = MonotonicEngine::new(args.click_sample.clone());
    let status_interval = Duration::from_millis(config.status.interval_ms);
    let mut session = SessionController::new(signaling, engine, DetachedMedia::default(), SystemWallClock, config, &args.room);
    session.join()?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    info!("Commands: start | stop | tempo N | meter N | resume | volume <participant> N | mute|unmute <participant> | status | quit");

    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Err(e) = session.process_loop_iteration() {
            error!("Session ended: {:#}", e);
            break;
        }

        loop {
            match rx.try_recv() {
                Ok(line) => match parse_command(&line) {
                    Ok(Some(cmd)) => {
                        if !run_command(&mut session, &history, cmd) {
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // stdin closed; keep running until Ctrl+C.
                    break;
                }
            }
        }

        session.audio_mut().render();

        if last_status.elapsed() >= status_interval {
            session.log_status();
            if let Some(path) = &args.status_file {
                if let Err(e) = session.status().write_to(path) {
                    warn!("Failed to write status file: {}", e);
                }
            }
            last_status = Instant::now();
        }

        thread::sleep(Duration::from_millis(1));
    }

    session.shutdown();
    session.audio_mut().close();
    info!("Exiting.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metronome_commands() {
        assert_eq!(
            parse_command("start").unwrap(),
            Some(UserCommand::Metronome(MetronomeCommand::Start))
        );
        assert_eq!(
            parse_command("  TEMPO 96 ").unwrap(),
            Some(UserCommand::Metronome(MetronomeCommand::ChangeTempo(96)))
        );
        assert_eq!(
            parse_command("meter 3").unwrap(),
            Some(UserCommand::Metronome(MetronomeCommand::ChangeMeter(3)))
        );
        assert_eq!(parse_command("").unwrap(), None);
    }

    #[test]
    fn test_parse_volume() {
        assert_eq!(
            parse_command("volume bob 40").unwrap(),
            Some(UserCommand::Volume("bob".into(), 40))
        );
        assert!(parse_command("volume bob 140").is_err());
        assert!(parse_command("volume bob").is_err());
    }

    #[test]
    fn test_parse_mute() {
        assert_eq!(
            parse_command("mute bob").unwrap(),
            Some(UserCommand::Mute("bob".into(), true))
        );
        assert_eq!(
            parse_command("UNMUTE bob").unwrap(),
            Some(UserCommand::Mute("bob".into(), false))
        );
        assert!(parse_command("mute").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_command("tempo").is_err());
        assert!(parse_command("tempo fast").is_err());
        assert!(parse_command("tempo 70000").is_err());
        assert!(parse_command("dance").is_err());
    }
}
