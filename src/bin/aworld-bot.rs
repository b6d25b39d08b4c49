//! AWorld Bot
//!
//! Headless clients driving the full client stack against a server.
//! Each bot walks a fixed pattern, jumps now and then, and reports its
//! reconciliation statistics.
//!
//! Environment:
//! - `AWORLD_URL`: server URL (default `ws://127.0.0.1:8000`)
//! - `AWORLD_BOTS`: number of bots (default 1)
//! - `AWORLD_BOT_SECONDS`: run time, 0 runs until ctrl-c (default 0)

use std::time::Duration;
use anyhow::Context;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aworld::{
    Action,
    client::{ClientConfig, ClientSession, ConnectionStatus, Transport, TransportEvent},
    core::clock::now_millis,
};

const FRAME: Duration = Duration::from_millis(16);
const REPORT_EVERY: Duration = Duration::from_secs(5);
const LEG: Duration = Duration::from_secs(2);

/// Walking pattern: one leg per entry, repeated.
const PATTERN: [(Action, i32); 4] = [
    (Action::Forward, 0),
    (Action::Left, 6),
    (Action::Backward, -3),
    (Action::Right, 9),
];

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {}: {}", key, value)),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url: String = env_or("AWORLD_URL", "ws://127.0.0.1:8000".to_string())?;
    let bots: usize = env_or("AWORLD_BOTS", 1)?;
    let seconds: u64 = env_or("AWORLD_BOT_SECONDS", 0)?;
    let run_for = (seconds > 0).then(|| Duration::from_secs(seconds));

    info!("Starting {} bot(s) against {}", bots, url);

    let mut tasks = Vec::with_capacity(bots);
    for index in 0..bots {
        let config = ClientConfig {
            url: url.clone(),
            name: format!("bot-{}", index),
            color: format!("#{:06x}", (index as u32).wrapping_mul(0x2f_4a_91) & 0xff_ff_ff),
            ..Default::default()
        };
        tasks.push(tokio::spawn(run_bot(index, config, run_for)));
    }

    let all = futures_util::future::join_all(tasks);
    tokio::select! {
        results = all => {
            for result in results {
                result.context("bot task panicked")??;
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    Ok(())
}

async fn run_bot(index: usize, config: ClientConfig, run_for: Option<Duration>) -> anyhow::Result<()> {
    let mut transport = Transport::connect(config.url.clone(), config.reconnect);
    let ping_interval = config.ping_interval;
    let mut session = ClientSession::new(config);

    let started = Instant::now();
    let mut frames = interval(FRAME);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_frame = Instant::now();
    let mut last_ping = Instant::now();
    let mut last_report = Instant::now();
    let mut leg = usize::MAX;

    loop {
        tokio::select! {
            event = transport.next_event() => match event {
                Some(TransportEvent::Connected) => {
                    let join = session.on_connected();
                    transport.send(&join)?;
                    leg = usize::MAX;
                }
                Some(TransportEvent::Message(message)) => {
                    session.handle(message, now_millis());
                }
                Some(TransportEvent::Disconnected) => session.on_disconnected(),
                Some(TransportEvent::Failed(e)) => {
                    session.on_failed();
                    return Err(e).with_context(|| format!("bot-{} lost the server", index));
                }
                None => return Ok(()),
            },
            _ = frames.tick() => {
                let now = now_millis();
                let elapsed = started.elapsed();

                if matches!(session.status(), ConnectionStatus::Joined(_)) {
                    // Switch legs, offset per bot so they spread out
                    let current = (elapsed.as_millis() / LEG.as_millis()) as usize + index;
                    if current != leg {
                        if leg != usize::MAX {
                            session.release(PATTERN[leg % PATTERN.len()].0);
                        }
                        let (action, turn) = PATTERN[current % PATTERN.len()];
                        session.press(action, now);
                        session.rotate(turn);
                        if current % 3 == 0 {
                            session.press(Action::Jump, now);
                            session.release(Action::Jump);
                        }
                        leg = current;
                    }

                    if let Some(input) = session.tick_input(now) {
                        if let Err(e) = transport.send(&input) {
                            warn!("bot-{}: input dropped: {}", index, e);
                        }
                    }
                    if last_ping.elapsed() >= ping_interval {
                        last_ping = Instant::now();
                        let _ = transport.send(&session.ping_message(now));
                    }
                }

                let frame_dt = last_frame.elapsed().as_secs_f64();
                last_frame = Instant::now();
                session.frame(frame_dt, now);

                if last_report.elapsed() >= REPORT_EVERY {
                    last_report = Instant::now();
                    report(index, &session);
                }

                if run_for.map_or(false, |limit| elapsed >= limit) {
                    report(index, &session);
                    transport.close();
                    return Ok(());
                }
            }
        }
    }
}

fn report(index: usize, session: &ClientSession) {
    let stats = session.reconcile_stats();
    info!(
        "bot-{}: {:?}, {} players, rtt {:.1}ms, delay {:.0}ms, pending {}, accepted {}, soft {}, snaps {}, mean error {:.4}",
        index,
        session.status(),
        session.player_count(),
        session.rtt_ms().unwrap_or(0.0),
        session.interpolation_delay_ms(),
        session.pending_inputs(),
        stats.accepted,
        stats.soft,
        stats.snaps,
        stats.mean_error(),
    );
}
