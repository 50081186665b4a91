use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::trace;

/// Everything the control loop reacts to: transport commands from the UI
/// shell and ticks from the refresh timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    /// Time to run the video refresh step.
    Refresh,
    TogglePause,
    /// Seek relative to the master clock, in seconds.
    SeekBy(f64),
    Quit,
}

enum TimerCmd {
    FireAt(Instant),
    Shutdown,
}

/// One-shot rearm timer that posts [`PlayerEvent::Refresh`] into the control
/// loop. A newer schedule supersedes a pending one, which is exactly what
/// the refresh scheduler wants: only the latest computed delay matters.
///
/// The timer thread owns nothing but its two channel ends; it can never
/// deadlock against the pipeline.
pub struct RefreshTimer {
    tx: flume::Sender<TimerCmd>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RefreshTimer {
    pub fn spawn(events: flume::Sender<PlayerEvent>) -> Self {
        let (tx, rx) = flume::unbounded::<TimerCmd>();
        let handle = thread::Builder::new()
            .name("refresh-timer".into())
            .spawn(move || run_timer(&rx, &events))
            .expect("failed to spawn refresh timer thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Arms (or re-arms) the timer to fire `delay_ms` from now.
    pub fn schedule(&self, delay_ms: u64) {
        trace!(delay_ms, "refresh scheduled");
        let _ = self
            .tx
            .send(TimerCmd::FireAt(Instant::now() + Duration::from_millis(delay_ms)));
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(TimerCmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(rx: &flume::Receiver<TimerCmd>, events: &flume::Sender<PlayerEvent>) {
    let mut deadline: Option<Instant> = None;
    loop {
        match deadline {
            None => match rx.recv() {
                Ok(TimerCmd::FireAt(at)) => deadline = Some(at),
                Ok(TimerCmd::Shutdown) | Err(_) => return,
            },
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    deadline = None;
                    if events.send(PlayerEvent::Refresh).is_err() {
                        return;
                    }
                    continue;
                }
                match rx.recv_timeout(at - now) {
                    Ok(TimerCmd::FireAt(newer)) => deadline = Some(newer),
                    Ok(TimerCmd::Shutdown) => return,
                    Err(flume::RecvTimeoutError::Timeout) => {
                        deadline = None;
                        if events.send(PlayerEvent::Refresh).is_err() {
                            return;
                        }
                    }
                    Err(flume::RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_the_requested_delay() {
        let (events_tx, events_rx) = flume::unbounded();
        let mut timer = RefreshTimer::spawn(events_tx);
        let start = Instant::now();
        timer.schedule(20);
        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("refresh should fire");
        assert_eq!(event, PlayerEvent::Refresh);
        assert!(start.elapsed() >= Duration::from_millis(15));
        timer.shutdown();
    }

    #[test]
    fn newer_schedule_supersedes_pending_one() {
        let (events_tx, events_rx) = flume::unbounded();
        let mut timer = RefreshTimer::spawn(events_tx);
        timer.schedule(400);
        timer.schedule(20);
        let start = Instant::now();
        events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("superseding schedule should fire");
        assert!(start.elapsed() < Duration::from_millis(300));
        // the 400 ms schedule must not fire a second event
        assert!(
            events_rx.recv_timeout(Duration::from_millis(500)).is_err(),
            "superseded schedule fired anyway"
        );
        timer.shutdown();
    }

    #[test]
    fn shutdown_stops_pending_fire() {
        let (events_tx, events_rx) = flume::unbounded();
        let mut timer = RefreshTimer::spawn(events_tx);
        timer.schedule(50);
        timer.shutdown();
        assert!(events_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
