//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Timer.
//!

const INFINITY: std::time::Duration = std::time::Duration::from_secs(9_999_999_999);

enum TimerMsg {
    Schedule(std::time::Instant, Box<dyn FnOnce() + Send>),
    Stop
}

/// One-shot timer backed by a dedicated sleeping thread; scheduling a new run cancels
/// any pending one. The handler runs on the timer thread (ours only ever enqueue a
/// single event).
pub struct OneShotTimer {
    sender: std::sync::mpsc::Sender<TimerMsg>
}

impl OneShotTimer {
    pub fn new() -> OneShotTimer {
        let (sender, receiver) = std::sync::mpsc::channel::<TimerMsg>();

        std::thread::spawn(move || {
            let mut pending: Option<(std::time::Instant, Box<dyn FnOnce() + Send>)> = None;

            loop {
                let recv_result = match &pending {
                    Some((target_time, _)) => {
                        let now = std::time::Instant::now();
                        if *target_time > now {
                            receiver.recv_timeout(*target_time - now)
                        } else {
                            // already due; fire on the next timeout check
                            receiver.recv_timeout(std::time::Duration::from_millis(0))
                        }
                    },
                    None => receiver.recv_timeout(INFINITY)
                };

                match recv_result {
                    Ok(TimerMsg::Schedule(target_time, handler)) => {
                        pending = Some((target_time, handler));
                    },

                    Ok(TimerMsg::Stop) => {
                        pending = None;
                    },

                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if let Some((_, handler)) = pending.take() {
                            handler();
                        }
                    },

                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break
                }
            }
        });

        OneShotTimer{ sender }
    }

    /// Runs `handler` once after `delay`; any previously scheduled runs are cancelled.
    pub fn run_once<F: FnOnce() + Send + 'static>(&self, delay: std::time::Duration, handler: F) {
        let _ = self.sender.send(TimerMsg::Schedule(
            std::time::Instant::now() + delay,
            Box::new(handler)
        ));
    }

    pub fn stop(&self) {
        let _ = self.sender.send(TimerMsg::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ms(num_millis: u64) -> std::time::Duration {
        std::time::Duration::from_millis(num_millis)
    }

    #[test]
    fn timer_fires_once_after_delay() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_c = fired.clone();
        let tstart = std::time::Instant::now();
        timer.run_once(ms(100), move || {
            assert!(tstart.elapsed() >= ms(90));
            fired_c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(ms(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rescheduling_cancels_previous_run() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_a = fired.clone();
        timer.run_once(ms(100), move || { fired_a.fetch_add(100, Ordering::SeqCst); });

        std::thread::sleep(ms(30));

        let fired_b = fired.clone();
        timer.run_once(ms(100), move || { fired_b.fetch_add(1, Ordering::SeqCst); });

        std::thread::sleep(ms(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_prevents_firing() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_c = fired.clone();
        timer.run_once(ms(80), move || { fired_c.fetch_add(1, Ordering::SeqCst); });

        std::thread::sleep(ms(20));
        timer.stop();

        std::thread::sleep(ms(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
