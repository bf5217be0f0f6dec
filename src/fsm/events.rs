//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Events and the bounded event queue driving the shot state machine.
//!

use crate::ball::Ball;
use crate::ipc::ControlMessageKind;
use image::RgbImage;
use std::sync::Arc;

pub const MAX_QUEUE_SIZE: usize = 20;

#[derive(Clone, Debug)]
pub enum Event {
    Restart,
    BeginWaitingForSimulatorArmed,
    BeginWaitingForBallPlaced,
    /// Fired by the stabilization timer.
    CheckForBallStable,
    BallStabilized(Ball),
    BeginWatchingForBallHit,
    BallHit(Ball, Arc<RgbImage>),
    Camera2PreImageReceived(Arc<RgbImage>),
    Camera2ImageReceived(Arc<RgbImage>),
    /// Cam2 side: the arm request from cam1 arrived.
    ArmCamera2Received,
    /// Fired by the cam2-image watchdog timer.
    CheckForCam2ImageReceived,
    ControlMessage(ControlMessageKind),
    Exit
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Restart => "Restart",
            Event::BeginWaitingForSimulatorArmed => "BeginWaitingForSimulatorArmed",
            Event::BeginWaitingForBallPlaced => "BeginWaitingForBallPlaced",
            Event::CheckForBallStable => "CheckForBallStable",
            Event::BallStabilized(_) => "BallStabilized",
            Event::BeginWatchingForBallHit => "BeginWatchingForBallHit",
            Event::BallHit(..) => "BallHit",
            Event::Camera2PreImageReceived(_) => "Camera2PreImageReceived",
            Event::Camera2ImageReceived(_) => "Camera2ImageReceived",
            Event::ArmCamera2Received => "ArmCamera2Received",
            Event::CheckForCam2ImageReceived => "CheckForCam2ImageReceived",
            Event::ControlMessage(_) => "ControlMessage",
            Event::Exit => "Exit"
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Event::Exit)
    }
}

/// FIFO queue, bounded so a stuck consumer surfaces quickly. Timer threads and the
/// broker receive thread post; the single state-machine worker drains.
#[derive(Clone)]
pub struct EventQueue {
    sender: crossbeam::channel::Sender<Event>,
    receiver: crossbeam::channel::Receiver<Event>
}

impl EventQueue {
    pub fn new() -> EventQueue {
        let (sender, receiver) = crossbeam::channel::bounded(MAX_QUEUE_SIZE);
        EventQueue{ sender, receiver }
    }

    /// Enqueues without blocking; a full queue drops the event (and logs it loudly,
    /// since that means the worker has wedged).
    pub fn post(&self, event: Event) -> bool {
        log::trace!("queueing event {}", event.name());
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(crossbeam::channel::TrySendError::Full(event)) => {
                log::error!("event queue full; dropping {}", event.name());
                false
            },
            Err(crossbeam::channel::TrySendError::Disconnected(_)) => false
        }
    }

    /// Blocks up to `timeout`; `None` when nothing arrived.
    pub fn dequeue(&self, timeout: std::time::Duration) -> Option<Event> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = EventQueue::new();
        queue.post(Event::Restart);
        queue.post(Event::BeginWaitingForBallPlaced);
        queue.post(Event::CheckForBallStable);

        assert!(matches!(queue.dequeue(Duration::from_millis(10)), Some(Event::Restart)));
        assert!(matches!(queue.dequeue(Duration::from_millis(10)), Some(Event::BeginWaitingForBallPlaced)));
        assert!(matches!(queue.dequeue(Duration::from_millis(10)), Some(Event::CheckForBallStable)));
        assert!(queue.dequeue(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let queue = EventQueue::new();
        for _ in 0..MAX_QUEUE_SIZE {
            assert!(queue.post(Event::Restart));
        }
        assert!(!queue.post(Event::Exit));
        assert_eq!(queue.len(), MAX_QUEUE_SIZE);
    }

    #[test]
    fn shutdown_classification() {
        assert!(Event::Exit.is_shutdown());
        assert!(!Event::Restart.is_shutdown());
    }
}
