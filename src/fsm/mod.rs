//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Shot state machines for the two per-camera hosts.
//!
//! Each host runs a single worker thread that drains the bounded event queue; timer
//! threads and the broker receive thread only ever enqueue events.
//!

pub mod events;

use crate::ball::{Ball, ClubType, GolferOrientation};
use crate::camera::{CameraError, FrameSource, TriggeredFrameSource};
use crate::config::Configuration;
use crate::detector::motion::MotionDetector;
use crate::imgproc;
use crate::ipc::{Broker, ControlMessageKind, ImagePayload, IpcError, IpcMessage, StatusKind};
use crate::logging::RecentMessages;
use crate::output::{AdapterRegistry, ShotResult};
use crate::output::shot_log::ShotLog;
use crate::shot::ShotAnalyzer;
use crate::strobe::PulseGenerator;
use crate::timer::OneShotTimer;
use events::{Event, EventQueue};
use image::RgbImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const WAIT_FOR_BALL_PAUSE_MS: u64 = 500;
const WATCH_FOR_HIT_TIMEOUT_SECS: u64 = 120;
const ARM_POLL_PAUSE_MS: u64 = 1000;

pub enum Cam1State {
    Initializing,
    WaitingForSimulatorArmed,
    WaitingForBall,
    WaitingForBallStabilization{ ball: Ball, image: Arc<RgbImage> },
    WaitingForCamera2PreImage{ ball: Ball, image: Arc<RgbImage> },
    WaitingForBallHit{ ball: Ball, image: Arc<RgbImage>, pre_image: Option<Arc<RgbImage>> },
    BallHitNowWaitingForCam2Image{ ball: Ball, image: Arc<RgbImage>, pre_image: Option<Arc<RgbImage>> },
    Exiting
}

impl Cam1State {
    pub fn name(&self) -> &'static str {
        match self {
            Cam1State::Initializing => "Initializing",
            Cam1State::WaitingForSimulatorArmed => "WaitingForSimulatorArmed",
            Cam1State::WaitingForBall => "WaitingForBall",
            Cam1State::WaitingForBallStabilization{ .. } => "WaitingForBallStabilization",
            Cam1State::WaitingForCamera2PreImage{ .. } => "WaitingForCamera2PreImage",
            Cam1State::WaitingForBallHit{ .. } => "WaitingForBallHit",
            Cam1State::BallHitNowWaitingForCam2Image{ .. } => "BallHitNowWaitingForCam2Image",
            Cam1State::Exiting => "Exiting"
        }
    }
}

/// The camera-1 host: watches the teed ball, drives the strobe, and runs the whole
/// post-hit analysis once camera 2's frame comes back.
pub struct Cam1Host {
    pub config: Arc<Configuration>,
    pub queue: EventQueue,
    pub running: Arc<AtomicBool>,
    camera: Box<dyn FrameSource>,
    strobe: PulseGenerator,
    broker: Arc<dyn Broker>,
    registry: AdapterRegistry,
    shot_log: ShotLog,
    recent: Arc<RecentMessages>,
    stabilization_timer: OneShotTimer,
    cam2_timer: OneShotTimer,
    pub club: ClubType,
    pub orientation: GolferOrientation,
    pub practice_ball: bool,
    pub external_strobe: bool,
    shot_counter: u64
}

impl Cam1Host {
    pub fn new(
        config: Arc<Configuration>,
        camera: Box<dyn FrameSource>,
        strobe: PulseGenerator,
        broker: Arc<dyn Broker>,
        registry: AdapterRegistry,
        running: Arc<AtomicBool>
    ) -> Cam1Host {
        let shot_log = ShotLog::new(config.simulators.shot_log_path.clone());
        Cam1Host{
            config,
            queue: EventQueue::new(),
            running,
            camera,
            strobe,
            broker,
            registry,
            shot_log,
            recent: Arc::new(RecentMessages::new()),
            stabilization_timer: OneShotTimer::new(),
            cam2_timer: OneShotTimer::new(),
            club: ClubType::Driver,
            orientation: GolferOrientation::RightHanded,
            practice_ball: false,
            external_strobe: false,
            shot_counter: 0
        }
    }

    pub fn shot_counter(&self) -> u64 {
        self.shot_counter
    }

    fn send_status(&self, status: StatusKind) {
        if let Err(e) = self.broker.send(IpcMessage::Status(status)) {
            log::warn!("failed to send status message: {:?}", e);
        }
    }

    fn send_error(&self, message: &str) {
        self.recent.push(message.to_string());
        let result = self.broker.send(IpcMessage::Error{
            message: message.to_string(),
            recent_log: self.recent.snapshot()
        });
        if let Err(e) = result {
            log::warn!("failed to send error message: {:?}", e);
        }
    }

    fn analyzer<'a>(&self, config: &'a Configuration) -> ShotAnalyzer<'a> {
        let mut analyzer = ShotAnalyzer::new(config);
        analyzer.club = self.club;
        analyzer.orientation = self.orientation;
        analyzer.practice_ball = self.practice_ball;
        analyzer.external_strobe = self.external_strobe;
        analyzer
    }

    /// Drains the queue until shutdown. Spawns the broker receive thread.
    pub fn run(mut self) {
        log::trace!("camera-1 host starting");
        self.send_status(StatusKind::Initializing);
        self.queue.post(Event::Restart);

        spawn_broker_receive_thread(self.broker.clone(), self.queue.clone(), self.running.clone(), true);

        let pause = Duration::from_millis(self.config.ipc.event_loop_pause_ms);
        let mut state = Cam1State::Initializing;

        while self.running.load(Ordering::SeqCst) {
            log::trace!("event queue size = {}", self.queue.len());
            let event = match self.queue.dequeue(pause) {
                Some(event) => event,
                None => continue
            };

            log::trace!("received event: {}", event.name());

            if event.is_shutdown() {
                log::trace!("----------- shutting down: received Exit -----------");
                state = Cam1State::Exiting;
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            if let Event::ControlMessage(kind) = event {
                self.handle_control_message(kind);
                continue;
            }

            state = self.handle_event(state, event);
            log::trace!("current state is: {}", state.name());
        }

        self.stabilization_timer.stop();
        self.cam2_timer.stop();
        log::trace!("camera-1 host exiting event loop in state {}", state.name());
    }

    fn handle_control_message(&mut self, kind: ControlMessageKind) {
        match kind {
            ControlMessageKind::ClubChangeToPutter => {
                log::info!("club changed to putter");
                self.club = ClubType::Putter;
            },
            ControlMessageKind::ClubChangeToDriver => {
                log::info!("club changed to driver");
                self.club = ClubType::Driver;
            }
        }
    }

    fn handle_event(&mut self, state: Cam1State, event: Event) -> Cam1State {
        match (state, event) {
            (_, Event::Restart) => {
                log::debug!("state transition: Restart received");
                self.send_status(StatusKind::Initializing);

                if self.registry.all_armed() {
                    self.queue.post(Event::BeginWaitingForBallPlaced);
                    Cam1State::WaitingForBall
                } else {
                    self.queue.post(Event::BeginWaitingForSimulatorArmed);
                    Cam1State::WaitingForSimulatorArmed
                }
            },

            (Cam1State::WaitingForSimulatorArmed, Event::BeginWaitingForSimulatorArmed) => {
                self.send_status(StatusKind::WaitingForSimulatorArmed);

                // don't spin too hard while polling
                std::thread::sleep(Duration::from_millis(ARM_POLL_PAUSE_MS));

                if self.registry.all_armed() {
                    self.queue.post(Event::BeginWaitingForBallPlaced);
                    Cam1State::WaitingForBall
                } else {
                    self.queue.post(Event::BeginWaitingForSimulatorArmed);
                    Cam1State::WaitingForSimulatorArmed
                }
            },

            (Cam1State::WaitingForBall, Event::BeginWaitingForBallPlaced) => {
                self.send_status(StatusKind::WaitingForBallToAppear);
                self.on_waiting_for_ball()
            },

            // cycled back to waiting while a stale watchdog reminder was in flight
            (Cam1State::WaitingForBall, Event::CheckForCam2ImageReceived) => {
                Cam1State::WaitingForBall
            },

            (Cam1State::WaitingForBallStabilization{ ball, image }, Event::CheckForBallStable) => {
                self.on_check_ball_stable(ball, image)
            },

            (Cam1State::WaitingForCamera2PreImage{ ball, image }, Event::Camera2PreImageReceived(pre_image)) => {
                log::debug!("state transition: WaitingForCamera2PreImage -> WaitingForBallHit");
                self.queue.post(Event::BeginWatchingForBallHit);
                Cam1State::WaitingForBallHit{ ball, image, pre_image: Some(pre_image) }
            },

            (Cam1State::WaitingForBallHit{ ball, image, pre_image }, Event::BeginWatchingForBallHit) => {
                self.on_watch_for_hit(ball, image, pre_image)
            },

            // a hit may also be reported directly (test injection)
            (Cam1State::WaitingForBallHit{ image, pre_image, .. }, Event::BallHit(ball, hit_image)) => {
                let _ = hit_image;
                self.start_cam2_watchdog();
                Cam1State::BallHitNowWaitingForCam2Image{ ball, image, pre_image }
            },

            (Cam1State::BallHitNowWaitingForCam2Image{ ball, image, pre_image }, Event::Camera2ImageReceived(strobed)) => {
                let _ = pre_image;
                self.cam2_timer.stop();
                self.on_cam2_image_received(&ball, &image, &strobed);

                self.queue.post(Event::BeginWaitingForBallPlaced);
                Cam1State::WaitingForBall
            },

            (Cam1State::BallHitNowWaitingForCam2Image{ .. }, Event::CheckForCam2ImageReceived) => {
                let message = "Timed out waiting for Cam2Image. Restarting...";
                log::error!("{}", message);
                self.send_error(message);

                self.shot_counter += 1;
                self.shot_log.log_error(self.shot_counter, message);

                self.queue.post(Event::Restart);
                Cam1State::Initializing
            },

            (state, event) => {
                log::error!(
                    "unsupported state transition: {} in state {}; ignoring",
                    event.name(), state.name()
                );
                state
            }
        }
    }

    fn on_waiting_for_ball(&mut self) -> Cam1State {
        let frame = match self.camera.capture_frame() {
            Ok(frame) => frame,
            Err(CameraError::FrameUnavailable) => {
                self.queue.post(Event::BeginWaitingForBallPlaced);
                return Cam1State::WaitingForBall;
            },
            Err(e) => {
                log::error!("camera failure while waiting for ball: {:?}", e);
                self.send_error("camera failure while waiting for the ball");
                self.queue.post(Event::Restart);
                return Cam1State::Initializing;
            }
        };

        let config = self.config.clone();
        let found = self.analyzer(&config).find_and_calibrate_teed_ball(&frame);

        match found {
            Ok(ball) => {
                log::info!("ball found at ({:.0}, {:.0}); waiting for it to settle", ball.x(), ball.y());
                self.send_status(StatusKind::PausingForBallStabilization);

                let queue = self.queue.clone();
                let running = self.running.clone();
                self.stabilization_timer.run_once(
                    Duration::from_millis(self.config.ipc.ball_stabilization_time_ms),
                    move || {
                        if running.load(Ordering::SeqCst) {
                            queue.post(Event::CheckForBallStable);
                        }
                    }
                );

                Cam1State::WaitingForBallStabilization{ ball, image: Arc::new(frame) }
            },
            Err(_) => {
                // expected while idle; report where we looked and try again
                std::thread::sleep(Duration::from_millis(WAIT_FOR_BALL_PAUSE_MS));
                self.queue.post(Event::BeginWaitingForBallPlaced);
                self.send_status(StatusKind::WaitingForBallToAppear);
                Cam1State::WaitingForBall
            }
        }
    }

    fn on_check_ball_stable(&mut self, previous_ball: Ball, previous_image: Arc<RgbImage>) -> Cam1State {
        let config = self.config.clone();

        let frame = match self.camera.capture_frame() {
            Ok(frame) => frame,
            Err(_) => {
                self.queue.post(Event::BeginWaitingForBallPlaced);
                return Cam1State::WaitingForBall;
            }
        };

        let redetected = self.analyzer(&config).redetect_teed_ball(&frame);

        let moved = match &redetected {
            Ok(ball) => ball.moved_relative_to(&previous_ball, 10.0, 6.0),
            Err(_) => {
                log::info!("=============== ball lost before stabilizing; looking again");
                true
            }
        };

        if moved {
            log::info!("=============== ball moved (or was lost) before stabilizing; looking again");
            self.queue.post(Event::BeginWaitingForBallPlaced);
            return Cam1State::WaitingForBall;
        }

        log::info!("=============== ball stabilized; waiting for the hit");

        // let the second camera know to get ready
        if let Err(e) = self.broker.send(IpcMessage::RequestForCamera2Image) {
            log::error!("failed to send arm request to camera 2: {:?}", e);
        }

        // priming pulses walk camera 2 through its startup frames (and trigger the
        // pre-image when that is enabled)
        if let Err(e) = self.strobe.send_priming_pulses(self.club) {
            log::error!("failed to send priming pulses: {:?}", e);
        }

        if self.config.cameras.use_pre_image {
            Cam1State::WaitingForCamera2PreImage{ ball: previous_ball, image: previous_image }
        } else {
            self.queue.post(Event::BeginWatchingForBallHit);
            Cam1State::WaitingForBallHit{ ball: previous_ball, image: previous_image, pre_image: None }
        }
    }

    fn on_watch_for_hit(
        &mut self,
        ball: Ball,
        image: Arc<RgbImage>,
        pre_image: Option<Arc<RgbImage>>
    ) -> Cam1State {
        // give camera 2 a moment to process the priming pulses and the arm message
        std::thread::sleep(Duration::from_millis(self.config.ipc.pre_hit_settle_ms));

        self.send_status(StatusKind::BallPlacedAndReadyForHit);

        if self.watch_for_hit_and_trigger(&ball, &image).is_err() {
            log::error!("failed to watch for the hit; restarting");
            self.queue.post(Event::Restart);
            return Cam1State::Initializing;
        }

        log::info!("============= BALL HIT =============");
        self.start_cam2_watchdog();
        Cam1State::BallHitNowWaitingForCam2Image{ ball, image, pre_image }
    }

    /// Watches live frames for motion downrange of the ball; on the first motion,
    /// fires the external trigger and the strobe train.
    fn watch_for_hit_and_trigger(&mut self, ball: &Ball, reference_image: &RgbImage) -> Result<(), ()> {
        let reference_gray = imgproc::to_gray(reference_image);
        let detector = MotionDetector::new(&reference_gray, ball);

        let deadline = std::time::Instant::now() + Duration::from_secs(WATCH_FOR_HIT_TIMEOUT_SECS);

        while self.running.load(Ordering::SeqCst) {
            if std::time::Instant::now() > deadline {
                log::warn!("watch for hit timed out");
                return Err(());
            }

            let frame = match self.camera.capture_frame() {
                Ok(frame) => frame,
                Err(CameraError::FrameUnavailable) => continue,
                Err(e) => {
                    log::error!("camera failure while watching for the hit: {:?}", e);
                    return Err(());
                }
            };

            if detector.motion_detected(&imgproc::to_gray(&frame)) {
                if let Err(e) = self.strobe.send_external_trigger(self.club) {
                    log::error!("failed to fire the strobe: {:?}", e);
                    self.send_error("strobe trigger failed; the shot is lost");
                    return Err(());
                }
                return Ok(());
            }
        }

        Err(())
    }

    fn start_cam2_watchdog(&self) {
        let timeout = Duration::from_millis(self.config.ipc.cam2_image_timeout_ms);
        log::trace!("arming cam2-image watchdog for {:?}", timeout);

        let queue = self.queue.clone();
        let running = self.running.clone();
        self.cam2_timer.run_once(timeout, move || {
            if running.load(Ordering::SeqCst) {
                queue.post(Event::CheckForCam2ImageReceived);
            }
        });
    }

    fn on_cam2_image_received(&mut self, ball: &Ball, _teed_image: &RgbImage, strobed: &RgbImage) {
        log::debug!("state transition: BallHitNowWaitingForCam2Image received Camera2ImageReceived");

        self.shot_counter += 1;

        let config = self.config.clone();
        let outcome = self.analyzer(&config).analyze_cam2_image(ball, strobed);

        match outcome {
            Ok(outcome) => {
                let mut result = ShotResult::from_ball(&outcome.result_ball, self.club);
                result.confidence = outcome.confidence;
                result.message = format!(
                    "{}{}", outcome.message, crate::shot::format_velocity_interval(&outcome.result_ball)
                );

                log::info!(
                    "shot {}: {:.1} m/s, HLA {:.1} deg, VLA {:.1} deg, back spin {:.0} rpm, side spin {:.0} rpm",
                    self.shot_counter, result.ball_speed_mps, result.hla_deg, result.vla_deg,
                    result.back_spin_rpm, result.side_spin_rpm
                );

                // the simulator wants the numbers as soon as possible
                if !self.registry.send_results(&result, self.shot_counter) {
                    log::error!("could not deliver results to every simulator adapter");
                }

                self.shot_log.log_shot(self.shot_counter, &result);

                let send_result = self.broker.send(IpcMessage::Results{
                    ball_speed_mps: result.ball_speed_mps,
                    hla_deg: result.hla_deg,
                    vla_deg: result.vla_deg,
                    back_spin_rpm: result.back_spin_rpm,
                    side_spin_rpm: result.side_spin_rpm,
                    confidence: result.confidence,
                    message: result.message.clone()
                });
                if let Err(e) = send_result {
                    log::warn!("failed to send results message: {:?}", e);
                }

                self.send_status(StatusKind::Hit);
            },
            Err(e) => {
                let message = format!("could not process the camera-2 image: {:?}", e);
                log::error!("{}", message);
                self.send_error(&message);
                self.shot_log.log_error(self.shot_counter, &message);
            }
        }
    }
}

// ---------------------------------------------------------------------------- camera 2

pub enum Cam2State {
    Initializing,
    WaitingForCameraArmMessage
}

impl Cam2State {
    pub fn name(&self) -> &'static str {
        match self {
            Cam2State::Initializing => "Initializing",
            Cam2State::WaitingForCameraArmMessage => "WaitingForCameraArmMessage"
        }
    }
}

/// The camera-2 host: waits for the arm message, captures on the hardware trigger and
/// ships the frame back.
pub struct Cam2Host {
    pub config: Arc<Configuration>,
    pub queue: EventQueue,
    pub running: Arc<AtomicBool>,
    camera: Box<dyn TriggeredFrameSource>,
    broker: Arc<dyn Broker>,
    /// Standalone test mode: arm immediately instead of waiting for cam1.
    pub standalone: bool
}

impl Cam2Host {
    pub fn new(
        config: Arc<Configuration>,
        camera: Box<dyn TriggeredFrameSource>,
        broker: Arc<dyn Broker>,
        running: Arc<AtomicBool>
    ) -> Cam2Host {
        Cam2Host{
            config,
            queue: EventQueue::new(),
            running,
            camera,
            broker,
            standalone: false
        }
    }

    pub fn run(mut self) {
        log::trace!("camera-2 host starting");
        self.queue.post(Event::Restart);

        spawn_broker_receive_thread(self.broker.clone(), self.queue.clone(), self.running.clone(), false);

        let pause = Duration::from_millis(self.config.ipc.event_loop_pause_ms);
        let mut state = Cam2State::Initializing;

        while self.running.load(Ordering::SeqCst) {
            let event = match self.queue.dequeue(pause) {
                Some(event) => event,
                None => continue
            };

            if event.is_shutdown() {
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            state = match (state, event) {
                (Cam2State::Initializing, Event::Restart) => {
                    if self.standalone {
                        self.queue.post(Event::ArmCamera2Received);
                    }
                    Cam2State::WaitingForCameraArmMessage
                },

                (Cam2State::WaitingForCameraArmMessage, Event::ArmCamera2Received) => {
                    log::debug!("armed; waiting for the external trigger");
                    self.on_armed();
                    self.queue.post(Event::Restart);
                    Cam2State::Initializing
                },

                // a trigger while unarmed means cam1's arm message never made it
                (Cam2State::Initializing, Event::ArmCamera2Received) => {
                    log::error!("arm message received in Initializing; ordering violation");
                    Cam2State::Initializing
                },

                (state, event) => {
                    log::error!(
                        "unsupported state transition: {} in state {}; ignoring",
                        event.name(), state.name()
                    );
                    state
                }
            };
        }

        log::trace!("camera-2 host exiting event loop");
    }

    fn on_armed(&mut self) {
        // wait in short slices so shutdown stays responsive
        while self.running.load(Ordering::SeqCst) {
            match self.camera.wait_for_triggered_frame(Duration::from_millis(500)) {
                Ok(frame) => {
                    log::trace!("triggered frame captured; sending to camera 1");
                    let payload = ImagePayload::from_rgb(&frame);
                    if let Err(e) = self.broker.send(IpcMessage::Camera2Image(payload)) {
                        log::error!("failed to send the camera-2 image: {:?}", e);
                    }
                    return;
                },
                Err(CameraError::TriggerTimeout) => continue,
                Err(e) => {
                    log::error!("triggered capture failed: {:?}", e);
                    return;
                }
            }
        }
    }
}

fn spawn_broker_receive_thread(
    broker: Arc<dyn Broker>,
    queue: EventQueue,
    running: Arc<AtomicBool>,
    is_cam1: bool
) {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match broker.receive(Duration::from_millis(500)) {
                Ok(Some(message)) => dispatch_ipc_message(message, &queue, is_cam1),
                Ok(None) => (),
                Err(IpcError::Decode(e)) => {
                    // drop and continue
                    log::warn!("dropping malformed IPC message: {}", e);
                },
                Err(IpcError::Disconnected) => break,
                Err(e) => {
                    log::warn!("IPC receive error: {:?}", e);
                }
            }
        }
        log::trace!("broker receive thread exiting");
    });
}

fn dispatch_ipc_message(message: IpcMessage, queue: &EventQueue, is_cam1: bool) {
    match message {
        IpcMessage::Camera2PreImage(payload) if is_cam1 => {
            match payload.to_rgb() {
                Some(image) => { queue.post(Event::Camera2PreImageReceived(Arc::new(image))); },
                None => log::warn!("pre-image payload with unusable pixel format")
            }
        },
        IpcMessage::Camera2Image(payload) if is_cam1 => {
            match payload.to_rgb() {
                Some(image) => { queue.post(Event::Camera2ImageReceived(Arc::new(image))); },
                None => log::warn!("image payload with unusable pixel format")
            }
        },
        IpcMessage::RequestForCamera2Image if !is_cam1 => {
            queue.post(Event::ArmCamera2Received);
        },
        IpcMessage::Control(kind) => {
            queue.post(Event::ControlMessage(kind));
        },
        other => {
            log::trace!("ignoring IPC message: {:?}", message_name(&other));
        }
    }
}

fn message_name(message: &IpcMessage) -> &'static str {
    match message {
        IpcMessage::RequestForCamera2Image => "RequestForCamera2Image",
        IpcMessage::Camera2PreImage(_) => "Camera2PreImage",
        IpcMessage::Camera2Image(_) => "Camera2Image",
        IpcMessage::Results{ .. } => "Results",
        IpcMessage::Control(_) => "Control",
        IpcMessage::Status(_) => "Status",
        IpcMessage::Error{ .. } => "Error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulator::{CameraSimulatorData, SimCamera, TriggeredSimCamera};
    use crate::ipc::InProcessBroker;
    use crate::output::NullSink;
    use crate::strobe::{RecordingPin, RecordingSpi};

    fn test_config() -> Configuration {
        let mut config = Configuration::default();
        config.ipc.event_loop_pause_ms = 50;
        config.ipc.ball_stabilization_time_ms = 50;
        config.ipc.cam2_image_timeout_ms = 300;
        config.ipc.pre_hit_settle_ms = 10;
        config.cameras.cam1.resolution_x = 320;
        config.cameras.cam1.resolution_y = 240;
        config.cameras.cam1.expected_ball_center = [160, 120];
        config.cameras.cam2 = config.cameras.cam1.clone();
        config.simulators.shot_log_path = std::env::temp_dir()
            .join(format!("stroboxide_fsm_test_{}.csv", std::process::id()))
            .to_string_lossy()
            .to_string();
        config
    }

    fn make_strobe(config: &Configuration) -> PulseGenerator {
        PulseGenerator::new(
            &config.strobing, false, 0,
            Box::new(RecordingSpi::new()), Box::new(RecordingPin::new())
        ).unwrap()
    }

    fn drain_until<F: Fn(&IpcMessage) -> bool>(
        broker: &InProcessBroker,
        deadline: Duration,
        predicate: F
    ) -> Option<IpcMessage> {
        let end = std::time::Instant::now() + deadline;
        while std::time::Instant::now() < end {
            if let Ok(Some(message)) = broker.receive(Duration::from_millis(100)) {
                if predicate(&message) {
                    return Some(message);
                }
            }
        }
        None
    }

    #[test]
    fn cam2_host_ships_frame_after_arm_and_trigger() {
        let config = Arc::new(test_config());
        let (cam1_end, cam2_end) = InProcessBroker::pair();

        let sim_data = CameraSimulatorData::default();
        *sim_data.exposures.lock().unwrap() = vec![(100.0, 120.0, 15.0), (200.0, 115.0, 15.0)];

        let camera = TriggeredSimCamera::new(sim_data, 320, 240);
        let trigger = camera.trigger_fired.clone();

        let running = Arc::new(AtomicBool::new(true));
        let host = Cam2Host::new(config, Box::new(camera), Arc::new(cam2_end), running.clone());
        let handle = std::thread::spawn(move || host.run());

        // cam1 side: send the arm request, then "fire" the hardware trigger
        cam1_end.send(IpcMessage::RequestForCamera2Image).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        trigger.store(true, Ordering::SeqCst);

        let message = drain_until(&cam1_end, Duration::from_secs(3), |m|
            matches!(m, IpcMessage::Camera2Image(_))
        );
        assert!(message.is_some(), "no Camera2Image arrived");

        running.store(false, Ordering::SeqCst);
        let _ = handle.join();
    }

    #[test]
    fn cam1_times_out_waiting_for_cam2_image_and_restarts() {
        let config = Arc::new(test_config());
        let (cam1_end, cam2_end) = InProcessBroker::pair();

        let sim_data = CameraSimulatorData::default();
        // ball teed up and perfectly still
        sim_data.ball_placed.store(true, Ordering::SeqCst);
        sim_data.ball_x.store(160.0, Ordering::SeqCst);
        sim_data.ball_y.store(120.0, Ordering::SeqCst);
        let expected_radius = crate::geometry::CameraSpec::from(&config.cameras.cam1)
            .expected_ball_radius_px(config.cameras.cam1.calibration_distance_m);
        sim_data.ball_radius.store(expected_radius as f32, Ordering::SeqCst);

        let camera = SimCamera::new(sim_data.clone(), 320, 240);

        let running = Arc::new(AtomicBool::new(true));
        let host = Cam1Host::new(
            config.clone(),
            Box::new(camera),
            make_strobe(&config),
            Arc::new(cam1_end),
            AdapterRegistry::new(vec![], Box::new(NullSink)),
            running.clone()
        );
        let handle = std::thread::spawn(move || host.run());

        // once the host reports the ball ready, swing "the club" through the watch area
        let ready = drain_until(&cam2_end, Duration::from_secs(30), |m|
            matches!(m, IpcMessage::Status(StatusKind::BallPlacedAndReadyForHit))
        );
        assert!(ready.is_some(), "host never armed for the hit");
        sim_data.motion_in_progress.store(true, Ordering::SeqCst);

        // no camera-2 image ever arrives; expect the timeout error...
        let error = drain_until(&cam2_end, Duration::from_secs(30), |m|
            matches!(m, IpcMessage::Error{ .. })
        );
        match error {
            Some(IpcMessage::Error{ message, recent_log }) => {
                assert!(message.contains("Timed out waiting for Cam2Image"), "message: {}", message);
                assert!(!recent_log.is_empty());
            },
            _ => panic!("no timeout error emitted")
        }

        // ...followed by the restart's Initializing status
        let restarted = drain_until(&cam2_end, Duration::from_secs(10), |m|
            matches!(m, IpcMessage::Status(StatusKind::Initializing))
        );
        assert!(restarted.is_some(), "no restart after the timeout");

        running.store(false, Ordering::SeqCst);
        let _ = handle.join();
    }

    #[test]
    fn club_change_control_message_is_applied() {
        let config = Arc::new(test_config());
        let (cam1_end, _cam2_end) = InProcessBroker::pair();

        let sim_data = CameraSimulatorData::default();
        let camera = SimCamera::new(sim_data, 320, 240);

        let running = Arc::new(AtomicBool::new(true));
        let mut host = Cam1Host::new(
            config.clone(),
            Box::new(camera),
            make_strobe(&config),
            Arc::new(cam1_end),
            AdapterRegistry::new(vec![], Box::new(NullSink)),
            running
        );

        assert_eq!(host.club, ClubType::Driver);
        host.handle_control_message(ControlMessageKind::ClubChangeToPutter);
        assert_eq!(host.club, ClubType::Putter);
        host.handle_control_message(ControlMessageKind::ClubChangeToDriver);
        assert_eq!(host.club, ClubType::Driver);
    }
}
