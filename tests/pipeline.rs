//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! End-to-end scenario: both hosts wired through the in-process broker against the
//! simulated cameras, one full shot from tee-up to the Results message.
//!

use stroboxide::camera::simulator::{
    exposures_for_shot, CameraSimulatorData, SimCamera, SimTriggerLine, TriggeredSimCamera
};
use stroboxide::config::Configuration;
use stroboxide::fsm::{Cam1Host, Cam2Host};
use stroboxide::geometry::CameraSpec;
use stroboxide::ipc::{Broker, InProcessBroker, IpcMessage, StatusKind};
use stroboxide::output::{AdapterRegistry, NullSink};
use stroboxide::strobe::{PulseGenerator, RecordingSpi};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_config(tag: &str) -> Configuration {
    let mut config = Configuration::default();
    // small frames and short pauses keep the loop quick
    config.cameras.cam1.resolution_x = 400;
    config.cameras.cam1.resolution_y = 300;
    config.cameras.cam1.expected_ball_center = [120, 150];
    config.cameras.cam2 = config.cameras.cam1.clone();
    config.cameras.cam2_offset_from_cam1 = [0.0, 0.0, 0.0];
    config.ipc.event_loop_pause_ms = 50;
    config.ipc.ball_stabilization_time_ms = 100;
    config.ipc.pre_hit_settle_ms = 50;
    config.ipc.cam2_image_timeout_ms = 8000;
    config.spin_analysis.skip_spin = true;
    config.simulators.shot_log_path = std::env::temp_dir()
        .join(format!("stroboxide_pipeline_{}_{}.csv", tag, std::process::id()))
        .to_string_lossy()
        .to_string();
    config
}

/// An observer endpoint that taps the traffic the cam1 host sends out.
struct Tap {
    messages: std::sync::Mutex<Vec<IpcMessage>>
}

/// Watches the cam1->out stream while forwarding arm requests to cam2's endpoint and
/// letting cam2's messages through to cam1.
fn pump_broker(
    monitor_end: Arc<InProcessBroker>,
    tap: Arc<Tap>,
    running: Arc<AtomicBool>
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            if let Ok(Some(message)) = monitor_end.receive(Duration::from_millis(100)) {
                tap.messages.lock().unwrap().push(message);
            }
        }
    })
}

#[test]
fn full_shot_produces_results_message() {
    let config = Arc::new(test_config("full_shot"));

    // cam1 <-> cam2 direct pair
    let (cam1_end, cam2_end) = InProcessBroker::pair();
    let cam1_end = Arc::new(cam1_end);
    let cam2_end = Arc::new(cam2_end);

    let sim_data = CameraSimulatorData::default();
    let camera1 = SimCamera::new(sim_data.clone(), 400, 300);
    let camera2 = TriggeredSimCamera::new(sim_data.clone(), 400, 300);
    let trigger_flag = camera2.trigger_fired.clone();

    let strobe = PulseGenerator::new(
        &config.strobing, false, 0,
        Box::new(RecordingSpi::new()),
        Box::new(SimTriggerLine::new(trigger_flag))
    ).unwrap();

    let running = Arc::new(AtomicBool::new(true));

    let cam1_host = Cam1Host::new(
        config.clone(),
        Box::new(camera1),
        strobe,
        cam1_end.clone(),
        AdapterRegistry::new(vec![], Box::new(NullSink)),
        running.clone()
    );
    let cam2_host = Cam2Host::new(
        config.clone(),
        Box::new(camera2),
        cam2_end.clone(),
        running.clone()
    );

    // scenario data: teed ball at the expected spot, strobed exposures down-range
    let camera_spec = CameraSpec::from(&config.cameras.cam1);
    let radius = camera_spec.expected_ball_radius_px(camera_spec.calibration_distance_m);

    sim_data.ball_x.store(120.0, Ordering::SeqCst);
    sim_data.ball_y.store(150.0, Ordering::SeqCst);
    sim_data.ball_radius.store(radius as f32, Ordering::SeqCst);

    let pixels_per_ms = 14.0f32;
    *sim_data.exposures.lock().unwrap() = exposures_for_shot(
        140.0, 160.0, radius as f32, pixels_per_ms, 0.0,
        &config.strobing.pulse_vector_driver, 5
    );

    let shot_log_path = config.simulators.shot_log_path.clone();
    let _ = std::fs::remove_file(&shot_log_path);

    let cam1_thread = std::thread::spawn(move || cam1_host.run());
    let cam2_thread = std::thread::spawn(move || cam2_host.run());

    // tee up, then swing; the club blob stays in the frame until the armed host's
    // motion watcher notices it, so the exact timing does not matter
    sim_data.ball_placed.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_secs(2));
    sim_data.motion_in_progress.store(true, Ordering::SeqCst);

    // both hosts consume their broker endpoints, so the observable end of a completed
    // shot is the shot log the cam1 host writes
    let deadline = std::time::Instant::now() + Duration::from_secs(120);
    let mut shot_logged = false;
    while std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
        if let Ok(contents) = std::fs::read_to_string(&shot_log_path) {
            if contents.lines().count() >= 2 {
                shot_logged = true;
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    let _ = cam1_thread.join();
    let _ = cam2_thread.join();

    assert!(shot_logged, "shot never completed");

    // the logged line carries a plausible speed
    let contents = std::fs::read_to_string(&shot_log_path).unwrap();
    let line = contents.lines().nth(1).unwrap().to_string();
    let _ = std::fs::remove_file(&shot_log_path);

    let fields: Vec<&str> = line.split(',').collect();
    // ball speed mph is the 8th column
    let speed_mph: f64 = fields[7].parse().unwrap();
    assert!(speed_mph > 1.0 && speed_mph < 250.0, "speed {} mph", speed_mph);
}

#[test]
fn status_stream_reaches_observer() {
    // separate check of the observer plumbing: the cam1 host's status messages arrive
    // at the peer endpoint when no host is consuming it
    let config = Arc::new(test_config("status_stream"));
    let (cam1_end, monitor_end) = InProcessBroker::pair();
    let monitor_end = Arc::new(monitor_end);

    let sim_data = CameraSimulatorData::default();
    let camera = SimCamera::new(sim_data, 400, 300);

    let strobe = PulseGenerator::new(
        &config.strobing, false, 0,
        Box::new(RecordingSpi::new()),
        Box::new(stroboxide::strobe::RecordingPin::new())
    ).unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let host = Cam1Host::new(
        config.clone(),
        Box::new(camera),
        strobe,
        Arc::new(cam1_end),
        AdapterRegistry::new(vec![], Box::new(NullSink)),
        running.clone()
    );
    let handle = std::thread::spawn(move || host.run());

    let tap = Arc::new(Tap{ messages: std::sync::Mutex::new(vec![]) });
    let pump = pump_broker(monitor_end, tap.clone(), running.clone());

    std::thread::sleep(Duration::from_secs(3));
    running.store(false, Ordering::SeqCst);
    let _ = handle.join();
    let _ = pump.join();

    let messages = tap.messages.lock().unwrap();
    assert!(
        messages.iter().any(|m| matches!(m, IpcMessage::Status(StatusKind::Initializing))),
        "no Initializing status seen"
    );
    assert!(
        messages.iter().any(|m| matches!(m, IpcMessage::Status(StatusKind::WaitingForBallToAppear))),
        "no WaitingForBallToAppear status seen"
    );
}
