//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Entry point of the `stroboxide` executable.
//!
//! Two hosts exist, one per camera: the camera-1 host watches the teed ball and does
//! all post-hit analysis; the camera-2 host captures the strobed frame on the hardware
//! trigger. `--role` selects which one runs; the default standalone mode wires both
//! against the simulated cameras in a single process and plays one scripted shot.
//!

use stroboxide::args::{self, Role};
use stroboxide::ball::{ClubType, GolferOrientation};
use stroboxide::camera::simulator::{
    exposures_for_shot, CameraSimulatorData, SimCamera, SimTriggerLine, TriggeredSimCamera
};
use stroboxide::config::Configuration;
use stroboxide::fsm::{Cam1Host, Cam2Host};
use stroboxide::geometry::CameraSpec;
use stroboxide::ipc::InProcessBroker;
use stroboxide::logging;
use stroboxide::output::{AdapterRegistry, E6Adapter, GsProAdapter, NullSink, SimAdapter};
use stroboxide::strobe::{PulseGenerator, RecordingSpi};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const VERSION_STRING: &str = include_str!(concat!(env!("OUT_DIR"), "/version"));

fn main() {
    let args = args::parse_command_line(std::env::args());

    logging::init(args.logging);

    log::info!("stroboxide rev. {} on {}", VERSION_STRING, os_info::get());

    let config = match Configuration::load(args.config_path.as_deref().map(std::path::Path::new)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));

    match args.role {
        Role::Standalone => run_standalone(config, &args, running),
        Role::Cam1 | Role::Cam2 => {
            // the real camera, SPI and broker drivers are deployment integrations; the
            // in-tree devices are the simulators
            log::warn!("no hardware integration compiled in; running both hosts against the simulator");
            run_standalone(config, &args, running);
        }
    }
}

/// Both hosts in one process, simulated cameras, one scripted shot.
fn run_standalone(config: Arc<Configuration>, args: &args::Args, running: Arc<AtomicBool>) {
    log::info!("standalone mode: simulated cameras, in-process broker");

    let (cam1_broker, cam2_broker) = InProcessBroker::pair();

    let sim_data = CameraSimulatorData::default();
    let resolution1 = (config.cameras.cam1.resolution_x, config.cameras.cam1.resolution_y);
    let resolution2 = (config.cameras.cam2.resolution_x, config.cameras.cam2.resolution_y);

    let cam1_camera = SimCamera::new(sim_data.clone(), resolution1.0, resolution1.1);
    let cam2_camera = TriggeredSimCamera::new(sim_data.clone(), resolution2.0, resolution2.1);
    let trigger_flag = cam2_camera.trigger_fired.clone();

    // the strobe's trigger pin is wired straight to the simulated camera's trigger input
    let strobe = match PulseGenerator::new(
        &config.strobing,
        config.cameras.requires_flush_pulse,
        config.cameras.pause_before_flush_ms,
        Box::new(RecordingSpi::new()),
        Box::new(SimTriggerLine::new(trigger_flag))
    ) {
        Ok(strobe) => strobe,
        Err(e) => {
            log::error!("failed to build the pulse sequences: {:?}", e);
            std::process::exit(1);
        }
    };

    let mut adapters: Vec<SimAdapter> = vec![];
    if !config.simulators.e6_host_address.is_empty() {
        adapters.push(SimAdapter::E6(E6Adapter::new()));
    }
    if !config.simulators.gspro_host_address.is_empty() {
        adapters.push(SimAdapter::GsPro(GsProAdapter::new()));
    }
    let mut registry = AdapterRegistry::new(adapters, Box::new(NullSink));
    // nothing is actually listening in standalone mode
    registry.arm_all();

    let mut cam1_host = Cam1Host::new(
        config.clone(),
        Box::new(cam1_camera),
        strobe,
        Arc::new(cam1_broker),
        registry,
        running.clone()
    );
    if args.start_in_putting_mode {
        log::info!("starting in putting mode");
        cam1_host.club = ClubType::Putter;
    }
    if args.left_handed {
        cam1_host.orientation = GolferOrientation::LeftHanded;
    }
    cam1_host.practice_ball = args.practice_ball;
    cam1_host.external_strobe = args.external_strobe;

    let cam2_host = Cam2Host::new(
        config.clone(),
        Box::new(cam2_camera),
        Arc::new(cam2_broker),
        running.clone()
    );

    let cam1_thread = std::thread::spawn(move || cam1_host.run());
    let cam2_thread = std::thread::spawn(move || cam2_host.run());

    run_shot_script(&config, &sim_data);

    // let the hosts finish processing, then wind down
    std::thread::sleep(std::time::Duration::from_secs(20));
    running.store(false, Ordering::SeqCst);

    let _ = cam1_thread.join();
    let _ = cam2_thread.join();

    log::info!("standalone run finished");
}

/// Tees up a simulated ball, waits for the host to settle, then swings.
fn run_shot_script(config: &Configuration, sim_data: &CameraSimulatorData) {
    let camera1 = CameraSpec::from(&config.cameras.cam1);
    let expected_radius = camera1.expected_ball_radius_px(camera1.calibration_distance_m);

    let center = camera1.expected_ball_center;
    sim_data.ball_x.store(center.x as f32, Ordering::SeqCst);
    sim_data.ball_y.store(center.y as f32, Ordering::SeqCst);
    sim_data.ball_radius.store(expected_radius as f32, Ordering::SeqCst);

    // the strobed frame camera 2 will produce once triggered
    let exposures = exposures_for_shot(
        center.x as f32 + expected_radius as f32,
        (config.cameras.cam2.resolution_y / 2) as f32,
        expected_radius as f32,
        expected_radius as f32 / 2.0, // pixels per millisecond
        10.0,
        &config.strobing.pulse_vector_driver,
        5
    );
    *sim_data.exposures.lock().unwrap() = exposures;

    log::info!("placing the simulated ball");
    sim_data.ball_placed.store(true, Ordering::SeqCst);

    // detection + stabilization + arming take a few seconds
    std::thread::sleep(std::time::Duration::from_secs(8));

    log::info!("swinging the simulated club");
    sim_data.motion_in_progress.store(true, Ordering::SeqCst);
}
