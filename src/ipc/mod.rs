//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Cross-process messages between the two per-camera hosts.
//!
//! The transport is an external message broker; delivery is at-most-once and duplicate
//! messages must stay idempotent. The in-process pair below carries the same messages
//! over channels for tests and single-machine runs.
//!

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug)]
pub enum IpcError {
    Send(String),
    Receive(String),
    /// Malformed message on the wire; dropped, processing continues.
    Decode(String),
    Disconnected
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8
}

/// Raw image payload: enough to rebuild the frame on the other side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImagePayload {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>
}

impl ImagePayload {
    pub fn from_rgb(image: &image::RgbImage) -> ImagePayload {
        ImagePayload{
            width: image.width(),
            height: image.height(),
            stride: image.width() * 3,
            format: PixelFormat::Rgb8,
            data: image.as_raw().clone()
        }
    }

    pub fn to_rgb(&self) -> Option<image::RgbImage> {
        if self.format != PixelFormat::Rgb8 {
            return None;
        }
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlMessageKind {
    ClubChangeToPutter,
    ClubChangeToDriver
}

/// Status phases reported to the operator interface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatusKind {
    Initializing,
    WaitingForSimulatorArmed,
    WaitingForBallToAppear,
    PausingForBallStabilization,
    BallPlacedAndReadyForHit,
    Hit,
    Error
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IpcMessage {
    /// Cam1 telling cam2 to arm for the upcoming trigger.
    RequestForCamera2Image,
    Camera2PreImage(ImagePayload),
    Camera2Image(ImagePayload),
    Results{
        ball_speed_mps: f64,
        hla_deg: f64,
        vla_deg: f64,
        back_spin_rpm: f64,
        side_spin_rpm: f64,
        confidence: f64,
        message: String
    },
    Control(ControlMessageKind),
    Status(StatusKind),
    Error{
        message: String,
        /// Recent log lines, so the operator can see the cause upstream.
        recent_log: Vec<String>
    }
}

impl IpcMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, IpcError> {
        serde_json::to_vec(self).map_err(|e| IpcError::Send(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<IpcMessage, IpcError> {
        serde_json::from_slice(bytes).map_err(|e| IpcError::Decode(e.to_string()))
    }
}

/// One endpoint of the message broker.
pub trait Broker: Send + Sync {
    fn send(&self, message: IpcMessage) -> Result<(), IpcError>;

    /// Blocks up to `timeout`; `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<IpcMessage>, IpcError>;
}

/// Channel-backed broker pair; what one end sends, the other receives.
pub struct InProcessBroker {
    sender: crossbeam::channel::Sender<IpcMessage>,
    receiver: crossbeam::channel::Receiver<IpcMessage>
}

impl InProcessBroker {
    pub fn pair() -> (InProcessBroker, InProcessBroker) {
        let (send_a, recv_a) = crossbeam::channel::unbounded();
        let (send_b, recv_b) = crossbeam::channel::unbounded();
        (
            InProcessBroker{ sender: send_a, receiver: recv_b },
            InProcessBroker{ sender: send_b, receiver: recv_a }
        )
    }
}

impl Broker for InProcessBroker {
    fn send(&self, message: IpcMessage) -> Result<(), IpcError> {
        self.sender.send(message).map_err(|_| IpcError::Disconnected)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<IpcMessage>, IpcError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Err(IpcError::Disconnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn image_payload_roundtrip() {
        let mut source = image::RgbImage::new(8, 4);
        source.put_pixel(3, 2, Rgb([10, 20, 30]));

        let payload = ImagePayload::from_rgb(&source);
        let restored = payload.to_rgb().unwrap();

        assert_eq!(restored.dimensions(), (8, 4));
        assert_eq!(*restored.get_pixel(3, 2), Rgb([10, 20, 30]));
    }

    #[test]
    fn message_bytes_roundtrip() {
        let message = IpcMessage::Results{
            ball_speed_mps: 62.5,
            hla_deg: -1.2,
            vla_deg: 14.0,
            back_spin_rpm: 2900.0,
            side_spin_rpm: -250.0,
            confidence: 0.9,
            message: "ok".to_string()
        };

        let bytes = message.to_bytes().unwrap();
        match IpcMessage::from_bytes(&bytes).unwrap() {
            IpcMessage::Results{ ball_speed_mps, side_spin_rpm, .. } => {
                assert!((ball_speed_mps - 62.5).abs() < 1.0e-12);
                assert!((side_spin_rpm + 250.0).abs() < 1.0e-12);
            },
            other => panic!("wrong variant: {:?}", other)
        }
    }

    #[test]
    fn malformed_bytes_yield_decode_error() {
        assert!(matches!(IpcMessage::from_bytes(b"not json"), Err(IpcError::Decode(_))));
    }

    #[test]
    fn in_process_pair_carries_messages_both_ways() {
        let (cam1, cam2) = InProcessBroker::pair();

        cam1.send(IpcMessage::RequestForCamera2Image).unwrap();
        match cam2.receive(Duration::from_millis(100)).unwrap() {
            Some(IpcMessage::RequestForCamera2Image) => (),
            other => panic!("unexpected {:?}", other)
        }

        cam2.send(IpcMessage::Status(StatusKind::Initializing)).unwrap();
        assert!(matches!(
            cam1.receive(Duration::from_millis(100)).unwrap(),
            Some(IpcMessage::Status(StatusKind::Initializing))
        ));

        // timeout path
        assert!(cam1.receive(Duration::from_millis(10)).unwrap().is_none());
    }
}
