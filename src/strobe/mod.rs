//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Strobe pulse generation.
//!
//! A pulse train is encoded as an MSB-first bitstream: a run of `k` ones lights the
//! strobe for `k / baud * 8` seconds, the zero run that follows keeps it dark for the
//! requested off-duration. While the buffer streams out of the SPI port, a separate
//! trigger pin holds the camera shutter open.
//!

use crate::ball::ClubType;
use crate::config::StrobingConfig;

const BITS_PER_WORD: u32 = 16;

/// Big enough for any reasonable pulse train.
const MAX_PULSE_BUFFER_SIZE: usize = 800_000;

/// Priming-pulse shape: 100 us shutter at 5 FPS, less the hardware offset.
const PRIMING_SHUTTER_US: u64 = 100;
const PRIMING_SHUTTER_OFFSET_US: u64 = 14;
const PRIMING_FRAME_GAP_US: u64 = 1_000_000 / 5 - PRIMING_SHUTTER_US;

const FLUSH_PULSE_US: u64 = 10_000;

#[derive(Debug)]
pub enum StrobeError {
    /// SPI device could not be (re)opened at the requested baud rate.
    SpiOpen(String),
    /// The driver accepted fewer bytes than the sequence length.
    ShortWrite{ sent: usize, expected: usize },
    BufferOverrun{ interval_ms: f64 },
    InvalidOnPulseWidth(u32),
    Pin(String),
    /// Pulse sequences were not built before use.
    NotInitialized
}

/// "Write N bytes at the configured baud" primitive supplied by the GPIO/SPI driver.
pub trait SpiWriter: Send {
    /// Reconfigures the port for a new baud rate.
    fn reopen(&mut self, baud: u32) -> Result<(), StrobeError>;

    /// Blocking write of the whole buffer; returns the number of bytes accepted.
    fn write(&mut self, buffer: &[u8]) -> Result<usize, StrobeError>;
}

/// Digital output driving the camera shutter / external trigger line. The hardware
/// inverts the logical signal; the camera triggers on our falling edge.
pub trait TriggerPin: Send {
    fn set(&mut self, high: bool) -> Result<(), StrobeError>;
}

/// Builds the on-pulse bit pattern for the next two bytes: `carry_zero_bits` zeros owed
/// by the previous off-slot, then `on_bits` ones, then trailing zeros.
///
/// Returns the two bytes and the number of trailing zero bits inside them.
fn next_two_pulse_bytes(carry_zero_bits: u32, on_bits: u32) -> Result<(u8, u8, u32), StrobeError> {
    if on_bits < 1 || on_bits > 8 {
        return Err(StrobeError::InvalidOnPulseWidth(on_bits));
    }
    debug_assert!(carry_zero_bits < 8);

    let mut pattern: u16 = 0;
    for _ in 0..on_bits {
        pattern >>= 1;
        pattern |= 0b1000_0000_0000_0000;
    }
    pattern >>= carry_zero_bits;

    let first = (pattern >> 8) as u8;
    let second = (pattern & 0x00ff) as u8;
    let trailing_zero_bits = BITS_PER_WORD - carry_zero_bits - on_bits;

    Ok((first, second, trailing_zero_bits))
}

fn align_to_word_size(length: usize, word_size_bits: u32) -> usize {
    let word_bytes = (word_size_bits / 8) as usize;
    let left_over = length % word_bytes;
    if left_over == 0 {
        length
    } else {
        length + word_bytes - left_over
    }
}

/// Encodes `intervals` (strobe off-durations in milliseconds) into an SPI byte buffer.
///
/// The actual timing depends on the driver honoring the baud rate exactly; each
/// interval's bit budget is `round(interval_ms * baud / 1000)`, covering the on-pulse,
/// the zero tail of its two pattern bytes, whole zero bytes, and up to 7 leftover zero
/// bits folded into the next on-pattern.
pub fn build_pulse_train(
    baud: u32,
    intervals: &[f64],
    on_bits: u32
) -> Result<Vec<u8>, StrobeError> {
    let bytes_per_ms = baud as f64 / 8000.0;

    let mut buffer: Vec<u8> = vec![];
    let mut carry_zero_bits = 0u32;

    for &interval_ms in intervals {
        let (first, second, trailing_zero_bits) = next_two_pulse_bytes(carry_zero_bits, on_bits)?;
        buffer.push(first);
        buffer.push(second);

        let total_bits = (interval_ms * bytes_per_ms * 8.0).round() as i64;
        let mut off_bits = total_bits - trailing_zero_bits as i64 - on_bits as i64;
        if off_bits < 0 {
            off_bits = 0;
        }

        let zero_bytes = (off_bits / 8) as usize;
        buffer.resize(buffer.len() + zero_bytes, 0);
        carry_zero_bits = (off_bits % 8) as u32;

        if buffer.len() > MAX_PULSE_BUFFER_SIZE * 9 / 10 {
            log::error!(
                "pulse buffer overrun; size cap is {} bytes, current interval {} ms",
                MAX_PULSE_BUFFER_SIZE, interval_ms
            );
            return Err(StrobeError::BufferOverrun{ interval_ms });
        }
    }

    let final_size = align_to_word_size(buffer.len(), BITS_PER_WORD);
    buffer.resize(final_size, 0);

    Ok(buffer)
}

/// Owns the SPI port and the trigger pin; the pulse sequences are prebuilt at
/// construction and immutable afterwards.
pub struct PulseGenerator {
    config: StrobingConfig,
    requires_flush_pulse: bool,
    pause_before_flush_ms: u64,
    fast_sequence: Vec<u8>,
    slow_sequence: Vec<u8>,
    spi: Box<dyn SpiWriter>,
    pin: Box<dyn TriggerPin>
}

impl PulseGenerator {
    pub fn new(
        config: &StrobingConfig,
        requires_flush_pulse: bool,
        pause_before_flush_ms: u64,
        spi: Box<dyn SpiWriter>,
        pin: Box<dyn TriggerPin>
    ) -> Result<PulseGenerator, StrobeError> {
        log::trace!("building fast pulse sequence");
        let fast_sequence = build_pulse_train(
            config.baud_fast,
            &config.pulse_vector_driver,
            config.on_pulse_bits_fast
        )?;

        log::trace!("building slow pulse sequence");
        let slow_sequence = build_pulse_train(
            config.baud_slow,
            &config.pulse_vector_putter,
            config.on_pulse_bits_slow
        )?;

        Ok(PulseGenerator{
            config: config.clone(),
            requires_flush_pulse,
            pause_before_flush_ms,
            fast_sequence,
            slow_sequence,
            spi,
            pin
        })
    }

    /// Off-intervals (ms) of the train used for the given club; the exposure selector
    /// correlates inter-ball distances against these.
    pub fn pulse_intervals(config: &StrobingConfig, club: ClubType) -> &[f64] {
        match club {
            ClubType::Putter => &config.pulse_vector_putter,
            _ => &config.pulse_vector_driver
        }
    }

    fn sequence_for(&self, club: ClubType) -> &[u8] {
        match club {
            ClubType::Putter => &self.slow_sequence,
            _ => &self.fast_sequence
        }
    }

    fn send_on_off_pulse(&mut self, length_us: u64) -> Result<(), StrobeError> {
        self.pin.set(true)?;
        std::thread::sleep(std::time::Duration::from_micros(length_us));
        self.pin.set(false)
    }

    /// Opens the shutter, streams the whole strobe sequence, closes the shutter.
    fn send_trigger_and_shutter(&mut self, club: ClubType) -> Result<(), StrobeError> {
        let sequence_length = self.sequence_for(club).len();
        if sequence_length == 0 {
            return Err(StrobeError::NotInitialized);
        }

        if club == ClubType::Putter && self.config.putting_strobe_delay_ms > 0 {
            // give the putt time to reach the frame
            std::thread::sleep(std::time::Duration::from_millis(self.config.putting_strobe_delay_ms));
        }

        self.pin.set(true)?;
        let write_result = {
            let sequence = match club {
                ClubType::Putter => &self.slow_sequence,
                _ => &self.fast_sequence
            };
            self.spi.write(sequence)
        };
        self.pin.set(false)?;

        let sent = write_result?;
        if sent != sequence_length {
            log::error!("SPI write sent {} of {} bytes", sent, sequence_length);
            return Err(StrobeError::ShortWrite{ sent, expected: sequence_length });
        }

        log::trace!("sent pulse sequence of {} bytes", sequence_length);
        Ok(())
    }

    /// Walks the second camera through its startup-frame states: a burst of short
    /// pulses, a pause, and one final arming pulse. Leaves the SPI port configured at
    /// the baud rate the real trigger will use.
    pub fn send_priming_pulses(&mut self, club: ClubType) -> Result<(), StrobeError> {
        self.spi.reopen(self.config.baud_fast)?;

        if self.config.pause_before_priming_pulses_ms > 0 {
            log::trace!(
                "waiting {} ms for the camera2 system to prepare",
                self.config.pause_before_priming_pulses_ms
            );
            std::thread::sleep(std::time::Duration::from_millis(self.config.pause_before_priming_pulses_ms));
        }

        log::trace!("sending {} priming pulses", self.config.num_priming_pulses);
        for _ in 0..self.config.num_priming_pulses {
            self.send_on_off_pulse(PRIMING_SHUTTER_US - PRIMING_SHUTTER_OFFSET_US)?;
            std::thread::sleep(std::time::Duration::from_micros(PRIMING_FRAME_GAP_US));
        }

        if self.config.pause_before_last_priming_pulse_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.config.pause_before_last_priming_pulse_ms));
        }

        // this pulse gets the camera2 state machine ready to take the actual image
        self.send_on_off_pulse(PRIMING_SHUTTER_US - PRIMING_SHUTTER_OFFSET_US)?;

        let final_baud = match club {
            ClubType::Putter => self.config.baud_slow,
            _ => self.config.baud_fast
        };
        log::trace!("setting baud rate to {}", final_baud);
        self.spi.reopen(final_baud)?;

        Ok(())
    }

    /// Fires the real trigger: shutter + strobe train, plus the conditional flush pulse
    /// that pushes the captured frame out of the sensor.
    pub fn send_external_trigger(&mut self, club: ClubType) -> Result<(), StrobeError> {
        self.send_trigger_and_shutter(club)?;

        if self.requires_flush_pulse {
            log::trace!("waiting a moment to send the flush trigger");
            std::thread::sleep(std::time::Duration::from_millis(self.pause_before_flush_ms));
            self.send_on_off_pulse(FLUSH_PULSE_US)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------- mock hardware

/// Records everything written to it; stands in for the kernel SPI driver. Writes block
/// for the time the real port would need to stream the buffer, so the shutter window
/// around them has a realistic width.
pub struct RecordingSpi {
    pub baud: u32,
    pub writes: Vec<Vec<u8>>
}

impl RecordingSpi {
    pub fn new() -> RecordingSpi {
        RecordingSpi{ baud: 0, writes: vec![] }
    }
}

impl SpiWriter for RecordingSpi {
    fn reopen(&mut self, baud: u32) -> Result<(), StrobeError> {
        self.baud = baud;
        Ok(())
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize, StrobeError> {
        if self.baud > 0 {
            let stream_time_us = buffer.len() as u64 * 8 * 1_000_000 / self.baud as u64;
            std::thread::sleep(std::time::Duration::from_micros(stream_time_us));
        }
        self.writes.push(buffer.to_vec());
        Ok(buffer.len())
    }
}

/// Records pin transitions with no timing.
pub struct RecordingPin {
    pub transitions: Vec<bool>
}

impl RecordingPin {
    pub fn new() -> RecordingPin {
        RecordingPin{ transitions: vec![] }
    }
}

impl TriggerPin for RecordingPin {
    fn set(&mut self, high: bool) -> Result<(), StrobeError> {
        self.transitions.push(high);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_of(buffer: &[u8]) -> Vec<bool> {
        let mut bits = Vec::with_capacity(buffer.len() * 8);
        for byte in buffer {
            for i in (0..8).rev() {
                bits.push(byte & (1 << i) != 0);
            }
        }
        bits
    }

    /// Recovers off-intervals from the bitstream by locating rising edges.
    fn parse_intervals(buffer: &[u8], baud: u32) -> Vec<f64> {
        let bits = bits_of(buffer);
        let mut rising_edges = vec![];
        for i in 0..bits.len() {
            if bits[i] && (i == 0 || !bits[i - 1]) {
                rising_edges.push(i);
            }
        }

        rising_edges.windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64 * 1000.0 / baud as f64)
            .collect()
    }

    #[test]
    fn on_pattern_bit_layout() {
        // no carry: four ones up front
        let (first, second, trailing) = next_two_pulse_bytes(0, 4).unwrap();
        assert_eq!(first, 0b1111_0000);
        assert_eq!(second, 0);
        assert_eq!(trailing, 12);

        // three carried zeros push the run right
        let (first, second, trailing) = next_two_pulse_bytes(3, 4).unwrap();
        assert_eq!(first, 0b0001_1110);
        assert_eq!(second, 0);
        assert_eq!(trailing, 9);

        // a wide pulse with a large carry spills into the second byte
        let (first, second, trailing) = next_two_pulse_bytes(7, 8).unwrap();
        assert_eq!(first, 0b0000_0001);
        assert_eq!(second, 0b1111_1110);
        assert_eq!(trailing, 1);
    }

    #[test]
    fn on_pulse_width_is_validated() {
        assert!(matches!(next_two_pulse_bytes(0, 0), Err(StrobeError::InvalidOnPulseWidth(0))));
        assert!(matches!(next_two_pulse_bytes(0, 9), Err(StrobeError::InvalidOnPulseWidth(9))));
    }

    #[test]
    fn buffer_is_word_aligned() {
        let buffer = build_pulse_train(200_000, &[2.0, 3.0, 5.0], 4).unwrap();
        assert_eq!(buffer.len() % 2, 0);
    }

    #[test]
    fn total_high_time_matches_pulse_count() {
        let intervals = [2.0, 2.5, 3.2, 4.0, 5.0];
        let on_bits = 4u32;
        let buffer = build_pulse_train(1_000_000, &intervals, on_bits).unwrap();

        let ones: u32 = buffer.iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones, on_bits * intervals.len() as u32);
    }

    #[test]
    fn bitstream_roundtrip_recovers_intervals() {
        let baud = 200_000u32;
        let intervals = [2.0, 2.5, 3.2, 4.0, 5.0, 6.3];
        let buffer = build_pulse_train(baud, &intervals, 4).unwrap();

        let recovered = parse_intervals(&buffer, baud);
        // every interval but the last is delimited by the next rising edge
        assert_eq!(recovered.len(), intervals.len() - 1);

        let one_bit_ms = 1000.0 / baud as f64;
        for (i, r) in recovered.iter().enumerate() {
            assert!(
                (r - intervals[i]).abs() <= one_bit_ms + 1.0e-9,
                "interval {}: recovered {} vs requested {}", i, r, intervals[i]
            );
        }
    }

    #[test]
    fn putter_train_roundtrip_at_slow_baud() {
        let baud = 115_200u32;
        let intervals = [12.0, 12.0, 14.0, 14.0, 16.0];
        let buffer = build_pulse_train(baud, &intervals, 6).unwrap();

        let recovered = parse_intervals(&buffer, baud);
        let one_bit_ms = 1000.0 / baud as f64;
        for (i, r) in recovered.iter().enumerate() {
            assert!((r - intervals[i]).abs() <= one_bit_ms + 1.0e-9);
        }
    }

    #[test]
    fn generator_raises_shutter_around_spi_write() {
        let config = StrobingConfig{
            num_priming_pulses: 0,
            ..StrobingConfig::default()
        };

        struct SharedPin(std::sync::Arc<std::sync::Mutex<Vec<bool>>>);
        impl TriggerPin for SharedPin {
            fn set(&mut self, high: bool) -> Result<(), StrobeError> {
                self.0.lock().unwrap().push(high);
                Ok(())
            }
        }
        struct SharedSpi(std::sync::Arc<std::sync::Mutex<Vec<usize>>>);
        impl SpiWriter for SharedSpi {
            fn reopen(&mut self, _baud: u32) -> Result<(), StrobeError> { Ok(()) }
            fn write(&mut self, buffer: &[u8]) -> Result<usize, StrobeError> {
                self.0.lock().unwrap().push(buffer.len());
                Ok(buffer.len())
            }
        }

        let pin_log = std::sync::Arc::new(std::sync::Mutex::new(vec![]));
        let spi_log = std::sync::Arc::new(std::sync::Mutex::new(vec![]));

        let mut generator = PulseGenerator::new(
            &config, false, 0,
            Box::new(SharedSpi(spi_log.clone())), Box::new(SharedPin(pin_log.clone()))
        ).unwrap();
        generator.send_external_trigger(ClubType::Driver).unwrap();

        assert_eq!(*pin_log.lock().unwrap(), vec![true, false]);
        assert_eq!(spi_log.lock().unwrap().len(), 1);
    }

    #[test]
    fn short_write_is_reported() {
        struct ShortSpi;
        impl SpiWriter for ShortSpi {
            fn reopen(&mut self, _baud: u32) -> Result<(), StrobeError> { Ok(()) }
            fn write(&mut self, buffer: &[u8]) -> Result<usize, StrobeError> {
                Ok(buffer.len() / 2)
            }
        }

        let config = StrobingConfig::default();
        let mut generator = PulseGenerator::new(
            &config, false, 0,
            Box::new(ShortSpi), Box::new(RecordingPin::new())
        ).unwrap();

        match generator.send_trigger_and_shutter(ClubType::Driver) {
            Err(StrobeError::ShortWrite{ sent, expected }) => assert!(sent < expected),
            other => panic!("expected ShortWrite, got {:?}", other.map(|_| ()))
        }
    }
}
