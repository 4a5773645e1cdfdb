//! Getting the boot ROM from reset to a state where it answers commands.
//!
//! The sequence is fixed: a reset echo, baud rate sync, device type query,
//! frequency and bitrate negotiation, and finally a synchronize command. On
//! an ID-code-protected part that last one is refused with "serial
//! programmer connection prohibited" unless the glitch landed. Every
//! response is matched against the exact bytes we expect; anything else ends
//! the handshake. There are no local retries.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::{
    link::{self, Link},
    packet::{self, Packet},
    Error, Failure, Stage, TargetProfile,
};

/// Boot ROM command codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Cmd {
    /// First command subject to the ID code check.
    Synchronize = 0x00,
    ReadMemory = 0x15,
    SetFrequency = 0x32,
    SetBitrate = 0x34,
    GetDeviceType = 0x38,
}

impl Cmd {
    /// Human readable name for the command a status byte refers to.
    pub fn describe(status: u8) -> String {
        let error = status & packet::STATUS_ERROR != 0;
        match (Cmd::from_u8(status & !packet::STATUS_ERROR), error) {
            (Some(cmd), false) => format!("{cmd:?}"),
            (Some(cmd), true) => format!("{cmd:?} error"),
            (None, _) => format!("unknown status {status:#04x}"),
        }
    }
}

/// Number of null bytes sent to get the reset echo.
const RESET_NULLS: usize = 10;
const BAUD_SYNC: u8 = 0x55;
const BAUD_SYNC_ACK: u8 = 0xC1;

/// Total size of the device type response packet.
pub const DEVICE_TYPE_RESPONSE_LEN: usize = 30;
/// Total size of the frequency confirmation packet.
pub const FREQUENCY_RESPONSE_LEN: usize = 14;
/// Longest response the glitch check cares about.
const GLITCH_CHECK_RESPONSE_LEN: usize = 7;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min: u32,
    pub max: u32,
}

/// What the boot ROM reports about itself in response to the device type
/// query.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BootDeviceInfo {
    pub device_type: [u8; 8],
    /// Acceptable input (oscillator) frequencies, Hz.
    pub oscillator: FrequencyRange,
    /// Acceptable system clock frequencies, Hz.
    pub system_clock: FrequencyRange,
}

impl BootDeviceInfo {
    const PAYLOAD_LEN: usize = 24;

    /// Payload of the device type response, as the part sends it.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PAYLOAD_LEN);
        out.extend_from_slice(&self.device_type);
        out.extend(self.oscillator.max.to_be_bytes());
        out.extend(self.oscillator.min.to_be_bytes());
        out.extend(self.system_clock.max.to_be_bytes());
        out.extend(self.system_clock.min.to_be_bytes());
        out
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::PAYLOAD_LEN {
            return None;
        }
        let word = |i: usize| {
            u32::from_be_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
        };
        let mut device_type = [0; 8];
        device_type.copy_from_slice(&payload[..8]);
        Some(BootDeviceInfo {
            device_type,
            oscillator: FrequencyRange { max: word(8), min: word(12) },
            system_clock: FrequencyRange { max: word(16), min: word(20) },
        })
    }

    /// The complete packet the part answers the device type query with.
    pub fn response(&self) -> Vec<u8> {
        Packet::data(Cmd::GetDeviceType as u8, &self.to_payload()).encode()
    }
}

/// Clocks the part settled on after frequency negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NegotiatedClocks {
    pub system_hz: u32,
    pub peripheral_hz: u32,
}

/// Proof of a successful handshake. Only lives as long as the attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootSession {
    pub device: BootDeviceInfo,
    pub clocks: NegotiatedClocks,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Synchronizing,
    DeviceTypeQuery,
    FrequencySet,
    BitrateSet,
    GlitchCheck,
    Unlocked,
    Failed(Stage),
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Unlocked | State::Failed(_))
    }
}

/// One pass through the boot ROM negotiation. Make a new one per attempt.
pub struct Handshake<'a, L: Link + ?Sized> {
    link: &'a mut L,
    profile: &'a TargetProfile,
    state: State,
    device: Option<BootDeviceInfo>,
    clocks: Option<NegotiatedClocks>,
}

impl<'a, L: Link + ?Sized> Handshake<'a, L> {
    pub fn new(link: &'a mut L, profile: &'a TargetProfile) -> Self {
        Handshake { link, profile, state: State::Idle, device: None, clocks: None }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Performs the reset echo on its own. The part always answers this one,
    /// glitch or no glitch, so silence here means the control channel itself
    /// is broken; that comes back as [`Error::ControlChannelDropped`] rather
    /// than a handshake failure.
    pub fn probe(&mut self) -> Result<(), Error> {
        assert_eq!(self.state, State::Idle, "probe must come first");
        match self.step() {
            Ok(_) => Ok(()),
            Err(Error::HandshakeFailed { stage: Stage::ResetEcho, cause: Failure::Unexpected(observed) }) => {
                Err(Error::ControlChannelDropped { observed })
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the remaining exchanges to a terminal state.
    pub fn run(mut self) -> Result<BootSession, Error> {
        while !self.state.is_terminal() {
            self.step()?;
        }
        match (self.state, self.device, self.clocks) {
            (State::Unlocked, Some(device), Some(clocks)) => Ok(BootSession { device, clocks }),
            (state, ..) => Err(Error::Protocol(format!("handshake stuck in {state:?}").into())),
        }
    }

    /// Performs one exchange and moves to the next state. Does nothing once
    /// terminal.
    pub fn step(&mut self) -> Result<State, Error> {
        let (stage, result) = match self.state {
            State::Idle => (Stage::ResetEcho, self.reset_echo()),
            State::Synchronizing => (Stage::Sync, self.baud_sync()),
            State::DeviceTypeQuery => (Stage::DeviceType, self.device_type()),
            State::FrequencySet => (Stage::FrequencySet, self.frequency_set()),
            State::BitrateSet => (Stage::BitrateSet, self.bitrate_set()),
            State::GlitchCheck => (Stage::GlitchCheck, self.glitch_check()),
            terminal => return Ok(terminal),
        };

        match result {
            Ok(Ok(next)) => {
                log::debug!("{stage} ok");
                self.state = next;
                Ok(next)
            }
            Ok(Err(cause)) => {
                self.state = State::Failed(stage);
                Err(Error::HandshakeFailed { stage, cause })
            }
            Err(e) => {
                self.state = State::Failed(stage);
                Err(Error::Context(format!("during {stage}").into(), Box::new(e)))
            }
        }
    }

    // Each exchange returns Ok(Err(..)) when the part answered wrongly and
    // Err(..) when the port itself failed.

    fn reset_echo(&mut self) -> Result<Result<State, Failure>, Error> {
        link::send(self.link, &[0; RESET_NULLS])?;
        self.expect(&[0x00], State::Synchronizing)
    }

    fn baud_sync(&mut self) -> Result<Result<State, Failure>, Error> {
        link::send(self.link, &[BAUD_SYNC])?;
        self.expect(&[BAUD_SYNC_ACK], State::DeviceTypeQuery)
    }

    fn device_type(&mut self) -> Result<Result<State, Failure>, Error> {
        let expected = self.profile.device.response();
        debug_assert_eq!(expected.len(), DEVICE_TYPE_RESPONSE_LEN);

        let observed = self.exchange_two_part(Cmd::GetDeviceType, &[], expected.len())?;
        let observed = match observed {
            Ok(bytes) => bytes,
            Err(f) => return Ok(Err(f)),
        };
        if observed != expected {
            return Ok(Err(Failure::Unexpected(observed)));
        }

        self.device = packet::verify(&observed)
            .ok()
            .and_then(|p| BootDeviceInfo::from_payload(&p.payload));
        if let Some(device) = &self.device {
            log::debug!("device type {:02x?}", device.device_type);
        }
        Ok(Ok(State::FrequencySet))
    }

    fn frequency_set(&mut self) -> Result<Result<State, Failure>, Error> {
        let mut request = vec![];
        request.extend(self.profile.oscillator_hz.to_be_bytes());
        request.extend(self.profile.system_clock_hz.to_be_bytes());

        let observed = match self.exchange_two_part(Cmd::SetFrequency, &request, FREQUENCY_RESPONSE_LEN)? {
            Ok(bytes) => bytes,
            Err(f) => return Ok(Err(f)),
        };

        let clocks = match packet::verify(&observed) {
            Ok(p) if p.command == Cmd::SetFrequency as u8 && p.payload.len() == 8 => NegotiatedClocks {
                system_hz: u32::from_be_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]),
                peripheral_hz: u32::from_be_bytes([p.payload[4], p.payload[5], p.payload[6], p.payload[7]]),
            },
            _ => return Ok(Err(Failure::Unexpected(observed))),
        };
        if clocks != self.profile.expected_clocks() {
            log::debug!("negotiated {clocks:?}, wanted {:?}", self.profile.expected_clocks());
            return Ok(Err(Failure::Unexpected(observed)));
        }

        self.clocks = Some(clocks);
        Ok(Ok(State::BitrateSet))
    }

    fn bitrate_set(&mut self) -> Result<Result<State, Failure>, Error> {
        let request = Packet::command(Cmd::SetBitrate, &self.profile.bitrate.to_be_bytes());
        link::send(self.link, &request.encode())?;
        self.expect(&Packet::ack(Cmd::SetBitrate).encode(), State::GlitchCheck)
    }

    fn glitch_check(&mut self) -> Result<Result<State, Failure>, Error> {
        link::send(self.link, &Packet::command(Cmd::Synchronize, &[]).encode())?;

        // Read as much as the head announces, so a success doesn't sit
        // waiting out the timeout for bytes that are never coming.
        let mut observed = link::read_up_to(self.link, 3)?;
        if let [start, hi, lo] = observed[..] {
            if let Ok(len) = Packet::announced_payload_len([start, hi, lo]) {
                let rest = (len + 3).min(GLITCH_CHECK_RESPONSE_LEN - 3);
                observed.extend(link::read_up_to(self.link, rest)?);
            }
        }

        if observed == Packet::ack(Cmd::Synchronize).encode() {
            Ok(Ok(State::Unlocked))
        } else if observed == Packet::error(Cmd::Synchronize, packet::ERR_PROHIBITED).encode() {
            Ok(Err(Failure::ProtectionHeld))
        } else {
            Ok(Err(Failure::Unexpected(observed)))
        }
    }

    /// Sends `cmd`, expects its ack, then acks back to fetch the
    /// `response_len` byte response, which is returned unexamined.
    fn exchange_two_part(
        &mut self,
        cmd: Cmd,
        payload: &[u8],
        response_len: usize,
    ) -> Result<Result<Vec<u8>, Failure>, Error> {
        let ack = Packet::ack(cmd).encode();

        link::send(self.link, &Packet::command(cmd, payload).encode())?;
        let observed = link::read_up_to(self.link, ack.len())?;
        if observed != ack {
            return Ok(Err(Failure::Unexpected(observed)));
        }

        link::send(self.link, &ack)?;
        Ok(Ok(link::read_up_to(self.link, response_len)?))
    }

    fn expect(&mut self, expected: &[u8], next: State) -> Result<Result<State, Failure>, Error> {
        let observed = link::read_up_to(self.link, expected.len())?;
        if observed == expected {
            Ok(Ok(next))
        } else {
            Ok(Err(Failure::Unexpected(observed)))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::script::ScriptedLink;

    fn run(device: Vec<u8>) -> (Result<BootSession, Error>, ScriptedLink) {
        let profile = TargetProfile::default();
        let mut link = ScriptedLink::with_rx(&device);
        let result = Handshake::new(&mut link, &profile).run();
        (result, link)
    }

    fn failed_at(result: Result<BootSession, Error>) -> (Stage, Failure) {
        match result {
            Err(Error::HandshakeFailed { stage, cause }) => (stage, cause),
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn device_type_response_matches_captured_bytes() {
        let profile = TargetProfile::default();
        assert_eq!(
            profile.device.response(),
            [
                0x81, 0x00, 0x19, 0x38, 0x10, 0x01, 0xff, 0x40, 0x00, 0x28, 0x2c, 0x00, 0x00, 0xf4,
                0x24, 0x00, 0x00, 0xf4, 0x24, 0x00, 0x09, 0x89, 0x68, 0x00, 0x09, 0x89, 0x68, 0x00,
                0xe7, 0x03,
            ],
        );
        assert_eq!(
            canned::frequency_response(&profile),
            [0x81, 0x00, 0x09, 0x32, 0x09, 0x89, 0x68, 0x00, 0x02, 0x62, 0x5a, 0x00, 0x0d, 0x03],
        );
    }

    #[test]
    fn unlocks_when_everything_matches() {
        let profile = TargetProfile::default();
        let (result, link) = run(canned::unlocked(&profile));
        let session = result.unwrap();
        assert_eq!(session.device, profile.device);
        assert_eq!(session.clocks, NegotiatedClocks { system_hz: 160_000_000, peripheral_hz: 40_000_000 });

        let mut expected_tx = vec![0; 10];
        expected_tx.push(0x55);
        expected_tx.extend([0x01, 0x00, 0x01, 0x38, 0xc7, 0x03]);
        expected_tx.extend([0x81, 0x00, 0x01, 0x38, 0xc7, 0x03]);
        expected_tx.extend([0x01, 0x00, 0x09, 0x32, 0x00, 0xf4, 0x24, 0x00, 0x09, 0x89, 0x68, 0x00, 0xb3, 0x03]);
        expected_tx.extend([0x81, 0x00, 0x01, 0x32, 0xcd, 0x03]);
        expected_tx.extend([0x01, 0x00, 0x05, 0x34, 0x00, 0x00, 0x25, 0x80, 0x22, 0x03]);
        expected_tx.extend([0x01, 0x00, 0x01, 0x00, 0xff, 0x03]);
        assert_eq!(link.sent, expected_tx);
    }

    #[test]
    fn same_responses_same_outcome() {
        let profile = TargetProfile::default();
        let scripts = [canned::unlocked(&profile), canned::prohibited(&profile), vec![0x00, 0xc2]];
        for script in scripts {
            let first = format!("{:?}", run(script.clone()).0);
            for _ in 0..3 {
                assert_eq!(format!("{:?}", run(script.clone()).0), first);
            }
        }
    }

    #[test]
    fn one_wrong_device_type_byte_fails_there() {
        let profile = TargetProfile::default();
        for i in 0..DEVICE_TYPE_RESPONSE_LEN {
            let mut device = canned::unlocked(&profile);
            // reset echo, sync ack, then the 6 byte ack precede the response
            device[8 + i] ^= 0x01;
            let (stage, cause) = failed_at(run(device).0);
            assert_eq!(stage, Stage::DeviceType, "byte {i}");
            assert!(matches!(cause, Failure::Unexpected(_)));
        }
    }

    #[test]
    fn device_type_match_moves_on_to_frequency() {
        let profile = TargetProfile::default();
        let device = canned::unlocked(&profile);
        let mut link = ScriptedLink::with_rx(&device);
        let mut hs = Handshake::new(&mut link, &profile);
        assert_eq!(hs.step().unwrap(), State::Synchronizing);
        assert_eq!(hs.step().unwrap(), State::DeviceTypeQuery);
        assert_eq!(hs.step().unwrap(), State::FrequencySet);
        assert_eq!(hs.step().unwrap(), State::BitrateSet);
    }

    #[test]
    fn prohibition_is_a_clean_failure() {
        let profile = TargetProfile::default();
        let (result, _) = run(canned::prohibited(&profile));
        let err = result.unwrap_err();
        assert!(err.is_protection_held());
        assert!(matches!(err, Error::HandshakeFailed { stage: Stage::GlitchCheck, .. }));
    }

    #[test]
    fn garbage_at_glitch_check_is_ambiguous() {
        let profile = TargetProfile::default();
        let mut device = canned::through_bitrate(&profile);
        device.extend([0x81, 0x00, 0x02]);
        let (stage, cause) = failed_at(run(device).0);
        assert_eq!(stage, Stage::GlitchCheck);
        assert_eq!(cause, Failure::Unexpected(vec![0x81, 0x00, 0x02]));

        let (stage, cause) = failed_at(run(canned::through_bitrate(&profile)).0);
        assert_eq!(stage, Stage::GlitchCheck);
        assert_eq!(cause, Failure::Unexpected(vec![]));
    }

    #[test]
    fn early_stages_report_what_they_saw() {
        assert_eq!(failed_at(run(vec![]).0), (Stage::ResetEcho, Failure::Unexpected(vec![])));
        assert_eq!(failed_at(run(vec![0x00, 0xc2]).0), (Stage::Sync, Failure::Unexpected(vec![0xc2])));

        let profile = TargetProfile::default();
        let mut device = canned::through_bitrate(&profile);
        let len = device.len();
        device[len - 2] ^= 0xff;
        assert_eq!(failed_at(run(device).0).0, Stage::BitrateSet);
    }

    #[test]
    fn wrong_negotiated_clock_fails_frequency_set() {
        let mut profile = TargetProfile::default();
        let device = canned::unlocked(&profile);
        profile.peripheral_clock_hz = 80_000_000;

        let mut link = ScriptedLink::with_rx(&device);
        let err = Handshake::new(&mut link, &profile).run().unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { stage: Stage::FrequencySet, .. }));
    }

    #[test]
    fn probe_reports_dropped_channel() {
        let profile = TargetProfile::default();
        let mut link = ScriptedLink::new();
        let mut hs = Handshake::new(&mut link, &profile);
        assert!(matches!(hs.probe(), Err(Error::ControlChannelDropped { .. })));
        assert_eq!(hs.state(), State::Failed(Stage::ResetEcho));

        let device = canned::unlocked(&profile);
        let mut link = ScriptedLink::with_rx(&device);
        let mut hs = Handshake::new(&mut link, &profile);
        hs.probe().unwrap();
        assert_eq!(hs.state(), State::Synchronizing);
        hs.run().unwrap();
    }

    #[test]
    fn describes_status_bytes() {
        assert_eq!(Cmd::describe(0x15), "ReadMemory");
        assert_eq!(Cmd::describe(0x80), "Synchronize error");
        assert_eq!(Cmd::describe(0x99), "unknown status 0x99");
    }
}
