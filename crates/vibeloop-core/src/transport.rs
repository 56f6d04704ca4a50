//! Play/pause/stop/bpm state machine.
//!
//! `Stopped -> Playing -> Paused -> Playing -> Stopped`. The transport owns
//! the step index: the timing thread claims one step per tick through
//! [`Transport::claim_step`], and every state transition bumps an epoch so
//! the clock knows to re-arm.

use crate::error::{EngineError, Result};
use crate::timing::DEFAULT_BPM;
use serde::{Deserialize, Serialize};

/// Transport state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// What `stop()` does with the step index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Rewind to step 0.
    #[default]
    Reset,
    /// Keep the step index; the next `play()` continues from it.
    Preserve,
}

/// The engine's single transport.
#[derive(Clone, Debug)]
pub struct Transport {
    state: TransportState,
    bpm: f64,
    step_index: u64,
    epoch: u64,
    stop_policy: StopPolicy,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(DEFAULT_BPM, StopPolicy::default())
    }
}

impl Transport {
    /// Create a stopped transport at step 0.
    ///
    /// An invalid BPM falls back to the default tempo.
    pub fn new(bpm: f64, stop_policy: StopPolicy) -> Self {
        Self {
            state: TransportState::Stopped,
            bpm: if is_valid_bpm(bpm) { bpm } else { DEFAULT_BPM },
            step_index: 0,
            epoch: 0,
            stop_policy,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Next step to be fired.
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Counter bumped on every state transition.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    /// Stopped/Paused -> Playing. No-op if already playing.
    pub fn play(&mut self) -> TransportState {
        if self.state != TransportState::Playing {
            self.transition(TransportState::Playing);
        }
        self.state
    }

    /// Any state -> Stopped. Idempotent.
    pub fn stop(&mut self) -> TransportState {
        if self.stop_policy == StopPolicy::Reset {
            self.step_index = 0;
        }
        if self.state != TransportState::Stopped {
            self.transition(TransportState::Stopped);
        }
        self.state
    }

    /// Playing -> Paused. No-op otherwise.
    pub fn pause(&mut self) -> TransportState {
        if self.state == TransportState::Playing {
            self.transition(TransportState::Paused);
        }
        self.state
    }

    /// Change the tempo. Rejects non-positive and non-finite values.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<TransportState> {
        if !is_valid_bpm(bpm) {
            return Err(EngineError::InvalidParameter(format!(
                "bpm must be a positive number, got {}",
                bpm
            )));
        }
        self.bpm = bpm;
        Ok(self.state)
    }

    /// Take the next step for a tick: returns it and advances the index.
    ///
    /// Returns `None` unless playing.
    pub fn claim_step(&mut self) -> Option<u64> {
        if self.state != TransportState::Playing {
            return None;
        }
        let step = self.step_index;
        self.step_index = self.step_index.saturating_add(1);
        Some(step)
    }

    fn transition(&mut self, to: TransportState) {
        log::debug!(
            "[TRANSPORT] {:?} -> {:?} at step {}",
            self.state,
            to,
            self.step_index
        );
        self.state = to;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

fn is_valid_bpm(bpm: f64) -> bool {
    bpm.is_finite() && bpm > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(transport: &mut Transport, steps: u64) {
        for _ in 0..steps {
            transport.claim_step();
        }
    }

    #[test]
    fn test_transport_defaults() {
        let transport = Transport::default();
        assert_eq!(transport.state(), TransportState::Stopped);
        assert!((transport.bpm() - 120.0).abs() < 0.001);
        assert_eq!(transport.step_index(), 0);
    }

    #[test]
    fn test_state_machine() {
        let mut transport = Transport::default();
        assert_eq!(transport.pause(), TransportState::Stopped);
        assert_eq!(transport.play(), TransportState::Playing);
        assert_eq!(transport.play(), TransportState::Playing);
        assert_eq!(transport.pause(), TransportState::Paused);
        assert_eq!(transport.pause(), TransportState::Paused);
        assert_eq!(transport.play(), TransportState::Playing);
        assert_eq!(transport.stop(), TransportState::Stopped);
        assert_eq!(transport.stop(), TransportState::Stopped);
    }

    #[test]
    fn test_epoch_bumps_only_on_transitions() {
        let mut transport = Transport::default();
        transport.play();
        let epoch = transport.epoch();
        transport.play();
        assert_eq!(transport.epoch(), epoch);
        transport.pause();
        assert_eq!(transport.epoch(), epoch + 1);
        transport.stop();
        transport.stop();
        assert_eq!(transport.epoch(), epoch + 2);
    }

    #[test]
    fn test_claim_step_only_while_playing() {
        let mut transport = Transport::default();
        assert_eq!(transport.claim_step(), None);
        transport.play();
        assert_eq!(transport.claim_step(), Some(0));
        assert_eq!(transport.claim_step(), Some(1));
        transport.pause();
        assert_eq!(transport.claim_step(), None);
        assert_eq!(transport.step_index(), 2);
    }

    #[test]
    fn test_stop_then_play_resumes_at_zero() {
        let mut transport = Transport::default();
        transport.play();
        advance(&mut transport, 5);
        transport.stop();
        transport.play();
        assert_eq!(transport.claim_step(), Some(0));
    }

    #[test]
    fn test_pause_then_play_resumes_at_held_step() {
        let mut transport = Transport::default();
        transport.play();
        advance(&mut transport, 5);
        transport.pause();
        assert_eq!(transport.step_index(), 5);
        transport.play();
        assert_eq!(transport.claim_step(), Some(5));
    }

    #[test]
    fn test_stop_from_paused_resets() {
        let mut transport = Transport::default();
        transport.play();
        advance(&mut transport, 3);
        transport.pause();
        transport.stop();
        assert_eq!(transport.step_index(), 0);
    }

    #[test]
    fn test_preserve_policy_keeps_step_index() {
        let mut transport = Transport::new(120.0, StopPolicy::Preserve);
        transport.play();
        advance(&mut transport, 9);
        transport.stop();
        assert_eq!(transport.step_index(), 9);
        transport.play();
        assert_eq!(transport.claim_step(), Some(9));
    }

    #[test]
    fn test_set_bpm_validation() {
        let mut transport = Transport::default();
        transport.play();
        assert!(matches!(
            transport.set_bpm(0.0),
            Err(EngineError::InvalidParameter(_))
        ));
        assert!(transport.set_bpm(-1.0).is_err());
        assert!(transport.set_bpm(f64::NAN).is_err());
        assert!(transport.set_bpm(f64::INFINITY).is_err());
        assert!((transport.bpm() - 120.0).abs() < 0.001);
        assert_eq!(transport.state(), TransportState::Playing);

        assert_eq!(transport.set_bpm(140.0).unwrap(), TransportState::Playing);
        assert!((transport.bpm() - 140.0).abs() < 0.001);
    }

    #[test]
    fn test_invalid_initial_bpm_falls_back() {
        let transport = Transport::new(-3.0, StopPolicy::Reset);
        assert!((transport.bpm() - DEFAULT_BPM).abs() < 0.001);
    }
}
