//! Step patterns.
//!
//! A [`Pattern`] is a cycle of step slots; each slot holds the message
//! templates emitted when the slot comes round. Step `n` of a run plays slot
//! `n % len`. Patterns are usually written as step strings:
//!
//! ```text
//! x...x...x...x...   four on the floor
//! ..x. ..x. | ..xx   whitespace and bars are ignored
//! ```

use crate::error::{EngineError, Result};
use crate::message::Message;

/// Longest cycle a pattern may have, in steps.
pub const MAX_STEPS: usize = 4096;

/// A cyclic sequence of step slots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pattern {
    slots: Vec<Vec<Message>>,
}

impl Pattern {
    /// Build a pattern from explicit slots.
    pub fn new(slots: Vec<Vec<Message>>) -> Self {
        Self { slots }
    }

    /// Build a pattern that plays `template` on every hit of a step string.
    pub fn from_steps(steps: &str, template: Message) -> Result<Self> {
        let hits = parse_steps(steps)?;
        Ok(Self::from_hits(&hits, template))
    }

    /// Euclidean rhythm: `hits` onsets spread evenly over `steps` slots.
    pub fn euclid(hits: usize, steps: usize, template: Message) -> Result<Self> {
        check_len(steps)?;
        Ok(Self::from_hits(&euclidean_hits(hits, steps), template))
    }

    fn from_hits(hits: &[bool], template: Message) -> Self {
        let slots = hits
            .iter()
            .map(|hit| if *hit { vec![template.clone()] } else { Vec::new() })
            .collect();
        Self { slots }
    }

    /// Number of slots in one cycle.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Messages for a run step. Empty patterns yield nothing.
    pub fn slot(&self, step: u64) -> &[Message] {
        if self.slots.is_empty() {
            return &[];
        }
        let index = (step % self.slots.len() as u64) as usize;
        &self.slots[index]
    }

    /// Render the onsets back as a step string.
    pub fn to_step_string(&self) -> String {
        self.slots
            .iter()
            .map(|slot| if slot.is_empty() { '.' } else { 'x' })
            .collect()
    }
}

/// Parse a step string into hits.
///
/// `x`/`X` is a hit, `.`, `-` and `_` are rests; whitespace and `|` are
/// ignored. Anything else is rejected.
pub fn parse_steps(steps: &str) -> Result<Vec<bool>> {
    let mut hits = Vec::with_capacity(steps.len());
    for (pos, ch) in steps.chars().enumerate() {
        match ch {
            'x' | 'X' => hits.push(true),
            '.' | '-' | '_' => hits.push(false),
            '|' => {}
            c if c.is_whitespace() => {}
            other => {
                return Err(EngineError::InvalidParameter(format!(
                    "invalid step character '{}' at position {} in \"{}\"",
                    other, pos, steps
                )))
            }
        }
    }
    check_len(hits.len())?;
    Ok(hits)
}

fn check_len(steps: usize) -> Result<()> {
    if steps > MAX_STEPS {
        return Err(EngineError::InvalidParameter(format!(
            "pattern has {} steps, at most {} are allowed",
            steps, MAX_STEPS
        )));
    }
    Ok(())
}

/// Bresenham-style Euclidean distribution of `hits` over `steps`.
pub fn euclidean_hits(hits: usize, steps: usize) -> Vec<bool> {
    if steps == 0 {
        return Vec::new();
    }
    if hits >= steps {
        return vec![true; steps];
    }

    let mut pattern = vec![false; steps];
    // Start the bucket full so the first hit lands on the downbeat.
    let mut bucket = if hits > 0 { steps - hits } else { 0 };
    for slot in pattern.iter_mut() {
        bucket += hits;
        if bucket >= steps {
            bucket -= steps;
            *slot = true;
        }
    }
    pattern
}
