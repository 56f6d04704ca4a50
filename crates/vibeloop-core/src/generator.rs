//! Step event generator.
//!
//! Pure function from `(step_index, store snapshot)` to the candidate
//! messages of one tick. No I/O, no side effects.

use crate::message::Message;
use crate::store::TrackStore;

/// Produce the raw messages for `step_index`.
///
/// Tracks are visited in id order. A track contributes only if it is
/// effectively audible and, while a scene is active, a member of that
/// scene; a scene override pattern replaces the track's own pattern.
pub fn generate(step_index: u64, store: &TrackStore) -> Vec<Message> {
    let scene = store.active_scene();
    let mut messages = Vec::new();

    for track in store.tracks() {
        if !store.is_effectively_audible(track) {
            continue;
        }
        let pattern = match scene {
            Some(scene) if !scene.contains(&track.id) => continue,
            Some(scene) => scene.overrides.get(&track.id).unwrap_or(&track.pattern),
            None => &track.pattern,
        };
        for template in pattern.slot(step_index) {
            let mut message = template.clone();
            message.origin = Some(track.id.clone());
            messages.push(message);
        }
    }

    messages
}
