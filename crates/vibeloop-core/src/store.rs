//! Track and scene store.
//!
//! The store holds mute/solo state, patterns and the active scene. The
//! engine keeps it behind an `Arc` and mutates it copy-on-write, so a tick
//! holding a snapshot never observes a partially applied change.

use crate::error::{EngineError, Result};
use crate::message::{SceneId, TrackId};
use crate::pattern::Pattern;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A track: a pattern plus mute/solo switches.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub muted: bool,
    pub soloed: bool,
    pub pattern: Arc<Pattern>,
}

impl Track {
    pub fn new(id: impl Into<TrackId>, pattern: Pattern) -> Self {
        Self {
            id: id.into(),
            muted: false,
            soloed: false,
            pattern: Arc::new(pattern),
        }
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn soloed(mut self, soloed: bool) -> Self {
        self.soloed = soloed;
        self
    }
}

/// A named selection of tracks, optionally with alternate patterns.
#[derive(Clone, Debug)]
pub struct Scene {
    pub id: SceneId,
    pub tracks: BTreeSet<TrackId>,
    pub overrides: HashMap<TrackId, Arc<Pattern>>,
}

impl Scene {
    pub fn new(id: impl Into<SceneId>, tracks: impl IntoIterator<Item = TrackId>) -> Self {
        Self {
            id: id.into(),
            tracks: tracks.into_iter().collect(),
            overrides: HashMap::new(),
        }
    }

    /// Play `pattern` instead of the track's own while this scene is active.
    pub fn with_override(mut self, track: impl Into<TrackId>, pattern: Pattern) -> Self {
        let track = track.into();
        self.tracks.insert(track.clone());
        self.overrides.insert(track, Arc::new(pattern));
        self
    }

    pub fn contains(&self, track: &TrackId) -> bool {
        self.tracks.contains(track)
    }
}

/// Read-only per-track status for snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrackStatus {
    pub id: TrackId,
    pub muted: bool,
    pub soloed: bool,
    pub audible: bool,
}

/// All tracks and scenes of an engine.
#[derive(Clone, Debug, Default)]
pub struct TrackStore {
    tracks: BTreeMap<TrackId, Track>,
    scenes: BTreeMap<SceneId, Arc<Scene>>,
    active_scene: Option<SceneId>,
    solo_count: usize,
}

impl TrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track, replacing any track with the same id.
    pub fn insert_track(&mut self, track: Track) -> Option<Track> {
        let previous = self.tracks.insert(track.id.clone(), track);
        self.recount_solos();
        previous
    }

    pub fn remove_track(&mut self, id: &str) -> Result<Track> {
        let track = self
            .tracks
            .remove(id)
            .ok_or_else(|| EngineError::track_not_found(id))?;
        self.recount_solos();
        Ok(track)
    }

    /// Replace a track's pattern.
    pub fn set_pattern(&mut self, id: &str, pattern: Pattern) -> Result<()> {
        let track = self.track_mut(id)?;
        track.pattern = Arc::new(pattern);
        Ok(())
    }

    /// Set a track's mute switch. Returns whether anything changed.
    pub fn mute(&mut self, id: &str, muted: bool) -> Result<bool> {
        let track = self.track_mut(id)?;
        if track.muted == muted {
            return Ok(false);
        }
        track.muted = muted;
        Ok(true)
    }

    /// Set a track's solo switch. Returns whether anything changed.
    pub fn solo(&mut self, id: &str, soloed: bool) -> Result<bool> {
        let track = self.track_mut(id)?;
        if track.soloed == soloed {
            return Ok(false);
        }
        track.soloed = soloed;
        self.recount_solos();
        Ok(true)
    }

    /// Add a scene, replacing any scene with the same id.
    ///
    /// Replacing the active scene keeps it active with the new contents.
    pub fn insert_scene(&mut self, scene: Scene) {
        self.scenes.insert(scene.id.clone(), Arc::new(scene));
    }

    /// Make `id` the only active scene.
    ///
    /// Unknown ids leave the current scene active.
    pub fn activate_scene(&mut self, id: &str) -> Result<bool> {
        let scene_id = self
            .scenes
            .get_key_value(id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| EngineError::scene_not_found(id))?;
        if self.active_scene.as_ref() == Some(&scene_id) {
            return Ok(false);
        }
        self.active_scene = Some(scene_id);
        Ok(true)
    }

    /// Return to playing every track. Returns the scene that was active.
    pub fn deactivate_scene(&mut self) -> Option<SceneId> {
        self.active_scene.take()
    }

    pub fn track(&self, id: &str) -> Option<&Track> {
        self.tracks.get(id)
    }

    fn track_mut(&mut self, id: &str) -> Result<&mut Track> {
        self.tracks
            .get_mut(id)
            .ok_or_else(|| EngineError::track_not_found(id))
    }

    /// Tracks in id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn scene(&self, id: &str) -> Option<&Scene> {
        self.scenes.get(id).map(Arc::as_ref)
    }

    pub fn scenes(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values().map(Arc::as_ref)
    }

    pub fn active_scene_id(&self) -> Option<&SceneId> {
        self.active_scene.as_ref()
    }

    pub fn active_scene(&self) -> Option<&Scene> {
        self.active_scene
            .as_ref()
            .and_then(|id| self.scenes.get(id))
            .map(Arc::as_ref)
    }

    pub fn any_soloed(&self) -> bool {
        self.solo_count > 0
    }

    /// `soloed OR (no track is soloed AND NOT muted)`.
    pub fn is_effectively_audible(&self, track: &Track) -> bool {
        track.soloed || (!self.any_soloed() && !track.muted)
    }

    pub fn is_audible(&self, id: &str) -> Result<bool> {
        self.tracks
            .get(id)
            .map(|track| self.is_effectively_audible(track))
            .ok_or_else(|| EngineError::track_not_found(id))
    }

    pub fn track_statuses(&self) -> Vec<TrackStatus> {
        self.tracks
            .values()
            .map(|track| TrackStatus {
                id: track.id.clone(),
                muted: track.muted,
                soloed: track.soloed,
                audible: self.is_effectively_audible(track),
            })
            .collect()
    }

    fn recount_solos(&mut self) {
        self.solo_count = self.tracks.values().filter(|t| t.soloed).count();
    }
}
