//! Play synchronization: a prepare/start/release barrier per dialog turn.
//!
//! Renderers and players of one dialog turn register as [`SynchronizeObject`]s.
//! Each moves from `prepared` to `started`; when the last preparing object
//! leaves, the started ones are asked to release cooperatively. Nothing here
//! times out: an object that never releases keeps its context alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::Span;

use crate::observer::same_instance;
use crate::utils;

/// A renderer or player taking part in a dialog turn.
pub trait SynchronizeObject: Send + Sync {
    fn dialog_request_id(&self) -> String;

    /// Tear down now (`immediate`) or when convenient.
    fn request_release_sync(&self, immediate: bool);

    /// Membership of this object's dialog turn after a change.
    fn on_sync_state_changed(
        &self,
        prepared: &[Arc<dyn SynchronizeObject>],
        started: &[Arc<dyn SynchronizeObject>],
    );
}

/// Answer to a start or release request.
pub trait OnRequestSyncListener {
    fn on_granted(&self);
    fn on_denied(&self);
}

type Objects = Vec<Arc<dyn SynchronizeObject>>;

#[derive(Default)]
struct ContextInfo {
    prepared: Objects,
    started: Objects,
}

impl ContextInfo {
    fn is_empty(&self) -> bool {
        self.prepared.is_empty() && self.started.is_empty()
    }

    fn contains(&self, object: &Arc<dyn SynchronizeObject>) -> bool {
        self.prepared.iter().chain(&self.started).any(|o| same_instance(o, object))
    }

    fn members(&self) -> Objects {
        self.prepared.iter().chain(&self.started).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Prepared,
    Started,
}

fn remove_from(objects: &mut Objects, object: &Arc<dyn SynchronizeObject>) -> bool {
    let before = objects.len();
    objects.retain(|o| !same_instance(o, object));
    objects.len() != before
}

/// Work to do once the lock is released.
#[derive(Default)]
struct Notifications {
    /// Objects to tell about the new membership, with the snapshot to send.
    changed: Vec<Arc<dyn SynchronizeObject>>,
    prepared: Objects,
    started: Objects,
    release: Objects,
    immediate: bool,
}

impl Notifications {
    fn snapshot(info: Option<&ContextInfo>, leaving: Option<&Arc<dyn SynchronizeObject>>) -> Self {
        let (prepared, started) = info
            .map(|i| (i.prepared.clone(), i.started.clone()))
            .unwrap_or_default();
        let mut changed: Objects = prepared.iter().chain(&started).cloned().collect();
        if let Some(leaving) = leaving {
            changed.push(Arc::clone(leaving));
        }
        Self {
            changed,
            prepared,
            started,
            ..Self::default()
        }
    }

    fn send(self) {
        for object in &self.release {
            object.request_release_sync(self.immediate);
        }
        for object in &self.changed {
            object.on_sync_state_changed(&self.prepared, &self.started);
        }
    }
}

/// Prepare/start/release barrier keyed by dialog request id.
///
/// One mutex per instance. Objects and listeners are called after it is
/// released, so they may call back into the synchronizer.
pub struct PlaySynchronizer {
    contexts: Mutex<HashMap<String, ContextInfo>>,
    span: Span,
}

impl PlaySynchronizer {
    pub fn new() -> Self {
        Self::with_span(tracing::info_span!("play_sync"))
    }

    pub fn with_span(span: Span) -> Self {
        Self {
            contexts: Mutex::default(),
            span,
        }
    }

    /// Register `object` as preparing for its dialog turn.
    pub fn prepare_sync(&self, object: &Arc<dyn SynchronizeObject>) {
        let _guard = self.span.enter();
        let dialog_request_id = object.dialog_request_id();

        let notifications = {
            let mut contexts = utils::lock(&self.contexts);
            let info = contexts.entry(dialog_request_id.clone()).or_default();
            if info.contains(object) {
                tracing::debug!(%dialog_request_id, "Object already synchronized");
                return;
            }
            info.prepared.push(Arc::clone(object));
            Notifications::snapshot(Some(info), None)
        };

        tracing::debug!(%dialog_request_id, "Prepared");
        notifications.send();
    }

    /// Move `object` from prepared to started.
    ///
    /// Granted if it was prepared (or had already started), denied otherwise.
    pub fn start_sync(&self, object: &Arc<dyn SynchronizeObject>, listener: &dyn OnRequestSyncListener) {
        let _guard = self.span.enter();
        let dialog_request_id = object.dialog_request_id();

        let outcome = {
            let mut contexts = utils::lock(&self.contexts);
            contexts.get_mut(&dialog_request_id).and_then(|info| {
                if remove_from(&mut info.prepared, object) {
                    info.started.push(Arc::clone(object));
                    Some(Some(Notifications::snapshot(Some(info), None)))
                } else if info.started.iter().any(|o| same_instance(o, object)) {
                    Some(None)
                } else {
                    None
                }
            })
        };

        match outcome {
            Some(notifications) => {
                tracing::debug!(%dialog_request_id, "Start granted");
                if let Some(notifications) = notifications {
                    notifications.send();
                }
                listener.on_granted();
            }
            None => {
                tracing::debug!(%dialog_request_id, "Start denied, object was never prepared");
                listener.on_denied();
            }
        }
    }

    /// Finish: remove `object`. If that empties `prepared`, the started
    /// objects are asked to release cooperatively.
    pub fn release_sync(&self, object: &Arc<dyn SynchronizeObject>, listener: &dyn OnRequestSyncListener) {
        let _guard = self.span.enter();
        let dialog_request_id = object.dialog_request_id();

        let Some((from, mut notifications)) = self.remove(&dialog_request_id, object) else {
            tracing::debug!(%dialog_request_id, "Release denied, object not synchronized");
            listener.on_denied();
            return;
        };

        if from == Membership::Prepared && notifications.prepared.is_empty() {
            tracing::debug!(%dialog_request_id, started = notifications.started.len(), "Nothing left preparing, releasing started objects");
            notifications.release.clone_from(&notifications.started);
        }
        notifications.send();
        listener.on_granted();
    }

    /// Cancel: remove `object` and force every other object of the turn to
    /// release immediately, whether or not `object` was found.
    pub fn release_sync_immediately(
        &self,
        object: &Arc<dyn SynchronizeObject>,
        listener: &dyn OnRequestSyncListener,
    ) {
        let _guard = self.span.enter();
        let dialog_request_id = object.dialog_request_id();

        let (found, mut notifications) = match self.remove(&dialog_request_id, object) {
            Some((_, notifications)) => (true, notifications),
            None => {
                let contexts = utils::lock(&self.contexts);
                (false, Notifications::snapshot(contexts.get(&dialog_request_id), None))
            }
        };

        notifications.release = notifications
            .prepared
            .iter()
            .chain(&notifications.started)
            .cloned()
            .collect();
        notifications.immediate = true;
        tracing::debug!(%dialog_request_id, found, released = notifications.release.len(), "Releasing immediately");
        notifications.send();

        if found {
            listener.on_granted();
        } else {
            listener.on_denied();
        }
    }

    /// Remove `object` without touching the other objects of its turn.
    pub fn release_without_sync(&self, object: &Arc<dyn SynchronizeObject>) {
        let _guard = self.span.enter();
        let dialog_request_id = object.dialog_request_id();
        if let Some((_, notifications)) = self.remove(&dialog_request_id, object) {
            tracing::debug!(%dialog_request_id, "Released without sync");
            notifications.send();
        }
    }

    /// Whether another object shares `object`'s dialog turn.
    pub fn exist_other_sync_object(&self, object: &Arc<dyn SynchronizeObject>) -> bool {
        let contexts = utils::lock(&self.contexts);
        contexts
            .get(&object.dialog_request_id())
            .is_some_and(|info| info.members().iter().any(|o| !same_instance(o, object)))
    }

    pub fn has_context(&self, dialog_request_id: &str) -> bool {
        utils::lock(&self.contexts).contains_key(dialog_request_id)
    }

    /// Number of dialog turns with at least one object.
    pub fn context_count(&self) -> usize {
        utils::lock(&self.contexts).len()
    }

    fn remove(
        &self,
        dialog_request_id: &str,
        object: &Arc<dyn SynchronizeObject>,
    ) -> Option<(Membership, Notifications)> {
        let mut contexts = utils::lock(&self.contexts);
        let info = contexts.get_mut(dialog_request_id)?;

        let from = if remove_from(&mut info.prepared, object) {
            Membership::Prepared
        } else if remove_from(&mut info.started, object) {
            Membership::Started
        } else {
            return None;
        };

        let notifications = Notifications::snapshot(Some(info), Some(object));
        if info.is_empty() {
            contexts.remove(dialog_request_id);
            tracing::debug!(%dialog_request_id, "Context finished");
        }
        Some((from, notifications))
    }
}

impl Default for PlaySynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Player {
        dialog_request_id: String,
        releases: Mutex<Vec<bool>>,
        last_state: Mutex<(usize, usize)>,
    }

    impl Player {
        fn new(dialog_request_id: &str) -> Arc<Self> {
            Arc::new(Self {
                dialog_request_id: dialog_request_id.into(),
                releases: Mutex::default(),
                last_state: Mutex::default(),
            })
        }

        fn releases(&self) -> Vec<bool> {
            self.releases.lock().unwrap().clone()
        }
    }

    impl SynchronizeObject for Player {
        fn dialog_request_id(&self) -> String {
            self.dialog_request_id.clone()
        }

        fn request_release_sync(&self, immediate: bool) {
            self.releases.lock().unwrap().push(immediate);
        }

        fn on_sync_state_changed(
            &self,
            prepared: &[Arc<dyn SynchronizeObject>],
            started: &[Arc<dyn SynchronizeObject>],
        ) {
            *self.last_state.lock().unwrap() = (prepared.len(), started.len());
        }
    }

    #[derive(Default)]
    struct Answer {
        granted: AtomicBool,
        denied: AtomicBool,
    }

    impl OnRequestSyncListener for Answer {
        fn on_granted(&self) {
            self.granted.store(true, Ordering::SeqCst);
        }

        fn on_denied(&self) {
            self.denied.store(true, Ordering::SeqCst);
        }
    }

    impl Answer {
        fn granted(&self) -> bool {
            self.granted.load(Ordering::SeqCst) && !self.denied.load(Ordering::SeqCst)
        }

        fn denied(&self) -> bool {
            self.denied.load(Ordering::SeqCst) && !self.granted.load(Ordering::SeqCst)
        }
    }

    fn as_object(player: &Arc<Player>) -> Arc<dyn SynchronizeObject> {
        Arc::clone(player) as Arc<dyn SynchronizeObject>
    }

    #[test]
    fn start_without_prepare_is_denied() {
        let sync = PlaySynchronizer::new();
        let player = Player::new("d1");
        let answer = Answer::default();

        sync.start_sync(&as_object(&player), &answer);

        assert!(answer.denied());
        assert_eq!(sync.context_count(), 0);
    }

    #[test]
    fn prepare_then_start_is_granted() {
        let sync = PlaySynchronizer::new();
        let player = Player::new("d1");
        let object = as_object(&player);
        let answer = Answer::default();

        sync.prepare_sync(&object);
        sync.start_sync(&object, &answer);

        assert!(answer.granted());
        assert_eq!(*player.last_state.lock().unwrap(), (0, 1));
    }

    #[test]
    fn release_waits_until_nothing_is_preparing() {
        let sync = PlaySynchronizer::new();
        let (tts, display, late) = (Player::new("d1"), Player::new("d1"), Player::new("d1"));
        let (tts_obj, display_obj, late_obj) = (as_object(&tts), as_object(&display), as_object(&late));

        for object in [&tts_obj, &display_obj, &late_obj] {
            sync.prepare_sync(object);
        }
        sync.start_sync(&tts_obj, &Answer::default());
        sync.start_sync(&display_obj, &Answer::default());

        // tts finishes while `late` is still preparing: nobody is released.
        sync.release_sync(&tts_obj, &Answer::default());
        assert!(display.releases().is_empty());

        // `late` leaves prepared without starting: display may now go.
        sync.release_sync(&late_obj, &Answer::default());
        assert_eq!(display.releases(), vec![false]);
        assert!(sync.has_context("d1"));

        sync.release_sync(&display_obj, &Answer::default());
        assert!(!sync.has_context("d1"));
    }

    #[test]
    fn release_immediately_forces_everyone() {
        let sync = PlaySynchronizer::new();
        let (a, b, c) = (Player::new("d1"), Player::new("d1"), Player::new("d1"));
        let (a_obj, b_obj, c_obj) = (as_object(&a), as_object(&b), as_object(&c));
        sync.prepare_sync(&a_obj);
        sync.prepare_sync(&b_obj);
        sync.prepare_sync(&c_obj);
        sync.start_sync(&b_obj, &Answer::default());

        let answer = Answer::default();
        sync.release_sync_immediately(&a_obj, &answer);

        assert!(answer.granted());
        assert_eq!(b.releases(), vec![true]);
        assert_eq!(c.releases(), vec![true]);
        assert!(a.releases().is_empty());
    }

    #[test]
    fn release_immediately_of_unknown_object_still_forces_siblings() {
        let sync = PlaySynchronizer::new();
        let (a, stranger) = (Player::new("d1"), Player::new("d1"));
        sync.prepare_sync(&as_object(&a));

        let answer = Answer::default();
        sync.release_sync_immediately(&as_object(&stranger), &answer);

        assert!(answer.denied());
        assert_eq!(a.releases(), vec![true]);
    }

    #[test]
    fn release_without_sync_leaves_siblings_alone() {
        let sync = PlaySynchronizer::new();
        let (a, b) = (Player::new("d1"), Player::new("d1"));
        let (a_obj, b_obj) = (as_object(&a), as_object(&b));
        sync.prepare_sync(&a_obj);
        sync.prepare_sync(&b_obj);
        sync.start_sync(&b_obj, &Answer::default());

        assert!(sync.exist_other_sync_object(&a_obj));
        sync.release_without_sync(&a_obj);

        assert!(b.releases().is_empty());
        assert!(!sync.exist_other_sync_object(&b_obj));
        assert_eq!(*a.last_state.lock().unwrap(), (0, 1));
    }

    #[test]
    fn turns_are_independent() {
        let sync = PlaySynchronizer::new();
        let (a, b) = (Player::new("d1"), Player::new("d2"));
        sync.prepare_sync(&as_object(&a));
        sync.prepare_sync(&as_object(&b));

        assert_eq!(sync.context_count(), 2);
        assert!(!sync.exist_other_sync_object(&as_object(&a)));

        sync.release_sync_immediately(&as_object(&a), &Answer::default());
        assert!(b.releases().is_empty());
        assert_eq!(sync.context_count(), 1);
    }
}
