use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tracerelay_mover::{MoveError, collision_name};

use crate::{ArtifactContent, ArtifactStore, MoveReceipt, Stage, is_hidden};

const MAX_COLLISION_ATTEMPTS: u32 = 100;

#[derive(Default)]
struct Inner {
    stages: HashMap<Stage, BTreeMap<String, Bytes>>,
    failing_moves: HashSet<Stage>,
    failing_lists: HashSet<Stage>,
    moves: Vec<(String, Stage, Stage)>,
}

/// In-memory [`ArtifactStore`] with failure injection, for state machine tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Places a file directly into `stage`, replacing any file of that name.
    pub fn insert(&self, stage: Stage, name: &str, content: impl Into<Vec<u8>>) {
        self.lock()
            .stages
            .entry(stage)
            .or_default()
            .insert(name.to_string(), Bytes::from(content.into()));
    }

    /// Names currently in `stage`, including hidden ones.
    pub fn names(&self, stage: Stage) -> Vec<String> {
        self.lock()
            .stages
            .get(&stage)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn content(&self, stage: Stage, name: &str) -> Option<Vec<u8>> {
        self.lock().stages.get(&stage)?.get(name).map(|b| b.to_vec())
    }

    /// Stage currently holding `name`, if any.
    pub fn locate(&self, name: &str) -> Option<Stage> {
        let inner = self.lock();
        Stage::ALL
            .into_iter()
            .find(|s| inner.stages.get(s).is_some_and(|files| files.contains_key(name)))
    }

    /// Makes every move into `stage` fail permanently.
    pub fn fail_moves_into(&self, stage: Stage) {
        self.lock().failing_moves.insert(stage);
    }

    /// Lets moves into `stage` succeed again.
    pub fn heal_moves_into(&self, stage: Stage) {
        self.lock().failing_moves.remove(&stage);
    }

    /// Makes listing `stage` fail.
    pub fn fail_listing(&self, stage: Stage) {
        self.lock().failing_lists.insert(stage);
    }

    /// Successful moves in order, as `(destination name, from, to)`.
    pub fn moves(&self) -> Vec<(String, Stage, Stage)> {
        self.lock().moves.clone()
    }
}

impl ArtifactStore for MemoryStore {
    fn list(&self, stage: Stage) -> io::Result<Vec<String>> {
        let inner = self.lock();
        if inner.failing_lists.contains(&stage) {
            return Err(io::Error::other(format!("listing {stage} failed")));
        }
        Ok(inner
            .stages
            .get(&stage)
            .map(|files| files.keys().filter(|n| !is_hidden(n)).cloned().collect())
            .unwrap_or_default())
    }

    fn move_to(&self, name: &str, from: Stage, to: Stage) -> Result<MoveReceipt, MoveError> {
        let mut inner = self.lock();
        if inner.failing_moves.contains(&to) {
            return Err(MoveError::Permanent {
                attempts: 1,
                reason: format!("moves into {to} are failing"),
            });
        }

        let present = inner
            .stages
            .get(&from)
            .is_some_and(|files| files.contains_key(name));
        if !present {
            return Err(MoveError::Permanent {
                attempts: 1,
                reason: format!("{name} not found in {from}"),
            });
        }

        let dest = inner.stages.entry(to).or_default();
        let file_name = (0..=MAX_COLLISION_ATTEMPTS)
            .map(|n| {
                if n == 0 {
                    name.to_string()
                } else {
                    collision_name(name, n)
                }
            })
            .find(|candidate| !dest.contains_key(candidate))
            .ok_or_else(|| MoveError::CollisionExhausted {
                name: name.to_string(),
                attempts: MAX_COLLISION_ATTEMPTS,
            })?;

        let content = inner
            .stages
            .get_mut(&from)
            .and_then(|files| files.remove(name))
            .unwrap_or_default();
        inner
            .stages
            .entry(to)
            .or_default()
            .insert(file_name.clone(), content);
        inner.moves.push((file_name.clone(), from, to));

        Ok(MoveReceipt {
            file_name,
            attempts: 1,
        })
    }

    fn open(&self, stage: Stage, name: &str) -> io::Result<ArtifactContent> {
        self.lock()
            .stages
            .get(&stage)
            .and_then(|files| files.get(name))
            .map(|bytes| ArtifactContent::Memory(bytes.clone()))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{name} not found in {stage}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_relocates_content() {
        let store = MemoryStore::new();
        store.insert(Stage::Source, "a.pcap", b"a".to_vec());
        store.move_to("a.pcap", Stage::Source, Stage::Work).unwrap();

        assert_eq!(store.locate("a.pcap"), Some(Stage::Work));
        assert!(matches!(
            store.open(Stage::Work, "a.pcap").unwrap(),
            ArtifactContent::Memory(ref b) if b.as_ref() == b"a"
        ));
        assert!(store.open(Stage::Source, "a.pcap").is_err());
        assert_eq!(
            store.moves(),
            [("a.pcap".to_string(), Stage::Source, Stage::Work)]
        );
    }

    #[test]
    fn collision_uses_alternative_name() {
        let store = MemoryStore::new();
        store.insert(Stage::Work, "a.pcap", b"old".to_vec());
        store.insert(Stage::Source, "a.pcap", b"new".to_vec());

        let receipt = store.move_to("a.pcap", Stage::Source, Stage::Work).unwrap();
        assert_eq!(receipt.file_name, "a-dup1.pcap");
        assert_eq!(store.content(Stage::Work, "a.pcap").unwrap(), b"old");
        assert_eq!(store.content(Stage::Work, "a-dup1.pcap").unwrap(), b"new");
    }

    #[test]
    fn injected_failures() {
        let store = MemoryStore::new();
        store.insert(Stage::Work, "a.pcap", b"a".to_vec());
        store.fail_moves_into(Stage::Done);
        assert!(store.move_to("a.pcap", Stage::Work, Stage::Done).is_err());
        assert_eq!(store.locate("a.pcap"), Some(Stage::Work));

        store.heal_moves_into(Stage::Done);
        store.move_to("a.pcap", Stage::Work, Stage::Done).unwrap();

        store.fail_listing(Stage::Source);
        assert!(store.list(Stage::Source).is_err());
    }

    #[test]
    fn missing_source_is_permanent() {
        let store = MemoryStore::new();
        let err = store.move_to("nope", Stage::Source, Stage::Work).unwrap_err();
        assert!(matches!(err, MoveError::Permanent { .. }));
    }
}
