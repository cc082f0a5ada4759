//! Running identity state of one color class.
//!
//! The registry is an owned value. The sequence controller moves it into each
//! frame step and gets the updated registry back, so a frame either commits
//! completely or not at all.

use std::collections::BTreeMap;

use tracing::warn;

use crate::feature::ColorClass;
use crate::my_types::*;
use crate::rod::{Rod, RodId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityStatus {
    /// Observed in the most recent committed frame.
    Active,
    /// Missed at least once since it was last observed.
    Inactive,
    /// Reserved for a particle that is expected but has never been observed.
    Placeholder,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityEntry {
    pub status: IdentityStatus,
    pub last_rod: Option<Rod>,
    pub last_seen: Option<FrameIndex>,
}

impl IdentityEntry {
    /// Last known endpoints, if the identity was ever reconstructed.
    pub fn last_endpoints(&self) -> Option<[Vector3d; 2]> {
        self.last_rod.as_ref().and_then(|rod| rod.endpoints)
    }
}

/// A previous identity the track assigner may hand out again.
#[derive(Clone, Debug)]
pub struct Candidate<'a> {
    pub id: RodId,
    pub rod: &'a Rod,
    pub endpoints: [Vector3d; 2],
    /// Frames elapsed since the identity was last observed, at least one.
    pub gap: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityRegistry {
    color: ColorClass,
    entries: BTreeMap<RodId, IdentityEntry>,
    next_id: u32,
    version: u64,
    last_frame: Option<FrameIndex>,
}

impl IdentityRegistry {
    pub fn new(color: ColorClass) -> Self {
        IdentityRegistry {
            color,
            entries: BTreeMap::new(),
            next_id: 0,
            version: 0,
            last_frame: None,
        }
    }

    /// Registry state implied by previously written rods of `color`. The latest
    /// observed rod of every identity becomes its reference. Identities that
    /// only ever had dummy rows are placeholders.
    pub fn seeded(color: ColorClass, rods: impl IntoIterator<Item = Rod>) -> Self {
        let mut registry = IdentityRegistry::new(color);
        let mut latest: BTreeMap<RodId, Option<Rod>> = BTreeMap::new();
        let mut last_frame = None;
        for rod in rods {
            if rod.color != registry.color {
                warn!(
                    "ignoring rod {} of color {} while seeding {}",
                    rod.id, rod.color, registry.color
                );
                continue;
            }
            last_frame = last_frame.max(Some(rod.frame));
            let slot = latest.entry(rod.id).or_insert(None);
            if rod.is_dummy() {
                continue;
            }
            if slot.as_ref().map_or(true, |r| r.frame <= rod.frame) {
                *slot = Some(rod);
            }
        }
        for (id, rod) in latest {
            registry.next_id = registry.next_id.max(id.0 + 1);
            let status = match &rod {
                None => IdentityStatus::Placeholder,
                Some(rod) if Some(rod.frame) == last_frame => IdentityStatus::Active,
                Some(_) => IdentityStatus::Inactive,
            };
            registry.entries.insert(
                id,
                IdentityEntry {
                    status,
                    last_seen: rod.as_ref().map(|r| r.frame),
                    last_rod: rod,
                },
            );
        }
        registry.last_frame = last_frame;
        registry
    }

    pub fn color(&self) -> &ColorClass {
        &self.color
    }

    /// Number of committed frames.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_frame(&self) -> Option<FrameIndex> {
        self.last_frame
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: RodId) -> Option<&IdentityEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (RodId, &IdentityEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn ids_with_status(&self, status: IdentityStatus) -> Vec<RodId> {
        self.entries()
            .filter(|(_, entry)| entry.status == status)
            .map(|(id, _)| id)
            .collect()
    }

    /// True once any identity has a reconstructed position to track against.
    pub fn has_reference(&self) -> bool {
        self.entries.values().any(|e| e.last_endpoints().is_some())
    }

    /// Endpoints of the identities observed in the last committed frame.
    pub fn reference_endpoints(&self) -> Vec<[Vector3d; 2]> {
        self.entries
            .values()
            .filter(|e| e.status == IdentityStatus::Active)
            .filter_map(|e| e.last_endpoints())
            .collect()
    }

    /// Identities eligible for `frame`: all active ones, plus inactive ones that
    /// missed at most `reactivation_window` frames.
    pub fn candidates(&self, frame: FrameIndex, reactivation_window: usize) -> Vec<Candidate<'_>> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| {
                let rod = entry.last_rod.as_ref()?;
                let endpoints = rod.endpoints?;
                let last_seen = entry.last_seen?;
                let gap = frame.saturating_sub(last_seen).max(1);
                let eligible = match entry.status {
                    IdentityStatus::Active => true,
                    IdentityStatus::Inactive => gap - 1 <= reactivation_window,
                    IdentityStatus::Placeholder => false,
                };
                eligible.then_some(Candidate {
                    id: *id,
                    rod,
                    endpoints,
                    gap,
                })
            })
            .collect()
    }

    /// Identities that still need a row in `frame`: the candidates of the
    /// frame, whether or not they are observed again.
    pub fn tracked_ids(&self, frame: FrameIndex, reactivation_window: usize) -> Vec<RodId> {
        self.candidates(frame, reactivation_window)
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    /// Identity for a newly appearing particle. Placeholders are used up first.
    pub fn mint(&mut self) -> RodId {
        let placeholder = self
            .entries
            .iter()
            .find(|(_, e)| e.status == IdentityStatus::Placeholder)
            .map(|(id, _)| *id);
        match placeholder {
            Some(id) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.status = IdentityStatus::Inactive;
                }
                id
            }
            None => {
                let id = RodId(self.next_id);
                self.next_id += 1;
                self.entries.insert(
                    id,
                    IdentityEntry {
                        status: IdentityStatus::Inactive,
                        last_rod: None,
                        last_seen: None,
                    },
                );
                id
            }
        }
    }

    pub fn add_placeholder(&mut self) -> RodId {
        let id = RodId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            IdentityEntry {
                status: IdentityStatus::Placeholder,
                last_rod: None,
                last_seen: None,
            },
        );
        id
    }

    /// Record the outcome of `frame`. Observed rods activate their identity,
    /// every other identity that was active becomes inactive.
    pub fn commit(mut self, frame: FrameIndex, rods: &[Rod]) -> IdentityRegistry {
        let mut observed = Vec::new();
        for rod in rods.iter().filter(|r| !r.is_dummy()) {
            observed.push(rod.id);
            let entry = self.entries.entry(rod.id).or_insert(IdentityEntry {
                status: IdentityStatus::Inactive,
                last_rod: None,
                last_seen: None,
            });
            entry.status = IdentityStatus::Active;
            entry.last_rod = Some(rod.clone());
            entry.last_seen = Some(frame);
            self.next_id = self.next_id.max(rod.id.0 + 1);
        }
        for (id, entry) in self.entries.iter_mut() {
            if entry.status == IdentityStatus::Active && !observed.contains(id) {
                entry.status = IdentityStatus::Inactive;
            }
        }
        self.version += 1;
        self.last_frame = Some(frame);
        self
    }

    /// Same registry with every identity renamed through `f`.
    pub fn relabeled(&self, f: impl Fn(RodId) -> RodId) -> IdentityRegistry {
        let entries: BTreeMap<RodId, IdentityEntry> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let mut entry = entry.clone();
                if let Some(rod) = entry.last_rod.as_mut() {
                    rod.id = f(*id);
                }
                (f(*id), entry)
            })
            .collect();
        let next_id = entries.keys().map(|id| id.0 + 1).max().unwrap_or(0);
        IdentityRegistry {
            color: self.color.clone(),
            entries,
            next_id: next_id.max(self.next_id),
            version: self.version,
            last_frame: self.last_frame,
        }
    }
}
