use std::time::Duration;

use crate::{ReadMode, ReadPreference, ServerDescription, ServerRole, TagSet};

/// Turns a [`ReadPreference`] and a set of descriptions into an ordered list
/// of candidates.
///
/// 1. Unreachable (unknown) servers, arbiters and hidden members are never
///    candidates.
/// 2. The read mode picks primaries, secondaries or both, with the preferred
///    modes falling back to the other role when the preferred one is absent.
///    A standalone server counts as a primary. Routers are eligible for every
///    mode since they forward the preference themselves.
/// 3. Tag sets are tried in order; the first one matching any secondary (or
///    any candidate for `Nearest`) wins.
/// 4. `Nearest` and routers keep every candidate within the latency window of
///    the fastest one, fastest first.
///
/// An empty result means no server is eligible. Selection itself never fails.
#[derive(Debug, Clone)]
pub struct ServerSelector {
    /// Width of the latency window above the fastest candidate
    local_threshold: Duration,
}

impl Default for ServerSelector {
    fn default() -> Self {
        Self {
            local_threshold: Duration::from_millis(15),
        }
    }
}

impl ServerSelector {
    pub fn new(local_threshold: Duration) -> Self {
        Self { local_threshold }
    }

    pub fn select<'a, I>(&self, preference: &ReadPreference, descriptions: I) -> Vec<ServerDescription>
    where
        I: IntoIterator<Item = &'a ServerDescription>,
    {
        let usable = descriptions
            .into_iter()
            .filter(|d| {
                !matches!(
                    d.role(),
                    ServerRole::Unknown | ServerRole::Arbiter | ServerRole::Hidden
                )
            })
            .collect::<Vec<_>>();

        let routers = by_role(&usable, |r| r == ServerRole::Mongos);
        if !routers.is_empty() {
            return self.within_latency_window(routers);
        }

        let primaries = by_role(&usable, |r| {
            matches!(r, ServerRole::Primary | ServerRole::Standalone)
        });
        let secondaries = by_role(&usable, |r| r == ServerRole::Secondary);
        let tag_sets = preference.tag_sets();

        let selected = match preference.mode() {
            ReadMode::Primary => primaries,
            ReadMode::Secondary => matching_first_tag_set(secondaries, tag_sets),
            ReadMode::PrimaryPreferred => {
                if primaries.is_empty() {
                    matching_first_tag_set(secondaries, tag_sets)
                } else {
                    primaries
                }
            }
            ReadMode::SecondaryPreferred => {
                let secondaries = matching_first_tag_set(secondaries, tag_sets);
                if secondaries.is_empty() {
                    primaries
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => {
                let both = usable
                    .iter()
                    .copied()
                    .filter(|d| {
                        matches!(
                            d.role(),
                            ServerRole::Primary | ServerRole::Standalone | ServerRole::Secondary
                        )
                    })
                    .collect();
                return self.within_latency_window(matching_first_tag_set(both, tag_sets));
            }
        };

        selected.into_iter().cloned().collect()
    }

    fn within_latency_window(&self, mut candidates: Vec<&ServerDescription>) -> Vec<ServerDescription> {
        candidates.sort_by(|a, b| {
            a.round_trip_time()
                .cmp(&b.round_trip_time())
                .then_with(|| a.address().cmp(b.address()))
        });
        let fastest = match candidates.first() {
            Some(d) => d.round_trip_time(),
            None => return Vec::new(),
        };
        candidates
            .into_iter()
            .take_while(|d| d.round_trip_time() <= fastest.saturating_add(self.local_threshold))
            .cloned()
            .collect()
    }
}

fn by_role<'a>(
    descriptions: &[&'a ServerDescription],
    keep: impl Fn(ServerRole) -> bool,
) -> Vec<&'a ServerDescription> {
    descriptions
        .iter()
        .copied()
        .filter(|d| keep(d.role()))
        .collect()
}

fn matching_first_tag_set<'a>(
    candidates: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return candidates;
    }
    for tag_set in tag_sets {
        let matching = candidates
            .iter()
            .copied()
            .filter(|d| {
                tag_set
                    .iter()
                    .all(|(key, value)| d.tags().get(key) == Some(value))
            })
            .collect::<Vec<_>>();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}
