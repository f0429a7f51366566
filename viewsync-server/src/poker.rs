//! Poke assembly: turning staged patches into ordered frame sequences.

use std::collections::BTreeMap;

use viewsync_client::{
    ClientPatch, Downstream, PokeEnd, PokePart, PokeStart, QueryPatch, RowPatch, SchemaVersions,
};
use viewsync_cvr::{Patch, PatchToVersion};
use viewsync_data::{ClientId, CvrVersion, RowId};

/// Last-write-wins row patches, keyed (and deterministically ordered) by row
/// id.
type RowPatches = BTreeMap<RowId, RowPatch>;

/// Maximum patches per `pokePart` frame.
pub const PATCHES_PER_PART: usize = 2048;

/// Builds the frame sequence of one poke for one client.
///
/// Frame ordering within the poke: config patches first (clients, desired
/// queries, got queries), then row deletes, then row puts. Within the row
/// groups a row appears at most once; a later patch for the same row replaces
/// the earlier one.
#[derive(Debug)]
pub struct PokeHandler {
    poke_id: String,
    base_cookie: Option<CvrVersion>,
    cookie: CvrVersion,
    schema_versions: Option<SchemaVersions>,
    desired: BTreeMap<ClientId, Vec<QueryPatch>>,
    got: Vec<QueryPatch>,
    clients: Vec<ClientPatch>,
    rows: RowPatches,
}

impl PokeHandler {
    /// Start a poke moving a client from `base_cookie` to `cookie`.
    pub fn new(
        poke_id: impl Into<String>,
        base_cookie: Option<CvrVersion>,
        cookie: CvrVersion,
        schema_versions: Option<SchemaVersions>,
    ) -> Self {
        PokeHandler {
            poke_id: poke_id.into(),
            base_cookie,
            cookie,
            schema_versions,
            desired: BTreeMap::new(),
            got: Vec::new(),
            clients: Vec::new(),
            rows: RowPatches::new(),
        }
    }

    /// Stage one patch. Patches at or before the client's base cookie are
    /// skipped — the client already has them.
    pub fn add_patch(&mut self, patch: &PatchToVersion) {
        if let Some(base) = &self.base_cookie {
            if patch.to_version <= *base {
                return;
            }
        }
        match &patch.patch {
            Patch::Row(row_patch) => {
                self.rows.insert(row_patch.id().clone(), row_patch.clone());
            }
            Patch::DesiredQuery { client_id, patch } => self
                .desired
                .entry(client_id.clone())
                .or_default()
                .push(patch.clone()),
            Patch::GotQuery(patch) => self.got.push(patch.clone()),
            Patch::Client(patch) => self.clients.push(patch.clone()),
        }
    }

    /// The opening `pokeStart` frame. Sent before patch assembly begins, so
    /// that a poke abandoned mid-assembly can still be cancelled explicitly
    /// via [`cancel`](Self::cancel).
    pub fn start_frame(&self) -> Downstream {
        Downstream::PokeStart(PokeStart {
            poke_id: self.poke_id.clone(),
            base_cookie: self.base_cookie.as_ref().map(CvrVersion::cookie),
            cookie: self.cookie.cookie(),
            schema_versions: self.schema_versions,
        })
    }

    /// Finish the poke: the ordered `pokePart`s followed by the committing
    /// `pokeEnd`. The caller has already sent the
    /// [`start_frame`](Self::start_frame).
    pub fn finish(self) -> Vec<Downstream> {
        let mut frames = Vec::new();

        if !self.desired.is_empty() || !self.got.is_empty() || !self.clients.is_empty() {
            let mut part = PokePart::new(self.poke_id.clone());
            if !self.desired.is_empty() {
                let desired = self
                    .desired
                    .into_iter()
                    .map(|(client, patches)| (client, dedupe_query_patches(patches)))
                    .collect();
                part.desired_queries_patches = Some(desired);
            }
            if !self.got.is_empty() {
                part.got_queries_patch = Some(dedupe_query_patches(self.got));
            }
            if !self.clients.is_empty() {
                part.clients_patch = Some(self.clients);
            }
            frames.push(Downstream::PokePart(part));
        }

        let (dels, puts): (Vec<RowPatch>, Vec<RowPatch>) = self
            .rows
            .into_values()
            .partition(|patch| !patch.is_put());
        for group in [dels, puts] {
            for chunk in group.chunks(PATCHES_PER_PART) {
                let mut part = PokePart::new(self.poke_id.clone());
                part.rows_patch = Some(chunk.to_vec());
                frames.push(Downstream::PokePart(part));
            }
        }

        frames.push(Downstream::PokeEnd(PokeEnd {
            poke_id: self.poke_id,
            cookie: Some(self.cookie.cookie()),
            cancel: false,
        }));
        frames
    }

    /// Abandon the poke: the matching `pokeEnd{cancel}` tells the client to
    /// discard everything received since the `pokeStart` without committing.
    pub fn cancel(self) -> Downstream {
        Downstream::PokeEnd(PokeEnd {
            poke_id: self.poke_id,
            cookie: None,
            cancel: true,
        })
    }
}

/// Keep only the last patch per query id, preserving the order of last
/// occurrences. `clear` entries are kept as-is.
fn dedupe_query_patches(patches: Vec<QueryPatch>) -> Vec<QueryPatch> {
    let mut kept: Vec<QueryPatch> = Vec::with_capacity(patches.len());
    for patch in patches {
        if let Some(hash) = patch.hash() {
            kept.retain(|p| p.hash() != Some(hash));
        }
        kept.push(patch);
    }
    kept
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use viewsync_data::RowKey;

    use super::*;

    fn version(cookie: &str) -> CvrVersion {
        cookie.parse().unwrap()
    }

    fn row_patch_put(id: i64) -> PatchToVersion {
        PatchToVersion {
            patch: Patch::Row(RowPatch::Put {
                id: RowId::new("", "issue", RowKey::from_iter([("id", id)])),
                contents: BTreeMap::new(),
            }),
            to_version: version("01"),
        }
    }

    fn row_patch_del(id: i64) -> PatchToVersion {
        PatchToVersion {
            patch: Patch::Row(RowPatch::Del {
                id: RowId::new("", "issue", RowKey::from_iter([("id", id)])),
            }),
            to_version: version("01"),
        }
    }

    #[test]
    fn frames_are_ordered_config_then_dels_then_puts() {
        let mut poke = PokeHandler::new("p1", Some(version("00")), version("01"), None);
        poke.add_patch(&row_patch_put(1));
        poke.add_patch(&row_patch_del(2));
        poke.add_patch(&PatchToVersion {
            patch: Patch::GotQuery(QueryPatch::Put {
                hash: "q1".into(),
                ast: None,
                name: None,
                args: None,
                ttl: None,
            }),
            to_version: version("01"),
        });

        let start = poke.start_frame();
        assert!(matches!(&start, Downstream::PokeStart(s) if s.cookie == "01"));

        let frames = poke.finish();
        assert_eq!(frames.len(), 4);
        let Downstream::PokePart(config) = &frames[0] else {
            panic!("expected config part");
        };
        assert!(config.got_queries_patch.is_some());
        let Downstream::PokePart(dels) = &frames[1] else {
            panic!("expected del part");
        };
        assert!(dels.rows_patch.as_ref().unwrap().iter().all(|p| !p.is_put()));
        let Downstream::PokePart(puts) = &frames[2] else {
            panic!("expected put part");
        };
        assert!(puts.rows_patch.as_ref().unwrap().iter().all(RowPatch::is_put));
        assert!(matches!(
            &frames[3],
            Downstream::PokeEnd(e) if e.cookie.as_deref() == Some("01") && !e.cancel
        ));
    }

    #[test]
    fn later_row_patch_replaces_earlier_one() {
        let mut poke = PokeHandler::new("p1", None, version("01"), None);
        poke.add_patch(&row_patch_del(1));
        poke.add_patch(&row_patch_put(1));
        let frames = poke.finish();
        // Only the put survives: one row part, then the end.
        assert_eq!(frames.len(), 2);
        let Downstream::PokePart(part) = &frames[0] else {
            panic!("expected row part");
        };
        assert_eq!(part.rows_patch.as_ref().unwrap().len(), 1);
        assert!(part.rows_patch.as_ref().unwrap()[0].is_put());
    }

    #[test]
    fn patches_at_or_before_base_are_skipped() {
        let mut poke = PokeHandler::new("p1", Some(version("01")), version("02"), None);
        poke.add_patch(&row_patch_put(1)); // to_version 01 == base
        // Nothing survives staging, so the poke closes with no parts.
        let frames = poke.finish();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Downstream::PokeEnd(e) if !e.cancel));
    }

    #[test]
    fn cancel_emits_cancelling_end() {
        let poke = PokeHandler::new("p1", None, version("01"), None);
        assert!(matches!(&poke.start_frame(), Downstream::PokeStart(_)));
        assert!(matches!(
            poke.cancel(),
            Downstream::PokeEnd(e) if e.cancel && e.cookie.is_none()
        ));
    }
}
