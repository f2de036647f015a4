//! Entry registry: name -> (id, type) and id -> live_count, with
//! reference-counted Start/Finish/SetMetadata semantics.

use hashbrown::HashMap;

struct EntryInfo {
    id: u32,
    ty: String,
}

pub struct EntryRegistry {
    by_name: HashMap<String, EntryInfo>,
    live_counts: HashMap<u32, u32>,
    last_id: u32,
}

/// Outcome of a `start` call: whether a new Start control record needs to
/// be emitted, and the id to return to the caller (0 on type conflict).
pub enum StartOutcome {
    /// First live registration for this id: emit a Start control record.
    Emit { id: u32 },
    /// Already live under this name with a matching type: no new record.
    AlreadyLive { id: u32 },
    /// Type mismatch against the name's previously-registered type.
    TypeConflict,
}

impl Default for EntryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            live_counts: HashMap::new(),
            last_id: 0,
        }
    }

    /// Registers (or re-registers) `name` with the given `ty`. Returns the
    /// outcome; the caller emits the Start control record only on `Emit`.
    pub fn start(&mut self, name: &str, ty: &str) -> StartOutcome {
        let id = if let Some(info) = self.by_name.get(name) {
            info.id
        } else {
            self.last_id += 1;
            let id = self.last_id;
            self.by_name.insert(
                name.to_string(),
                EntryInfo {
                    id,
                    ty: ty.to_string(),
                },
            );
            id
        };

        let count = self.live_counts.entry(id).or_insert(0);
        *count += 1;

        if *count > 1 {
            let stored_ty = &self.by_name[name].ty;
            if stored_ty != ty {
                // roll back the increment; the registration stays live
                // under its prior type.
                *self.live_counts.get_mut(&id).expect("just inserted") -= 1;
                return StartOutcome::TypeConflict;
            }
            return StartOutcome::AlreadyLive { id };
        }

        // first live registration (possibly a re-Start after Finish):
        // the name->id mapping may have pre-existed with a different type
        // recorded — refresh it to the newly requested type.
        if let Some(info) = self.by_name.get_mut(name) {
            info.ty = ty.to_string();
        }
        StartOutcome::Emit { id }
    }

    /// Decrements the live count for `id`. Returns `true` if this call
    /// dropped the count to zero (the caller emits a Finish control
    /// record in that case). No-op (returns `false`) if `id` isn't live.
    pub fn finish(&mut self, id: u32) -> bool {
        let Some(count) = self.live_counts.get_mut(&id) else {
            return false;
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        if *count == 0 {
            self.live_counts.remove(&id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_emits_and_assigns_id_one() {
        let mut reg = EntryRegistry::new();
        match reg.start("x", "boolean") {
            StartOutcome::Emit { id } => assert_eq!(id, 1),
            _ => panic!("expected Emit"),
        }
    }

    #[test]
    fn second_start_same_type_is_already_live() {
        let mut reg = EntryRegistry::new();
        reg.start("x", "boolean");
        match reg.start("x", "boolean") {
            StartOutcome::AlreadyLive { id } => assert_eq!(id, 1),
            _ => panic!("expected AlreadyLive"),
        }
    }

    #[test]
    fn type_conflict_does_not_emit_or_reassign() {
        let mut reg = EntryRegistry::new();
        reg.start("x", "int64");
        match reg.start("x", "double") {
            StartOutcome::TypeConflict => {}
            _ => panic!("expected TypeConflict"),
        }
        // a subsequent same-type Start still works against the original type
        match reg.start("x", "int64") {
            StartOutcome::AlreadyLive { id } => assert_eq!(id, 1),
            _ => panic!("expected AlreadyLive"),
        }
    }

    #[test]
    fn finish_then_restart_reuses_id() {
        let mut reg = EntryRegistry::new();
        let id = match reg.start("a", "boolean") {
            StartOutcome::Emit { id } => id,
            _ => unreachable!(),
        };
        assert!(reg.finish(id));
        match reg.start("a", "boolean") {
            StartOutcome::Emit { id: id2 } => assert_eq!(id2, id),
            _ => panic!("expected Emit after Finish dropped live count to 0"),
        }
    }

    #[test]
    fn finish_on_unknown_id_is_noop() {
        let mut reg = EntryRegistry::new();
        assert!(!reg.finish(42));
    }

    #[test]
    fn finish_decrements_without_emitting_while_still_live() {
        let mut reg = EntryRegistry::new();
        let id = match reg.start("a", "boolean") {
            StartOutcome::Emit { id } => id,
            _ => unreachable!(),
        };
        reg.start("a", "boolean"); // live count now 2
        assert!(!reg.finish(id)); // drops to 1, not yet a Finish record
        assert!(reg.finish(id)); // drops to 0, emits Finish
    }
}
