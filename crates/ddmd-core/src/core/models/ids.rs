use slotmap::new_key_type;

/// Global atom identifier, stable for the whole run.
pub type AtomId = u32;

/// Global identifier of a bonded group, unique within one group arity.
pub type GroupId = u32;

new_key_type! {
    /// Local slot of an atom (owned or ghost) inside one domain's storage.
    pub struct AtomSlot;
    /// Local slot of a group inside one domain's storage.
    pub struct GroupSlot;
}
