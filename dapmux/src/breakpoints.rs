/// Breakpoint registry: tracks which numeric GDB ids this adapter created,
/// keyed by the DAP artifact that owns them, so `setBreakpoints` can
/// delete-then-insert per source without disturbing breakpoints from
/// other sources or other DAP requests.
///
/// No direct teacher analogue (`gdbadapter::commands::Breakpoint` only
/// models one breakpoint's fields, not ownership); grounded on the same
/// module's `break_insert`/`break_delete` command pair, generalized into
/// an owning map per spec §3.
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    by_source: HashMap<String, Vec<u32>>,
    instruction: Vec<u32>,
    watch: Vec<u32>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the ids previously owned by `path`, so the
    /// caller can issue `-break-delete` for each before inserting the
    /// replacement set.
    pub fn take_source(&mut self, path: &str) -> Vec<u32> {
        self.by_source.remove(path).unwrap_or_default()
    }

    pub fn set_source(&mut self, path: &str, ids: Vec<u32>) {
        self.by_source.insert(path.to_string(), ids);
    }

    pub fn take_instruction(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.instruction)
    }

    pub fn set_instruction(&mut self, ids: Vec<u32>) {
        self.instruction = ids;
    }

    pub fn take_watch(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.watch)
    }

    pub fn set_watch(&mut self, ids: Vec<u32>) {
        self.watch = ids;
    }

    /// The union of every id this adapter currently believes is live in
    /// GDB — the registry's core invariant (§3).
    pub fn all_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_source.values().flatten().copied().collect();
        ids.extend(&self.instruction);
        ids.extend(&self.watch);
        ids
    }
}
