//! Offline consistency check of the allocation table against the directory.

use cfs_alloc::AllocationTable;
use cfs_dir::{DirEntry, Directory};
use cfs_ondisk::TableSlot;
use cfs_types::{BlockNumber, EntryId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One problem found by [`crate::Volume::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFinding {
    /// What was checked, e.g. `"entry[3] /logs/a"` or `"table"`.
    pub component: String,
    pub detail: String,
}

/// Result of a full table/directory walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub findings: Vec<CheckFinding>,
    pub files_checked: u64,
    /// Blocks reached from some file's chain head.
    pub reachable_blocks: u64,
    /// Blocks marked in use that no chain reaches.
    pub leaked_blocks: u64,
    pub free_blocks: u64,
    pub reserved_blocks: u64,
    pub total_blocks: u64,
    /// `free + reachable + reserved == total`.
    pub conserved: bool,
    pub healthy: bool,
}

impl CheckReport {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.findings.len()
    }
}

struct Walker<'a> {
    table: &'a AllocationTable,
    dir: &'a Directory,
    owner: Vec<Option<EntryId>>,
    findings: Vec<CheckFinding>,
}

impl Walker<'_> {
    fn report(&mut self, component: String, detail: String) {
        warn!(component = component.as_str(), detail = detail.as_str(), "check finding");
        self.findings.push(CheckFinding { component, detail });
    }

    fn component(&self, entry: &DirEntry) -> String {
        format!("entry[{}] {}", entry.id, self.dir.path_of(entry.id))
    }

    /// Walk one file chain, claiming each block for `entry`. Returns the
    /// number of blocks claimed.
    fn walk(&mut self, entry: &DirEntry, head: BlockNumber) -> u64 {
        let mut block = head;
        let mut len = 0_u64;
        loop {
            let slot = match self.table.slot(block) {
                Some(slot) if block.0 >= self.table.reserved_blocks() => slot,
                Some(_) => {
                    self.report(
                        self.component(entry),
                        format!("chain enters reserved block {block}"),
                    );
                    return len;
                }
                None => {
                    self.report(
                        self.component(entry),
                        format!("chain leaves the volume at block {block}"),
                    );
                    return len;
                }
            };
            match self.owner[block.index()] {
                Some(other) if other == entry.id => {
                    self.report(self.component(entry), format!("cycle at block {block}"));
                    return len;
                }
                Some(other) => {
                    self.report(
                        self.component(entry),
                        format!("block {block} is cross-linked with entry[{other}]"),
                    );
                    return len;
                }
                None => {}
            }
            match slot {
                TableSlot::Next(next) => {
                    self.owner[block.index()] = Some(entry.id);
                    len += 1;
                    block = next;
                }
                TableSlot::EndOfChain => {
                    self.owner[block.index()] = Some(entry.id);
                    return len + 1;
                }
                TableSlot::Free | TableSlot::Reserved => {
                    self.report(
                        self.component(entry),
                        format!("chain reaches unallocated block {block}"),
                    );
                    return len;
                }
            }
        }
    }

    fn check_entry(&mut self, entry: &DirEntry) {
        if entry.is_dir() {
            if entry.first_block.is_some() || entry.size != 0 {
                self.report(
                    self.component(entry),
                    "directory owns data blocks or a size".to_owned(),
                );
            }
            return;
        }
        let needed = self.table.layout().block_size.blocks_for(entry.size);
        let Some(head) = entry.first_block else {
            if needed > 0 {
                self.report(
                    self.component(entry),
                    format!("size {} but no blocks", entry.size),
                );
            }
            return;
        };
        let len = self.walk(entry, head);
        if len < needed {
            self.report(
                self.component(entry),
                format!("chain holds {len} blocks, size {} needs {needed}", entry.size),
            );
        } else if len > needed.max(1) {
            self.report(
                self.component(entry),
                format!("chain holds {len} blocks, size {} needs only {needed}", entry.size),
            );
        }
    }
}

pub(crate) fn run(table: &AllocationTable, dir: &Directory) -> CheckReport {
    let total = table.block_count();
    let mut walker = Walker {
        table,
        dir,
        owner: vec![None; table.slots().len()],
        findings: Vec::new(),
    };

    let mut files_checked = 0_u64;
    for entry in dir.iter().filter(|e| e.id != EntryId::ROOT) {
        walker.check_entry(&entry);
        if !entry.is_dir() {
            files_checked += 1;
        }
    }

    let reachable = walker.owner.iter().filter(|o| o.is_some()).count() as u64;
    let leaked: Vec<u64> = table
        .slots()
        .iter()
        .enumerate()
        .filter(|(idx, slot)| slot.is_in_use() && walker.owner[*idx].is_none())
        .map(|(idx, _)| idx as u64)
        .filter(|idx| *idx >= table.reserved_blocks())
        .collect();
    if !leaked.is_empty() {
        let sample: Vec<String> = leaked.iter().take(8).map(u64::to_string).collect();
        walker.report(
            "table".to_owned(),
            format!(
                "{} blocks in use but unreachable (first: {})",
                leaked.len(),
                sample.join(", ")
            ),
        );
    }

    let free = table.free_count();
    let reserved = table.reserved_blocks();
    let conserved = free + reachable + reserved == total;
    let findings = walker.findings;
    let healthy = conserved && findings.is_empty();
    debug!(
        files = files_checked,
        reachable,
        leaked = leaked.len(),
        findings = findings.len(),
        healthy,
        "check complete"
    );
    CheckReport {
        findings,
        files_checked,
        reachable_blocks: reachable,
        leaked_blocks: leaked.len() as u64,
        free_blocks: free,
        reserved_blocks: reserved,
        total_blocks: total,
        conserved,
        healthy,
    }
}
