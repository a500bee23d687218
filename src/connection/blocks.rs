//! Ordered groups of outstanding methods.
//!
//! Only the first block may have methods in flight. A `wait` method always
//! sits alone in its block; consecutive non-wait methods share one. The
//! operations here keep "no two adjacent non-wait blocks" true by
//! construction.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MethodBlock {
    pub(crate) wait: bool,
    pub(crate) methods: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct MethodBlocks {
    blocks: VecDeque<MethodBlock>,
}

impl MethodBlocks {
    /// Append a method. Returns true if it landed in the first block and
    /// should be sent now.
    pub(crate) fn enqueue(&mut self, id: String, wait: bool) -> bool {
        if wait {
            self.blocks.push_back(MethodBlock {
                wait: true,
                methods: vec![id],
            });
        } else {
            match self.blocks.back_mut() {
                Some(last) if !last.wait => last.methods.push(id),
                _ => self.blocks.push_back(MethodBlock {
                    wait: false,
                    methods: vec![id],
                }),
            }
        }
        self.blocks.len() == 1
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    #[cfg(test)]
    pub(crate) fn first(&self) -> Option<&MethodBlock> {
        self.blocks.front()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &MethodBlock> {
        self.blocks.iter()
    }

    /// Drop a method from the first block once its result arrives. Returns
    /// false if the first block does not hold it.
    pub(crate) fn remove_from_first(&mut self, id: &str) -> bool {
        let Some(first) = self.blocks.front_mut() else {
            return false;
        };
        match first.methods.iter().position(|m| m == id) {
            Some(idx) => {
                first.methods.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Keep only the first block's methods for which `keep` holds.
    pub(crate) fn retain_in_first(&mut self, mut keep: impl FnMut(&str) -> bool) {
        if let Some(first) = self.blocks.front_mut() {
            first.methods.retain(|m| keep(m));
        }
    }

    pub(crate) fn pop_first(&mut self) -> Option<MethodBlock> {
        self.blocks.pop_front()
    }

    pub(crate) fn pop_first_if_empty(&mut self) {
        if self.blocks.front().is_some_and(|b| b.methods.is_empty()) {
            self.blocks.pop_front();
        }
    }

    /// Ids of the methods in the first block.
    pub(crate) fn first_methods(&self) -> Vec<String> {
        self.blocks
            .front()
            .map(|b| b.methods.clone())
            .unwrap_or_default()
    }

    pub(crate) fn take(&mut self) -> MethodBlocks {
        std::mem::take(self)
    }

    /// Put previously outstanding blocks back behind the ones queued since
    /// [`MethodBlocks::take`]. When the last new block and the first old one
    /// are both non-wait they merge. Returns the ids that became sendable
    /// (landed in the first block).
    pub(crate) fn restore_after(&mut self, mut old: MethodBlocks) -> Vec<String> {
        if old.is_empty() {
            return Vec::new();
        }
        if self.is_empty() {
            *self = old;
            return self.first_methods();
        }

        let mut sendable = Vec::new();
        let merge = self.blocks.back().is_some_and(|b| !b.wait)
            && old.blocks.front().is_some_and(|b| !b.wait);
        if merge {
            if let Some(head) = old.blocks.pop_front() {
                let only_block = self.blocks.len() == 1;
                if let Some(last) = self.blocks.back_mut() {
                    if only_block {
                        sendable.extend(head.methods.iter().cloned());
                    }
                    last.methods.extend(head.methods);
                }
            }
        }
        self.blocks.extend(old.blocks);
        sendable
    }
}
