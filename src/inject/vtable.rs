//! Dispatch table capture, walk and substitution.
//!
//! The host dispatches its connection methods through a per-object table of
//! function pointers. Interception never edits that table in place: a
//! fixed-size prefix is copied, selected entries are replaced in the copy,
//! and the object's dispatch word is repointed at the copy as the final,
//! single activating mutation.

use super::memory::{ForeignView, WordSlot};
use super::InjectError;
use crate::probe::SymbolLookup;

/// Bytes copied verbatim before walking; large enough for any realistic
/// table, walk termination bounds how much of it is ever trusted.
pub const SAFE_COPY_BYTES: usize = 256;

/// One walked entry of a dispatch table.
#[derive(Debug, Clone)]
pub struct MethodSlot {
    pub index: usize,
    pub addr: usize,
    pub symbol: String,
}

/// A substitution request: one logical slot with the mangled spellings the
/// host has shipped for it, and the replacement to plant.
pub struct Substitution<'a> {
    pub label: &'a str,
    pub spellings: &'a [&'a str],
    pub replacement: usize,
}

/// Verified prefix of a live dispatch table.
pub struct MethodTable {
    base: usize,
    words: Vec<usize>,
    slots: Vec<MethodSlot>,
}

impl MethodTable {
    /// Copy `SAFE_COPY_BYTES` from the table at `base` and walk the copy
    /// from index 0 until an entry stops reverse-resolving to a known
    /// function start. Only the walked prefix is ever trusted.
    ///
    /// # Safety
    ///
    /// `base` must point at a dispatch table inside a mapped image, with at
    /// least `SAFE_COPY_BYTES` readable bytes behind it.
    pub unsafe fn capture(base: usize, lookup: &dyn SymbolLookup) -> Self {
        let view = ForeignView::new(base, SAFE_COPY_BYTES);
        let words: Vec<usize> = (0..view.word_count())
            .map(|i| view.word(i).unwrap_or(0))
            .collect();

        let mut slots = Vec::new();
        for (index, &addr) in words.iter().enumerate() {
            let info = match lookup.info_for(addr) {
                Some(info) => info,
                None => {
                    log::debug!("#{} {:#x}: table ended, not a known symbol", index, addr);
                    break;
                }
            };
            if info.symbol_addr != addr {
                log::debug!(
                    "#{} {:#x}: table ended, misaligned from closest symbol `{}`",
                    index,
                    addr,
                    info.symbol_name
                );
                break;
            }

            log::debug!("#{} {:#x}: {}", index, addr, info.symbol_name);
            slots.push(MethodSlot {
                index,
                addr,
                symbol: info.symbol_name,
            });
        }

        Self { base, words, slots }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn slots(&self) -> &[MethodSlot] {
        &self.slots
    }

    /// Apply every requested substitution to the copied prefix.
    ///
    /// All-or-nothing: if any request matches no walked slot the copy is
    /// discarded and nothing may be installed.
    pub fn substitute(mut self, requests: &[Substitution<'_>]) -> Result<PatchedTable, InjectError> {
        let mut originals = Vec::with_capacity(requests.len());

        for request in requests {
            let slot = self
                .slots
                .iter()
                .find(|slot| request.spellings.contains(&slot.symbol.as_str()));

            match slot {
                Some(slot) => {
                    log::info!(
                        "displacing #{} `{}` ({:#x} -> {:#x})",
                        slot.index,
                        slot.symbol,
                        slot.addr,
                        request.replacement
                    );
                    self.words[slot.index] = request.replacement;
                    originals.push((request.label.to_string(), slot.addr));
                }
                None => {
                    return Err(InjectError::TableWalk(format!(
                        "no walked entry matches `{}`",
                        request.label
                    )));
                }
            }
        }

        Ok(PatchedTable {
            words: self.words,
            originals,
        })
    }
}

/// Prefix copy with substitutions applied, ready to install.
pub struct PatchedTable {
    words: Vec<usize>,
    originals: Vec<(String, usize)>,
}

impl PatchedTable {
    /// Original function address displaced under `label`, for diagnostics.
    pub fn original(&self, label: &str) -> Option<usize> {
        self.originals
            .iter()
            .find(|(l, _)| l == label)
            .map(|&(_, addr)| addr)
    }

    pub fn originals(&self) -> &[(String, usize)] {
        &self.originals
    }

    pub fn words(&self) -> &[usize] {
        &self.words
    }

    /// Leak the copy and repoint the object's dispatch word at it.
    ///
    /// This is the activation: the host must be frozen when it happens, and
    /// there is no rollback afterwards. The table intentionally lives for
    /// the rest of the process.
    pub fn install(self, dispatch_word: &WordSlot) -> usize {
        let words: &'static mut [usize] = Box::leak(self.words.into_boxed_slice());
        let base = words.as_ptr() as usize;
        dispatch_word.set(base);
        base
    }
}
