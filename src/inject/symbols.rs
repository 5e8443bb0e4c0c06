//! Anchor-based resolution of non-exported symbols.
//!
//! The host's official interface intentionally exports almost nothing. The
//! way in: take one symbol that *is* exported, find which image it came
//! from, independently parse that image's on-disk symbol table, and compute
//! the image slide as `runtime address - static offset` of the anchor. Any
//! private symbol in the same table then resolves to `static offset +
//! slide`, accepted only after reverse lookup confirms the address really
//! is that symbol's start inside the anchor's image.

use super::InjectError;
use crate::probe::SymbolLookup;

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Static symbol table of one on-disk image: name -> static address.
pub struct ImageSymbols {
    symbols: HashMap<String, u64>,
}

impl ImageSymbols {
    /// Parse the symbol table out of an image file (ELF or Mach-O).
    pub fn from_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(&path)
            .with_context(|| format!("reading image {}", path.as_ref().display()))?;
        Self::from_bytes(&data)
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut symbols = HashMap::new();

        match goblin::Object::parse(data)? {
            goblin::Object::Elf(elf) => {
                for sym in &elf.syms {
                    if sym.st_value == 0 {
                        continue;
                    }
                    if let Some(name) = elf.strtab.get_at(sym.st_name) {
                        symbols.insert(name.to_string(), sym.st_value);
                    }
                }
                for sym in &elf.dynsyms {
                    if sym.st_value == 0 {
                        continue;
                    }
                    if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                        symbols.entry(name.to_string()).or_insert(sym.st_value);
                    }
                }
            }
            goblin::Object::Mach(goblin::mach::Mach::Binary(macho)) => {
                for sym in macho.symbols() {
                    let (name, nlist) = sym?;
                    if nlist.n_value == 0 || name.is_empty() {
                        continue;
                    }
                    // Mach-O nlist names carry a leading underscore relative
                    // to the dlsym/dladdr spelling
                    let name = name.strip_prefix('_').unwrap_or(name);
                    symbols.insert(name.to_string(), nlist.n_value);
                }
            }
            goblin::Object::Mach(goblin::mach::Mach::Fat(_)) => {
                return Err(anyhow!("fat images not supported"));
            }
            _ => {
                return Err(anyhow!("unsupported image format"));
            }
        }

        Ok(Self { symbols })
    }

    /// Build a table from explicit entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            symbols: entries.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }

    pub fn static_offset(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Source of static symbol tables for loaded images.
pub trait SymbolSource {
    fn load(&self, image_path: &str) -> Result<ImageSymbols, InjectError>;
}

/// Loads symbol tables from the image files on disk.
pub struct DiskImages;

impl SymbolSource for DiskImages {
    fn load(&self, image_path: &str) -> Result<ImageSymbols, InjectError> {
        ImageSymbols::from_image(image_path).map_err(|err| InjectError::ImageParse {
            path: image_path.to_string(),
            detail: format!("{:#}", err),
        })
    }
}

/// Exported anchor symbol with the slide computed from it.
#[derive(Debug, Clone)]
pub struct ImageAnchor {
    pub name: String,
    pub load_addr: usize,
    pub image_path: String,
    pub image_base: usize,
    pub slide: isize,
}

/// Resolves private symbols inside the anchor's image.
pub struct SymbolResolver<'a> {
    lookup: &'a dyn SymbolLookup,
    table: ImageSymbols,
    anchor: ImageAnchor,
}

impl<'a> SymbolResolver<'a> {
    /// Anchor on an exported symbol and parse its image's static table.
    pub fn with_anchor(
        lookup: &'a dyn SymbolLookup,
        images: &dyn SymbolSource,
        anchor_name: &str,
    ) -> Result<Self, InjectError> {
        let not_found = |reason: &str| InjectError::Resolution {
            symbol: anchor_name.to_string(),
            reason: reason.to_string(),
        };

        let load_addr = lookup
            .exported(anchor_name)
            .ok_or_else(|| not_found("anchor is not exported"))?;
        let info = lookup
            .info_for(load_addr)
            .ok_or_else(|| not_found("anchor address has no owning image"))?;

        let table = images.load(&info.image_path)?;

        let static_offset = table
            .static_offset(anchor_name)
            .ok_or_else(|| not_found("anchor missing from the image's own symbol table"))?;

        let anchor = ImageAnchor {
            name: anchor_name.to_string(),
            load_addr,
            image_path: info.image_path,
            image_base: info.image_base,
            slide: load_addr as isize - static_offset as isize,
        };

        log::info!(
            "anchored on `{}` in {} (slide {:#x})",
            anchor.name,
            anchor.image_path,
            anchor.slide
        );

        Ok(Self {
            lookup,
            table,
            anchor,
        })
    }

    pub fn anchor(&self) -> &ImageAnchor {
        &self.anchor
    }

    /// Resolve a private symbol to its runtime address.
    ///
    /// The computed address is accepted only if reverse lookup lands in the
    /// anchor's image, on the requested name, at the symbol's exact start.
    pub fn resolve(&self, name: &str) -> Result<usize, InjectError> {
        let fail = |reason: String| {
            log::warn!("resolve `{}`: {}", name, reason);
            Err(InjectError::Resolution {
                symbol: name.to_string(),
                reason,
            })
        };

        let static_offset = match self.table.static_offset(name) {
            Some(offset) => offset,
            None => return fail("not in the image's symbol table".to_string()),
        };

        let addr = (static_offset as isize + self.anchor.slide) as usize;

        let info = match self.lookup.info_for(addr) {
            Some(info) => info,
            None => return fail(format!("{:#x} does not reverse-resolve", addr)),
        };

        if info.image_base != self.anchor.image_base {
            return fail(format!(
                "wrong image: {} (expected {})",
                info.image_path, self.anchor.image_path
            ));
        }
        if info.symbol_name != name {
            return fail(format!("name mismatch: found `{}`", info.symbol_name));
        }
        if info.symbol_addr != addr {
            return fail(format!(
                "misaligned: {:#x} is inside `{}` starting at {:#x}",
                addr, info.symbol_name, info.symbol_addr
            ));
        }

        log::debug!("resolve `{}` -> {:#x}", name, addr);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::FakeLookup;

    const IMAGE: &str = "/host/libdebug.dylib";
    const IMAGE_BASE: usize = 0x8000;

    fn lookup() -> FakeLookup {
        FakeLookup::default()
            .export("Create", 0x9000)
            .info(0x9000, IMAGE, IMAGE_BASE, "Create", 0x9000)
    }

    fn table() -> ImageSymbols {
        ImageSymbols::from_entries([("Create", 0x1000u64), ("inner", 0x1040u64)])
    }

    fn resolver(lookup: &FakeLookup) -> SymbolResolver<'_> {
        struct Fixed(u64, u64);
        impl SymbolSource for Fixed {
            fn load(&self, _: &str) -> Result<ImageSymbols, InjectError> {
                Ok(ImageSymbols::from_entries([
                    ("Create", self.0),
                    ("inner", self.1),
                ]))
            }
        }
        SymbolResolver::with_anchor(lookup, &Fixed(0x1000, 0x1040), "Create").unwrap()
    }

    #[test]
    fn anchor_computes_slide_from_static_offset() {
        let lookup = lookup();
        let resolver = resolver(&lookup);
        assert_eq!(resolver.anchor().slide, 0x8000);
        assert_eq!(resolver.anchor().image_path, IMAGE);
    }

    #[test]
    fn resolves_private_symbol_through_slide_with_verification() {
        let lookup = lookup().info(0x9040, IMAGE, IMAGE_BASE, "inner", 0x9040);
        let resolver = resolver(&lookup);
        assert_eq!(resolver.resolve("inner").unwrap(), 0x9040);
    }

    #[test]
    fn rejects_address_in_wrong_image() {
        let lookup = lookup().info(0x9040, "/other/image", 0x4000, "inner", 0x9040);
        let resolver = resolver(&lookup);
        assert!(matches!(
            resolver.resolve("inner"),
            Err(InjectError::Resolution { .. })
        ));
    }

    #[test]
    fn rejects_name_mismatch() {
        let lookup = lookup().info(0x9040, IMAGE, IMAGE_BASE, "somethingElse", 0x9040);
        let resolver = resolver(&lookup);
        assert!(resolver.resolve("inner").is_err());
    }

    #[test]
    fn rejects_address_inside_another_symbol() {
        // Reverse lookup names the right symbol but the address is not its start
        let lookup = lookup().info(0x9040, IMAGE, IMAGE_BASE, "inner", 0x9030);
        let resolver = resolver(&lookup);
        assert!(resolver.resolve("inner").is_err());
    }

    #[test]
    fn rejects_symbol_missing_from_table() {
        let lookup = lookup();
        let resolver = resolver(&lookup);
        assert!(resolver.resolve("neverExisted").is_err());
    }

    #[test]
    fn parses_own_test_binary() {
        let exe = std::env::current_exe().unwrap();
        if let Ok(table) = ImageSymbols::from_image(&exe) {
            assert!(!table.is_empty());
        }
    }

    #[test]
    fn entries_table_lookups() {
        let table = table();
        assert_eq!(table.static_offset("inner"), Some(0x1040));
        assert_eq!(table.static_offset("missing"), None);
    }
}
