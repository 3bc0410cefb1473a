//! This module contains the binary loader: the read-only view of the
//! protected executable that serves section bytes by virtual address.
//!
//! The emulator's concrete memory is backed by an [`Image`], with bytes
//! copied lazily into the emulated address space on first access. The image
//! itself is immutable after load, so tracer forks share one instance.

use std::{path::Path, rc::Rc};

use exe::{Arch, ImageSectionHeader, VecPE, PE};

use crate::error::image::{Error, Result};

/// A shared, immutable handle to a loaded binary image.
pub type SharedImage = Rc<dyn Image>;

/// The read-only interface through which the emulator fetches bytes of the
/// protected binary.
pub trait Image {
    /// Reads `len` bytes starting at the virtual address `va`, returning
    /// [`None`] if the range is not fully covered by the image.
    fn bytes(&self, va: u64, len: usize) -> Option<Vec<u8>>;

    /// Checks whether the image is a 64-bit executable.
    fn is_x64(&self) -> bool;
}

/// A single mapped region of the image: the section's virtual range together
/// with its raw file bytes.
///
/// Virtual bytes past the end of the raw data (uninitialized section tails)
/// read as zero, matching what the operating system loader would map.
#[derive(Clone, Debug)]
struct Section {
    /// The virtual address at which the section is mapped.
    va: u64,

    /// The size of the section's virtual range in bytes.
    virtual_size: usize,

    /// The raw bytes of the section as stored in the file.
    data: Vec<u8>,
}

impl Section {
    /// Reads `len` bytes at `va` if the range lies within this section.
    fn bytes(&self, va: u64, len: usize) -> Option<Vec<u8>> {
        let offset = va.checked_sub(self.va)? as usize;
        if offset + len > self.virtual_size {
            return None;
        }
        let mut raw = Vec::with_capacity(len);
        for i in offset..offset + len {
            raw.push(self.data.get(i).copied().unwrap_or(0));
        }
        Some(raw)
    }
}

/// A portable-executable image opened from disk.
///
/// The section table and section contents are extracted eagerly at open time;
/// afterwards the image serves reads without touching the filesystem.
#[derive(Clone, Debug)]
pub struct PeImage {
    /// The mapped sections of the executable, sorted by virtual address.
    sections: Vec<Section>,

    /// Whether the executable is 64-bit.
    x64: bool,
}

impl PeImage {
    /// Opens and maps the portable executable at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the file cannot be read, is not a PE, or has a
    /// malformed section table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pe = VecPE::from_disk_file(path).map_err(|e| Error::Open {
            path:    path.display().to_string(),
            message: e.to_string(),
        })?;

        let x64 = matches!(pe.get_arch()?, Arch::X64);
        let base = pe.get_image_base()?;

        let mut sections = Vec::new();
        for header in pe.get_section_table()? {
            sections.push(Self::map_section(&pe, base, header)?);
        }
        sections.sort_by_key(|section| section.va);

        Ok(Self { sections, x64 })
    }

    /// Extracts one section's virtual range and raw bytes.
    fn map_section(pe: &VecPE, base: u64, header: &ImageSectionHeader) -> Result<Section> {
        let va = base + u64::from(header.virtual_address.0);
        let virtual_size = header.virtual_size.max(header.size_of_raw_data) as usize;
        let data = header
            .read(pe)
            .map_err(|e| Error::MalformedSections {
                message: e.to_string(),
            })?
            .to_vec();

        Ok(Section {
            va,
            virtual_size,
            data,
        })
    }

    /// Wraps the image into the shared handle consumed by the emulator.
    #[must_use]
    pub fn into_shared(self) -> SharedImage {
        Rc::new(self)
    }
}

impl Image for PeImage {
    fn bytes(&self, va: u64, len: usize) -> Option<Vec<u8>> {
        self.sections.iter().find_map(|section| section.bytes(va, len))
    }

    fn is_x64(&self) -> bool {
        self.x64
    }
}

/// An in-memory image mapping one flat byte range at a fixed base address.
///
/// This is the image used by the test fixtures, which assemble their VM
/// interpreters directly into a byte buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawImage {
    /// The virtual address at which `data` is mapped.
    base: u64,

    /// The mapped bytes.
    data: Vec<u8>,

    /// Whether the image should report itself as 64-bit.
    x64: bool,
}

impl RawImage {
    /// Constructs a new 64-bit flat image mapping `data` at `base`.
    #[must_use]
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        let x64 = true;
        Self { base, data, x64 }
    }

    /// Constructs a new 32-bit flat image mapping `data` at `base`.
    #[must_use]
    pub fn new_x86(base: u64, data: Vec<u8>) -> Self {
        let x64 = false;
        Self { base, data, x64 }
    }

    /// Wraps the image into the shared handle consumed by the emulator.
    #[must_use]
    pub fn into_shared(self) -> SharedImage {
        Rc::new(self)
    }
}

impl Image for RawImage {
    fn bytes(&self, va: u64, len: usize) -> Option<Vec<u8>> {
        let offset = va.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len)?;
        self.data.get(offset..end).map(<[u8]>::to_vec)
    }

    fn is_x64(&self) -> bool {
        self.x64
    }
}

#[cfg(test)]
mod test {
    use crate::image::{Image, RawImage};

    #[test]
    fn raw_image_serves_contained_ranges() {
        let image = RawImage::new(0x1000, vec![0xaa, 0xbb, 0xcc, 0xdd]);

        assert_eq!(image.bytes(0x1000, 2), Some(vec![0xaa, 0xbb]));
        assert_eq!(image.bytes(0x1002, 2), Some(vec![0xcc, 0xdd]));
        assert!(image.is_x64());
    }

    #[test]
    fn raw_image_rejects_out_of_range_reads() {
        let image = RawImage::new(0x1000, vec![0xaa, 0xbb]);

        assert_eq!(image.bytes(0x0fff, 1), None);
        assert_eq!(image.bytes(0x1001, 2), None);
        assert_eq!(image.bytes(0x2000, 1), None);
    }
}
