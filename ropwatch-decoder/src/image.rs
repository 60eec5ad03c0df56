/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::ImageError;

#[derive(Clone)]
enum SectionBytes {
    /// A slice of a read-only file mapping.
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
    /// Bytes copied out of the tracee.
    Owned(Arc<[u8]>),
}

impl SectionBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            SectionBytes::Mapped { map, offset, len } => &map[*offset..*offset + *len],
            SectionBytes::Owned(bytes) => bytes,
        }
    }
}

#[derive(Clone)]
struct Section {
    start: u64,
    bytes: SectionBytes,
}

impl Section {
    fn end(&self) -> u64 {
        self.start + self.bytes.as_slice().len() as u64
    }
}

/// The code of a process, indexed by virtual address. The decoder reads
/// instruction bytes from here since the trace itself only carries branch
/// outcomes.
#[derive(Clone, Default)]
pub struct Image {
    sections: Vec<Section>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bytes to be found at `start`. A section overlapping an existing
    /// one replaces it.
    pub fn add_bytes(&mut self, start: u64, bytes: Vec<u8>) {
        self.insert(Section {
            start,
            bytes: SectionBytes::Owned(bytes.into()),
        });
    }

    /// Adds `len` bytes of a file mapping, starting at `offset` within the
    /// file, to be found at `start`. The range is clamped to the file.
    pub fn add_mapped(&mut self, start: u64, map: Arc<Mmap>, offset: usize, len: usize) {
        if offset >= map.len() {
            return;
        }
        let len = len.min(map.len() - offset);
        self.insert(Section {
            start,
            bytes: SectionBytes::Mapped { map, offset, len },
        });
    }

    fn insert(&mut self, section: Section) {
        if section.bytes.as_slice().is_empty() {
            return;
        }
        let (start, end) = (section.start, section.end());
        self.sections
            .retain(|other| other.end() <= start || other.start >= end);
        let pos = self
            .sections
            .partition_point(|other| other.start < section.start);
        self.sections.insert(pos, section);
    }

    fn find(&self, ip: u64) -> Option<&Section> {
        let pos = self.sections.partition_point(|section| section.start <= ip);
        let section = self.sections.get(pos.checked_sub(1)?)?;
        (ip < section.end()).then_some(section)
    }

    /// True if `ip` falls inside one of the sections.
    pub fn contains(&self, ip: u64) -> bool {
        self.find(ip).is_some()
    }

    /// Copies the bytes at `ip` into `buf`, stopping at the end of the
    /// section. Returns how many bytes were copied, or `None` if nothing is
    /// mapped at `ip`.
    pub fn read(&self, ip: u64, buf: &mut [u8]) -> Option<usize> {
        let section = self.find(ip)?;
        let bytes = &section.bytes.as_slice()[(ip - section.start) as usize..];
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Some(len)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(
                self.sections
                    .iter()
                    .map(|section| format!("{:#x}-{:#x}", section.start, section.end())),
            )
            .finish()
    }
}

/// Maps a whole file read-only.
pub(crate) fn map_file(path: &Path) -> Result<Arc<Mmap>, ImageError> {
    let to_error = |source| ImageError::File {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(to_error)?;
    // SAFETY: the mapping is private and read-only. Code files being
    // rewritten underneath a running process is not something we protect
    // against.
    let map = unsafe { Mmap::map(&file) }.map_err(to_error)?;
    Ok(Arc::new(map))
}

/// Builds the code image the decoder reads instruction bytes from.
pub trait ImageProvider {
    /// Collects the code currently loaded for `exe`.
    fn build_image(&mut self, exe: &Path) -> Result<Image, ImageError>;
}

/// A fixed image is its own provider.
impl ImageProvider for Image {
    fn build_image(&mut self, _exe: &Path) -> Result<Image, ImageError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn reads_stop_at_section_end() {
        let mut image = Image::new();
        image.add_bytes(0x1000, vec![0x90, 0x90, 0xc3]);
        image.add_bytes(0x2000, vec![0xcc]);

        let mut buf = [0; 15];
        assert_eq!(image.read(0x1001, &mut buf), Some(2));
        assert_eq!(&buf[..2], &[0x90, 0xc3]);
        assert_eq!(image.read(0x2000, &mut buf), Some(1));
        assert_eq!(image.read(0x1003, &mut buf), None);
        assert_eq!(image.read(0xfff, &mut buf), None);
        assert!(image.contains(0x1002));
        assert!(!image.contains(0x2001));
    }

    #[test]
    fn overlapping_section_replaces_old_one() {
        let mut image = Image::new();
        image.add_bytes(0x1000, vec![0x90; 0x10]);
        image.add_bytes(0x1008, vec![0xc3; 0x10]);
        assert_eq!(image.len(), 1);

        let mut buf = [0; 1];
        assert_eq!(image.read(0x1000, &mut buf), None);
        assert_eq!(image.read(0x1008, &mut buf), Some(1));
        assert_eq!(buf[0], 0xc3);
    }

    #[test]
    fn debug_lists_ranges() {
        let mut image = Image::new();
        image.add_bytes(0x2000, vec![0xcc]);
        image.add_bytes(0x1000, vec![0x90; 0x10]);
        assert_eq!(
            format!("{:?}", image),
            r#"["0x1000-0x1010", "0x2000-0x2001"]"#
        );
    }

    #[test]
    fn empty_sections_are_ignored() {
        let mut image = Image::new();
        image.add_bytes(0x1000, Vec::new());
        assert!(image.is_empty());
    }

    #[test]
    fn file_backed_section() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee]).unwrap();
        file.flush().unwrap();

        let map = map_file(file.path()).unwrap();
        let mut image = Image::new();
        // Ask for more than the file holds.
        image.add_mapped(0x40_0000, map.clone(), 2, 0x1000);
        image.add_mapped(0x50_0000, map, 5, 0x1000);
        assert_eq!(image.len(), 1);

        let mut buf = [0; 15];
        assert_eq!(image.read(0x40_0000, &mut buf), Some(3));
        assert_eq!(&buf[..3], &[0xcc, 0xdd, 0xee]);
    }

    #[test]
    fn missing_file() {
        let err = map_file(Path::new("/nonexistent/libfoo.so")).unwrap_err();
        assert!(matches!(err, ImageError::File { .. }));
    }
}
