/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Code image of a live process, read from procfs.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use goblin::elf::program_header::PF_X;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use memmap2::Mmap;
use procfs::process::MMPermissions;
use procfs::process::MMapPath;
use procfs::process::Process;
use tracing::debug;
use tracing::warn;

use crate::error::ImageError;
use crate::image::map_file;
use crate::image::Image;
use crate::image::ImageProvider;

/// Builds images from the executable mappings of a running process.
///
/// File-backed mappings are memory-mapped from disk and cached across builds,
/// so rebuilding after the tracee loads a new library only maps the new file.
/// The vDSO and anonymous executable memory have no file behind them and are
/// copied out of `/proc/<pid>/mem`.
pub struct ProcessImageProvider {
    pid: i32,
    cache: HashMap<PathBuf, Arc<Mmap>>,
}

impl ProcessImageProvider {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            cache: HashMap::new(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn file(&mut self, path: &Path) -> Result<Arc<Mmap>, ImageError> {
        if let Some(map) = self.cache.get(path) {
            return Ok(map.clone());
        }
        let map = map_file(path)?;
        self.cache.insert(path.to_owned(), map.clone());
        Ok(map)
    }

    fn read_memory(&self, mem: &File, address: u64, len: u64) -> Result<Vec<u8>, ImageError> {
        let mut bytes = vec![0; len as usize];
        mem.read_exact_at(&mut bytes, address)
            .map_err(|source| ImageError::Memory { address, source })?;
        Ok(bytes)
    }
}

/// Adds the executable segment of the vDSO loaded at `base`. Falls back to
/// the whole mapping if it does not parse as an ELF.
fn add_vdso(image: &mut Image, base: u64, bytes: Vec<u8>) {
    let segments: Vec<(u64, Vec<u8>)> = match Elf::parse(&bytes) {
        Ok(elf) => {
            // The vDSO is linked at (or relative to) its first PT_LOAD.
            let bias = elf
                .program_headers
                .iter()
                .find(|ph| ph.p_type == PT_LOAD)
                .map_or(0, |ph| ph.p_vaddr);
            elf.program_headers
                .iter()
                .filter(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
                .filter_map(|ph| {
                    let start = ph.p_offset as usize;
                    let end = start.checked_add(ph.p_filesz as usize)?;
                    let code = bytes.get(start..end)?;
                    Some((base + (ph.p_vaddr - bias), code.to_vec()))
                })
                .collect()
        }
        Err(err) => {
            debug!("cannot parse vDSO at {:#x}: {}", base, err);
            Vec::new()
        }
    };

    if segments.is_empty() {
        image.add_bytes(base, bytes);
    } else {
        for (start, code) in segments {
            image.add_bytes(start, code);
        }
    }
}

impl ImageProvider for ProcessImageProvider {
    fn build_image(&mut self, exe: &Path) -> Result<Image, ImageError> {
        let pid = self.pid;
        let maps = Process::new(pid)
            .and_then(|process| process.maps())
            .map_err(|source| ImageError::Maps { pid, source })?;
        let mem = File::open(format!("/proc/{}/mem", pid)).map_err(|source| ImageError::File {
            path: PathBuf::from(format!("/proc/{}/mem", pid)),
            source,
        })?;

        let mut image = Image::new();
        for map in maps {
            if !map.perms.contains(MMPermissions::EXECUTE) {
                continue;
            }
            let (start, end) = map.address;
            let len = end - start;
            match &map.pathname {
                MMapPath::Path(path) => match self.file(path) {
                    Ok(file) => image.add_mapped(start, file, map.offset as usize, len as usize),
                    // Deleted or replaced files; the decoder reports a map
                    // miss if the tracee actually runs there.
                    Err(err) => warn!("skipping {:#x}-{:#x}: {}", start, end, err),
                },
                MMapPath::Vdso => {
                    let bytes = self.read_memory(&mem, start, len)?;
                    add_vdso(&mut image, start, bytes);
                }
                MMapPath::Anonymous => match self.read_memory(&mem, start, len) {
                    Ok(bytes) => image.add_bytes(start, bytes),
                    Err(err) => debug!("skipping anonymous code: {}", err),
                },
                // [vsyscall] cannot be read through /proc/<pid>/mem.
                _ => {}
            }
        }

        debug!(
            "built image for {} (pid {}): {} sections",
            exe.display(),
            pid,
            image.len()
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vdso_bytes() -> Vec<u8> {
        let mem = File::open("/proc/self/mem").unwrap();
        let maps = Process::myself().unwrap().maps().unwrap();
        let vdso = maps
            .into_iter()
            .find(|map| map.pathname == MMapPath::Vdso)
            .unwrap();
        let (start, end) = vdso.address;
        let mut bytes = vec![0; (end - start) as usize];
        mem.read_exact_at(&mut bytes, start).unwrap();
        bytes
    }

    #[test]
    fn own_image_has_our_code() {
        let exe = std::env::current_exe().unwrap();
        let mut provider = ProcessImageProvider::new(std::process::id() as i32);
        let image = provider.build_image(&exe).unwrap();

        let ip = own_image_has_our_code as usize as u64;
        assert!(image.contains(ip), "{:#x} not in {:?}", ip, image);

        let mut buf = [0; 4];
        assert_eq!(image.read(ip, &mut buf), Some(4));
        // SAFETY: reading the first bytes of a function of ours.
        let expected = unsafe { std::slice::from_raw_parts(ip as *const u8, 4) };
        assert_eq!(&buf, expected);

        // The second build reuses the cached file mappings.
        let cached = provider.cache.len();
        provider.build_image(&exe).unwrap();
        assert_eq!(provider.cache.len(), cached);
    }

    #[test]
    fn vdso_keeps_only_executable_segment() {
        let bytes = vdso_bytes();
        let mut image = Image::new();
        add_vdso(&mut image, 0x7000_0000, bytes.clone());
        assert!(!image.is_empty());

        let elf = Elf::parse(&bytes).unwrap();
        let bias = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_LOAD)
            .unwrap()
            .p_vaddr;
        let text = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
            .unwrap();
        let mut buf = [0; 1];
        assert_eq!(
            image.read(0x7000_0000 + text.p_vaddr - bias + text.p_filesz - 1, &mut buf),
            Some(1)
        );
    }

    #[test]
    fn unparsable_vdso_is_kept_whole() {
        let mut image = Image::new();
        add_vdso(&mut image, 0x1000, vec![0xcc; 64]);
        let mut buf = [0; 15];
        assert_eq!(image.read(0x1000, &mut buf), Some(15));
        assert!(image.contains(0x103f));
    }

    #[test]
    fn dead_process() {
        let mut provider = ProcessImageProvider::new(i32::MAX);
        let err = provider.build_image(Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, ImageError::Maps { .. }));
    }
}
